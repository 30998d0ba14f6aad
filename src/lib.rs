#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! AI Gateway Envoy controller.
//!
//! The controller watches Gateway API resources and the Backend custom
//! resource, reifies each accepted Gateway into a dedicated Envoy deployment,
//! and streams that Gateway's translated xDS configuration to its proxy over
//! ADS:
//!
//! ```ignore
//! watches -> index (dispatch) -> work queue -> worker
//!                                                |-> deployer (SSA)
//!                                                |-> translator -> xDS cache -> ADS
//!                                                `-> status writer
//! ```

pub mod queue;
pub mod reconciler;

pub use ai_gateway_controller_deploy as deploy;
pub use ai_gateway_controller_index as index;
pub use ai_gateway_controller_k8s_api as k8s;
pub use ai_gateway_controller_status as status;
pub use ai_gateway_controller_translator as translator;
pub use ai_gateway_controller_xds as xds;

pub use self::reconciler::Reconciler;
