#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod registry;

pub use self::backend::{
    Backend, BackendDestination, BackendExtension, BackendObjectReference, BackendPort,
    BackendProtocol, BackendProtocolOptions, BackendSpec, BackendStatus, BackendTarget,
    BackendTls, BackendTlsMode, McpProtocolOptions,
};
pub use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount, ServicePort},
        discovery::v1::{Endpoint, EndpointConditions, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    ByteString,
};
pub use kube::{
    api::{Api, DynamicObject, ObjectMeta, Patch, PatchParams},
    core::ApiResource,
    Client, Error, Resource, ResourceExt,
};

/// Gateway API types, re-exported the way this workspace consumes them.
pub mod gateway {
    pub use gateway_api::apis::standard::constants::{
        GatewayConditionReason, GatewayConditionType, ListenerConditionReason,
        ListenerConditionType, RouteConditionReason, RouteConditionType,
    };
    pub use gateway_api::apis::standard::gatewayclasses::{GatewayClass, GatewayClassStatus};
    pub use gateway_api::apis::standard::gateways::{
        Gateway, GatewayListeners, GatewayListenersAllowedRoutes,
        GatewayListenersAllowedRoutesKinds, GatewayListenersAllowedRoutesNamespaces,
        GatewayListenersAllowedRoutesNamespacesFrom,
        GatewayListenersAllowedRoutesNamespacesSelector, GatewayListenersTls,
        GatewayListenersTlsCertificateRefs, GatewaySpec, GatewayStatus, GatewayStatusAddresses,
        GatewayStatusListeners, GatewayStatusListenersSupportedKinds,
    };
    pub use gateway_api::apis::standard::httproutes::{
        HTTPRoute, HTTPRouteParentRefs, HTTPRouteRules, HTTPRouteRulesBackendRefs,
        HTTPRouteRulesFilters, HTTPRouteRulesFiltersRequestHeaderModifier,
        HTTPRouteRulesFiltersRequestRedirect, HTTPRouteRulesFiltersRequestRedirectPath,
        HTTPRouteRulesFiltersRequestRedirectPathType, HTTPRouteRulesFiltersRequestRedirectScheme,
        HTTPRouteRulesFiltersResponseHeaderModifier, HTTPRouteRulesFiltersType,
        HTTPRouteRulesFiltersUrlRewrite, HTTPRouteRulesFiltersUrlRewritePath,
        HTTPRouteRulesFiltersUrlRewritePathType, HTTPRouteRulesMatches,
        HTTPRouteRulesMatchesHeaders, HTTPRouteRulesMatchesHeadersType,
        HTTPRouteRulesMatchesPath, HTTPRouteRulesMatchesPathType,
        HTTPRouteRulesMatchesQueryParams, HTTPRouteRulesMatchesQueryParamsType, HTTPRouteSpec,
        HTTPRouteStatus, HTTPRouteStatusParents, HTTPRouteStatusParentsParentRef,
    };

    /// The Gateway API group.
    pub const GROUP: &str = "gateway.networking.k8s.io";
}

/// Namespace/name pair identifying a namespaced resource in the cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
