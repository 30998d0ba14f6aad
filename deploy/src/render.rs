//! Embedded manifest templates for the per-Gateway Envoy deployment and its
//! bootstrap configuration.

use ai_gateway_controller_core::{
    GatewayRef, ENVOY_BOOTSTRAP_FILE, SYSTEM_NAMESPACE, XDS_PORT, XDS_SERVICE_NAME,
};
use ai_gateway_controller_k8s_api::gateway::Gateway;
use anyhow::{Context as _, Result};
use lazy_static::lazy_static;
use serde::Serialize;
use tera::{Context, Tera};

lazy_static! {
    static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("base.yaml", include_str!("../templates/base.yaml")),
            ("bootstrap.yaml", include_str!("../templates/bootstrap.yaml")),
        ])
        .expect("embedded templates must parse");
        tera
    };
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ServicePortParams {
    pub name: String,
    pub port: i32,
    pub app_protocol: String,
}

/// Renders the Envoy bootstrap pointed at the control-plane service.
pub(crate) fn render_bootstrap(node_id: &str, gateway: &GatewayRef) -> Result<String> {
    let mut context = Context::new();
    context.insert("id", node_id);
    context.insert("cluster", &gateway.to_string());
    context.insert(
        "control_plane_address",
        &format!("{XDS_SERVICE_NAME}.{SYSTEM_NAMESPACE}.svc.cluster.local"),
    );
    context.insert("control_plane_port", &XDS_PORT);
    TEMPLATES
        .render("bootstrap.yaml", &context)
        .context("rendering Envoy bootstrap")
}

/// Renders the four per-Gateway manifests, split into individual documents.
pub(crate) fn render_gateway_manifests(
    node_id: &str,
    gateway_ref: &GatewayRef,
    gateway: &Gateway,
    envoy_image: &str,
) -> Result<Vec<String>> {
    let bootstrap = render_bootstrap(node_id, gateway_ref)?;

    let mut context = Context::new();
    context.insert("node_id", node_id);
    context.insert("namespace", &gateway_ref.namespace);
    context.insert("gateway_name", &gateway_ref.name);
    context.insert(
        "gateway_uid",
        gateway.metadata.uid.as_deref().unwrap_or_default(),
    );
    context.insert("envoy_image", envoy_image);
    context.insert("bootstrap_file_name", ENVOY_BOOTSTRAP_FILE);
    // The ConfigMap embeds the bootstrap under a block scalar.
    context.insert("bootstrap", &indent(&bootstrap, 4));
    context.insert("ports", &extract_service_ports(gateway));

    let rendered = TEMPLATES
        .render("base.yaml", &context)
        .context("rendering gateway manifests")?;
    Ok(split_yaml_documents(&rendered))
}

/// One ServicePort per unique listener port. Listener names allow periods
/// and 253 characters; port names do not.
pub(crate) fn extract_service_ports(gateway: &Gateway) -> Vec<ServicePortParams> {
    let mut seen = std::collections::BTreeSet::new();
    let mut ports = Vec::new();
    for (index, listener) in gateway.spec.listeners.iter().enumerate() {
        if !seen.insert(listener.port) {
            continue;
        }
        let mut name = sanitize_port_name(&listener.name);
        if name.is_empty() {
            name = format!("{}-{index}", listener.protocol.to_lowercase());
        }
        ports.push(ServicePortParams {
            name,
            port: listener.port,
            app_protocol: listener.protocol.to_lowercase(),
        });
    }
    ports
}

fn sanitize_port_name(name: &str) -> String {
    let name = name.replace('.', "-");
    if name.len() <= 63 {
        name
    } else {
        name[..63].to_string()
    }
}

fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits a multi-document YAML string on `---` separators, dropping empty
/// documents.
pub(crate) fn split_yaml_documents(rendered: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in rendered.lines() {
        if line.starts_with("---") {
            if !current.trim().is_empty() {
                documents.push(current.trim().to_string());
            }
            current = String::new();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        documents.push(current.trim().to_string());
    }
    documents
}
