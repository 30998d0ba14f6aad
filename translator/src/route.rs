//! HTTPRoute attachment and compilation: which listeners admit a route, and
//! what Envoy routes its rules and filters become.

use crate::cluster::{ResolvedBackend, ResolvedTarget};
use crate::{gateway_namespace, hostname, ClusterView};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ai_gateway_controller_core::{cluster_name, envoy_route_name, CONTROLLER_NAME};
use ai_gateway_controller_k8s_api::{
    gateway::{
        Gateway, GatewayListeners, GatewayListenersAllowedRoutesNamespacesFrom,
        GatewayListenersAllowedRoutesNamespacesSelector, HTTPRoute, HTTPRouteParentRefs,
        HTTPRouteRulesBackendRefs, HTTPRouteRulesFilters,
        HTTPRouteRulesFiltersRequestHeaderModifier, HTTPRouteRulesFiltersRequestRedirect,
        HTTPRouteRulesFiltersRequestRedirectPathType, HTTPRouteRulesFiltersRequestRedirectScheme,
        HTTPRouteRulesFiltersResponseHeaderModifier, HTTPRouteRulesFiltersType,
        HTTPRouteRulesFiltersUrlRewrite, HTTPRouteRulesFiltersUrlRewritePathType,
        HTTPRouteRulesMatches, HTTPRouteRulesMatchesHeadersType, HTTPRouteRulesMatchesMethod,
        HTTPRouteRulesMatchesPathType, HTTPRouteRulesMatchesQueryParamsType,
        HTTPRouteStatusParents, HTTPRouteStatusParentsParentRef, RouteConditionReason,
        RouteConditionType, GROUP,
    },
    Condition, Namespace, Resource, ResourceExt, ResourceId,
};
use ai_gateway_controller_status::conditions::new_condition;
use envoy_api_rs::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption,
};
use envoy_api_rs::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, query_parameter_matcher::QueryParameterMatchSpecifier,
    redirect_action, route::Action, route_action, route_match::PathSpecifier,
    weighted_cluster::cluster_weight, weighted_cluster::ClusterWeight, DirectResponseAction,
    HeaderMatcher, QueryParameterMatcher, RedirectAction, Route as EnvoyRoute, RouteAction,
    RouteMatch, WeightedCluster,
};
use envoy_api_rs::pb::envoy::r#type::matcher::v3::{
    regex_matcher, string_matcher::MatchPattern, RegexMatchAndSubstitute, RegexMatcher,
    StringMatcher,
};
use envoy_api_rs::pb::google::protobuf::UInt32Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A reference problem expressible as a `ResolvedRefs` condition rather than
/// a hard translation failure.
pub(crate) struct RouteRefError {
    pub reason: RouteConditionReason,
    pub message: String,
}

impl RouteRefError {
    fn new(reason: RouteConditionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Validates every route targeting the Gateway against each matching
/// parentRef, producing parent statuses for all of them and the listener
/// association for the accepted ones.
pub(crate) fn gather_routes(
    gateway: &Gateway,
    view: &ClusterView,
) -> (
    HashMap<String, Vec<Arc<HTTPRoute>>>,
    BTreeMap<ResourceId, Vec<HTTPRouteStatusParents>>,
) {
    let gateway_ns = gateway_namespace(gateway);
    let gateway_name = gateway.name_unchecked();

    let mut routes_by_listener: HashMap<String, Vec<Arc<HTTPRoute>>> = HashMap::new();
    let mut statuses = BTreeMap::new();

    // The cache hands routes in arbitrary order; translation output must not
    // depend on it.
    let mut routes: Vec<&Arc<HTTPRoute>> = view.routes.iter().collect();
    routes.sort_by_key(|route| (route.namespace(), route.name_unchecked()));

    for route in routes {
        let route_ns = route.namespace().unwrap_or_default();
        let route_name = route.name_unchecked();

        let (parent_statuses, accepting) =
            validate_route(gateway, &gateway_ns, &gateway_name, route, &route_ns, view);
        if parent_statuses.is_empty() {
            // No parentRef targets this Gateway.
            continue;
        }
        statuses.insert(ResourceId::new(&*route_ns, &*route_name), parent_statuses);

        let mut seen = HashSet::new();
        for listener in accepting {
            if seen.insert(listener.name.clone()) {
                routes_by_listener
                    .entry(listener.name.clone())
                    .or_default()
                    .push(route.clone());
            }
        }
    }

    (routes_by_listener, statuses)
}

fn parent_ref_targets(
    parent: &HTTPRouteParentRefs,
    gateway_ns: &str,
    gateway_name: &str,
    route_ns: &str,
) -> bool {
    parent.kind.as_deref().unwrap_or("Gateway") == "Gateway"
        && parent.name == gateway_name
        && parent.namespace.as_deref().unwrap_or(route_ns) == gateway_ns
}

/// Walks every parentRef of `route` that targets `gateway` and produces a
/// complete parent status for each, plus all listeners that accepted the
/// route.
fn validate_route<'g>(
    gateway: &'g Gateway,
    gateway_ns: &str,
    gateway_name: &str,
    route: &HTTPRoute,
    route_ns: &str,
    view: &ClusterView,
) -> (Vec<HTTPRouteStatusParents>, Vec<&'g GatewayListeners>) {
    let generation = route.meta().generation;
    let hostnames = route.spec.hostnames.clone().unwrap_or_default();

    let mut parent_statuses = Vec::new();
    let mut accepted: Vec<&'g GatewayListeners> = Vec::new();

    for parent in route.spec.parent_refs.iter().flatten() {
        if !parent_ref_targets(parent, gateway_ns, gateway_name, route_ns) {
            continue;
        }

        let mut listeners_for_ref = Vec::new();
        let mut rejection = RouteConditionReason::NoMatchingParent;

        for listener in &gateway.spec.listeners {
            let section_matches = parent
                .section_name
                .as_deref()
                .map_or(true, |section| section == listener.name);
            let port_matches = parent.port.map_or(true, |port| port == listener.port);
            if !(section_matches && port_matches) {
                continue;
            }

            if !allowed_by_listener(gateway_ns, listener, route_ns, view) {
                rejection = RouteConditionReason::NotAllowedByListeners;
                continue;
            }
            if !hostname::hostnames_intersect(listener.hostname.as_deref(), &hostnames) {
                rejection = RouteConditionReason::NoMatchingListenerHostname;
                continue;
            }
            listeners_for_ref.push(listener);
        }

        let accepted_condition = if listeners_for_ref.is_empty() {
            let message = match rejection {
                RouteConditionReason::NotAllowedByListeners => {
                    "Route is not allowed by a listener's policy."
                }
                RouteConditionReason::NoMatchingListenerHostname => {
                    "The route's hostnames do not match any listener hostnames."
                }
                _ => "No listener matched the parentRef.",
            };
            new_condition(
                RouteConditionType::Accepted,
                "False",
                rejection,
                message,
                generation,
            )
        } else {
            accepted.extend(listeners_for_ref.iter().copied());
            new_condition(
                RouteConditionType::Accepted,
                "True",
                RouteConditionReason::Accepted,
                "Route is accepted.",
                generation,
            )
        };

        // ResolvedRefs starts optimistic; backend resolution in the
        // compilation phase overwrites it for accepted parents.
        let resolved_condition = new_condition(
            RouteConditionType::ResolvedRefs,
            "True",
            RouteConditionReason::ResolvedRefs,
            "All references resolved",
            generation,
        );

        parent_statuses.push(HTTPRouteStatusParents {
            conditions: Some(vec![accepted_condition, resolved_condition]),
            controller_name: CONTROLLER_NAME.to_string(),
            parent_ref: HTTPRouteStatusParentsParentRef {
                group: parent.group.clone(),
                kind: parent.kind.clone(),
                name: parent.name.clone(),
                namespace: parent.namespace.clone(),
                port: parent.port,
                section_name: parent.section_name.clone(),
            },
        });
    }

    let mut deduped = Vec::new();
    let mut seen = HashSet::new();
    for listener in accepted {
        if seen.insert(listener.name.clone()) {
            deduped.push(listener);
        }
    }
    (parent_statuses, deduped)
}

/// Whether a listener's `allowedRoutes` policy admits the route's namespace
/// and kind.
fn allowed_by_listener(
    gateway_ns: &str,
    listener: &GatewayListeners,
    route_ns: &str,
    view: &ClusterView,
) -> bool {
    let allowed = listener.allowed_routes.as_ref();

    if let Some(kinds) = allowed.and_then(|a| a.kinds.as_ref()) {
        if !kinds.is_empty() {
            let supported = kinds.iter().any(|kind| {
                kind.kind == "HTTPRoute"
                    && kind.group.as_deref().map_or(true, |g| g.is_empty() || g == GROUP)
            });
            if !supported {
                return false;
            }
        }
    }

    let from = allowed
        .and_then(|a| a.namespaces.as_ref())
        .and_then(|ns| ns.from.clone())
        .unwrap_or(GatewayListenersAllowedRoutesNamespacesFrom::Same);
    match from {
        GatewayListenersAllowedRoutesNamespacesFrom::All => true,
        GatewayListenersAllowedRoutesNamespacesFrom::Same => route_ns == gateway_ns,
        GatewayListenersAllowedRoutesNamespacesFrom::Selector => {
            let Some(selector) = allowed
                .and_then(|a| a.namespaces.as_ref())
                .and_then(|ns| ns.selector.as_ref())
            else {
                return false;
            };
            view.namespace(route_ns)
                .is_some_and(|ns| selector_matches(selector, ns))
        }
    }
}

/// Kubernetes label-selector semantics over a namespace's labels:
/// `NotIn` and `DoesNotExist` also match objects missing the key.
fn selector_matches(
    selector: &GatewayListenersAllowedRoutesNamespacesSelector,
    namespace: &Namespace,
) -> bool {
    let empty = std::collections::BTreeMap::new();
    let labels = namespace.meta().labels.as_ref().unwrap_or(&empty);

    if let Some(required) = &selector.match_labels {
        for (key, value) in required {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let actual = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        let ok = match expr.operator.as_str() {
            "In" => actual.is_some_and(|v| values.contains(v)),
            "NotIn" => !actual.is_some_and(|v| values.contains(v)),
            "Exists" => actual.is_some(),
            "DoesNotExist" => actual.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// The output of compiling one HTTPRoute for one listener.
pub(crate) struct CompiledRoute {
    pub envoy_routes: Vec<EnvoyRoute>,
    pub backends: Vec<ResolvedBackend>,
    /// The route-level `ResolvedRefs` outcome.
    pub resolved_refs: Condition,
}

/// Compiles one HTTPRoute: filters, matches, backends, and route assembly
/// for every rule, in declared order.
pub(crate) fn compile_route(route: &HTTPRoute, view: &ClusterView) -> CompiledRoute {
    let route_ns = route.namespace().unwrap_or_default();
    let route_name = route.name_unchecked();
    let generation = route.meta().generation;

    let mut envoy_routes = Vec::new();
    let mut backends = Vec::new();
    let mut resolved_refs = resolved_condition(generation);

    for (rule_index, rule) in route.spec.rules.iter().flatten().enumerate() {
        let mut redirect: Option<RedirectAction> = None;
        let mut request_headers_to_add = Vec::new();
        let mut request_headers_to_remove = Vec::new();
        let mut response_headers_to_add = Vec::new();
        let mut response_headers_to_remove = Vec::new();
        let mut rewrite: Option<Rewrite> = None;

        for filter in rule.filters.iter().flatten() {
            match filter.r#type {
                HTTPRouteRulesFiltersType::RequestRedirect => {
                    redirect = filter.request_redirect.as_ref().map(translate_redirect);
                    if redirect.is_some() {
                        // Only one redirect applies; later filters in this
                        // rule are ignored.
                        break;
                    }
                }
                HTTPRouteRulesFiltersType::RequestHeaderModifier => {
                    if let Some(modifier) = &filter.request_header_modifier {
                        let (add, remove) = request_header_modifier(modifier);
                        request_headers_to_add.extend(add);
                        request_headers_to_remove.extend(remove);
                    }
                }
                HTTPRouteRulesFiltersType::ResponseHeaderModifier => {
                    if let Some(modifier) = &filter.response_header_modifier {
                        let (add, remove) = response_header_modifier(modifier);
                        response_headers_to_add.extend(add);
                        response_headers_to_remove.extend(remove);
                    }
                }
                HTTPRouteRulesFiltersType::UrlRewrite => {
                    rewrite = filter.url_rewrite.as_ref().and_then(translate_rewrite);
                }
                HTTPRouteRulesFiltersType::ExtensionRef => {
                    tracing::info!(
                        route = %route_name,
                        filter = ?filter.extension_ref,
                        "ExtensionRef filters are not implemented"
                    );
                }
                _ => {
                    tracing::warn!(route = %route_name, filter = ?unsupported_filter_name(filter), "Unsupported HTTPRoute filter type");
                }
            }
        }

        let matches: Vec<HTTPRouteRulesMatches> = match &rule.matches {
            Some(matches) if !matches.is_empty() => matches.clone(),
            _ => vec![HTTPRouteRulesMatches::default()],
        };

        for (match_index, rule_match) in matches.iter().enumerate() {
            let route_match = match translate_match(rule_match) {
                Ok(route_match) => route_match,
                Err(error) => {
                    resolved_refs = failure_condition(&error, generation);
                    continue;
                }
            };

            let mut envoy_route = EnvoyRoute {
                name: envoy_route_name(&route_ns, &route_name, rule_index, match_index),
                r#match: Some(route_match),
                request_headers_to_add: request_headers_to_add.clone(),
                request_headers_to_remove: request_headers_to_remove.clone(),
                response_headers_to_add: response_headers_to_add.clone(),
                response_headers_to_remove: response_headers_to_remove.clone(),
                ..Default::default()
            };

            if let Some(redirect) = &redirect {
                envoy_route.action = Some(Action::Redirect(redirect.clone()));
                envoy_routes.push(envoy_route);
                continue;
            }

            match build_route_action(&route_ns, rule.backend_refs.as_deref().unwrap_or(&[]), view)
            {
                Ok((mut action, rule_backends)) => {
                    backends.extend(rule_backends);
                    if let Some(rewrite) = &rewrite {
                        action.host_rewrite_specifier = rewrite
                            .host
                            .clone()
                            .map(route_action::HostRewriteSpecifier::HostRewriteLiteral);
                        action.regex_rewrite = rewrite.regex.clone();
                        if let Some(prefix) = &rewrite.prefix {
                            action.prefix_rewrite = prefix.clone();
                        }
                    }
                    envoy_route.action = Some(Action::Route(action));
                }
                Err(error) => {
                    // A defined failure: requests that would have hit the
                    // invalid backends get a 500.
                    resolved_refs = failure_condition(&error, generation);
                    envoy_route.action = Some(Action::DirectResponse(DirectResponseAction {
                        status: 500,
                        ..Default::default()
                    }));
                }
            }
            envoy_routes.push(envoy_route);
        }
    }

    sort_routes(&mut envoy_routes);

    CompiledRoute {
        envoy_routes,
        backends,
        resolved_refs,
    }
}

fn unsupported_filter_name(filter: &HTTPRouteRulesFilters) -> &'static str {
    match filter.r#type {
        HTTPRouteRulesFiltersType::RequestMirror => "RequestMirror",
        _ => "unknown",
    }
}

fn resolved_condition(generation: Option<i64>) -> Condition {
    new_condition(
        RouteConditionType::ResolvedRefs,
        "True",
        RouteConditionReason::ResolvedRefs,
        "All references resolved",
        generation,
    )
}

fn failure_condition(error: &RouteRefError, generation: Option<i64>) -> Condition {
    new_condition(
        RouteConditionType::ResolvedRefs,
        "False",
        &error.reason,
        error.message.clone(),
        generation,
    )
}

struct Rewrite {
    host: Option<String>,
    regex: Option<RegexMatchAndSubstitute>,
    prefix: Option<String>,
}

fn translate_redirect(redirect: &HTTPRouteRulesFiltersRequestRedirect) -> RedirectAction {
    let mut action = RedirectAction::default();

    if let Some(scheme) = &redirect.scheme {
        let scheme = match scheme {
            HTTPRouteRulesFiltersRequestRedirectScheme::Http => "http",
            HTTPRouteRulesFiltersRequestRedirectScheme::Https => "https",
        };
        action.scheme_rewrite_specifier = Some(redirect_action::SchemeRewriteSpecifier::SchemeRedirect(
            scheme.to_string(),
        ));
    }

    if let Some(hostname) = &redirect.hostname {
        action.host_redirect = hostname.clone();
    }

    if let Some(path) = &redirect.path {
        match path.r#type {
            HTTPRouteRulesFiltersRequestRedirectPathType::ReplaceFullPath => {
                if let Some(full) = &path.replace_full_path {
                    action.path_rewrite_specifier =
                        Some(redirect_action::PathRewriteSpecifier::PathRedirect(full.clone()));
                }
            }
            HTTPRouteRulesFiltersRequestRedirectPathType::ReplacePrefixMatch => {
                if let Some(prefix) = &path.replace_prefix_match {
                    action.path_rewrite_specifier =
                        Some(redirect_action::PathRewriteSpecifier::PrefixRewrite(prefix.clone()));
                }
            }
        }
    }

    if let Some(port) = redirect.port {
        action.port_redirect = port as u32;
    }

    action.response_code = match redirect.status_code.unwrap_or(302) {
        301 => redirect_action::RedirectResponseCode::MovedPermanently,
        303 => redirect_action::RedirectResponseCode::SeeOther,
        307 => redirect_action::RedirectResponseCode::TemporaryRedirect,
        308 => redirect_action::RedirectResponseCode::PermanentRedirect,
        _ => redirect_action::RedirectResponseCode::Found,
    } as i32;

    action
}

fn translate_rewrite(rewrite: &HTTPRouteRulesFiltersUrlRewrite) -> Option<Rewrite> {
    let mut out = Rewrite {
        host: rewrite.hostname.clone(),
        regex: None,
        prefix: None,
    };

    if let Some(path) = &rewrite.path {
        match path.r#type {
            HTTPRouteRulesFiltersUrlRewritePathType::ReplaceFullPath => {
                if let Some(full) = &path.replace_full_path {
                    out.regex = Some(RegexMatchAndSubstitute {
                        pattern: Some(google_re2(".*")),
                        substitution: full.clone(),
                    });
                }
            }
            HTTPRouteRulesFiltersUrlRewritePathType::ReplacePrefixMatch => {
                out.prefix = path.replace_prefix_match.clone();
            }
        }
    }

    if out.host.is_none() && out.regex.is_none() && out.prefix.is_none() {
        return None;
    }
    Some(out)
}

fn header_value_options(
    set: impl Iterator<Item = (String, String)>,
    add: impl Iterator<Item = (String, String)>,
) -> Vec<HeaderValueOption> {
    let mut options = Vec::new();
    for (key, value) in set {
        options.push(HeaderValueOption {
            header: Some(HeaderValue {
                key,
                value,
                ..Default::default()
            }),
            append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
            ..Default::default()
        });
    }
    for (key, value) in add {
        options.push(HeaderValueOption {
            header: Some(HeaderValue {
                key,
                value,
                ..Default::default()
            }),
            append_action: HeaderAppendAction::AppendIfExistsOrAdd as i32,
            ..Default::default()
        });
    }
    options
}

fn request_header_modifier(
    modifier: &HTTPRouteRulesFiltersRequestHeaderModifier,
) -> (Vec<HeaderValueOption>, Vec<String>) {
    let set = modifier
        .set
        .iter()
        .flatten()
        .map(|h| (h.name.clone(), h.value.clone()));
    let add = modifier
        .add
        .iter()
        .flatten()
        .map(|h| (h.name.clone(), h.value.clone()));
    (
        header_value_options(set, add),
        modifier.remove.clone().unwrap_or_default(),
    )
}

fn response_header_modifier(
    modifier: &HTTPRouteRulesFiltersResponseHeaderModifier,
) -> (Vec<HeaderValueOption>, Vec<String>) {
    let set = modifier
        .set
        .iter()
        .flatten()
        .map(|h| (h.name.clone(), h.value.clone()));
    let add = modifier
        .add
        .iter()
        .flatten()
        .map(|h| (h.name.clone(), h.value.clone()));
    (
        header_value_options(set, add),
        modifier.remove.clone().unwrap_or_default(),
    )
}

fn google_re2(regex: &str) -> RegexMatcher {
    RegexMatcher {
        engine_type: Some(regex_matcher::EngineType::GoogleRe2(
            regex_matcher::GoogleRe2::default(),
        )),
        regex: regex.to_string(),
    }
}

fn exact_string_matcher(value: &str) -> StringMatcher {
    StringMatcher {
        match_pattern: Some(MatchPattern::Exact(value.to_string())),
        ..Default::default()
    }
}

/// Gateway API HTTPRouteMatch to Envoy RouteMatch.
pub(crate) fn translate_match(
    rule_match: &HTTPRouteRulesMatches,
) -> Result<RouteMatch, RouteRefError> {
    let mut route_match = RouteMatch::default();

    if let Some(path) = &rule_match.path {
        let path_type = path
            .r#type
            .clone()
            .unwrap_or(HTTPRouteRulesMatchesPathType::PathPrefix);
        let value = path.value.clone().ok_or_else(|| {
            RouteRefError::new(
                RouteConditionReason::UnsupportedValue,
                "path match value cannot be nil",
            )
        })?;

        route_match.path_specifier = Some(match path_type {
            HTTPRouteRulesMatchesPathType::Exact => PathSpecifier::Path(value),
            HTTPRouteRulesMatchesPathType::PathPrefix => {
                if value == "/" {
                    PathSpecifier::Prefix("/".to_string())
                } else {
                    PathSpecifier::PathSeparatedPrefix(value.trim_end_matches('/').to_string())
                }
            }
            HTTPRouteRulesMatchesPathType::RegularExpression => {
                PathSpecifier::SafeRegex(google_re2(&value))
            }
        });
    } else {
        // A nil path match defaults to matching everything.
        route_match.path_specifier = Some(PathSpecifier::Prefix("/".to_string()));
    }

    for header in rule_match.headers.iter().flatten() {
        let match_type = header
            .r#type
            .clone()
            .unwrap_or(HTTPRouteRulesMatchesHeadersType::Exact);
        let specifier = match match_type {
            HTTPRouteRulesMatchesHeadersType::Exact => {
                HeaderMatchSpecifier::StringMatch(exact_string_matcher(&header.value))
            }
            HTTPRouteRulesMatchesHeadersType::RegularExpression => {
                HeaderMatchSpecifier::SafeRegexMatch(google_re2(&header.value))
            }
        };
        route_match.headers.push(HeaderMatcher {
            name: header.name.clone(),
            header_match_specifier: Some(specifier),
            ..Default::default()
        });
    }

    for query in rule_match.query_params.iter().flatten() {
        // Only exact matching is supported for query parameters.
        if matches!(
            query.r#type,
            Some(HTTPRouteRulesMatchesQueryParamsType::RegularExpression)
        ) {
            return Err(RouteRefError::new(
                RouteConditionReason::UnsupportedValue,
                format!("unsupported query parameter match type for {}", query.name),
            ));
        }
        route_match.query_parameters.push(QueryParameterMatcher {
            name: query.name.clone(),
            query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::StringMatch(
                exact_string_matcher(&query.value),
            )),
        });
    }

    if let Some(method) = &rule_match.method {
        let method = match method {
            HTTPRouteRulesMatchesMethod::Get => "GET",
            HTTPRouteRulesMatchesMethod::Head => "HEAD",
            HTTPRouteRulesMatchesMethod::Post => "POST",
            HTTPRouteRulesMatchesMethod::Put => "PUT",
            HTTPRouteRulesMatchesMethod::Delete => "DELETE",
            HTTPRouteRulesMatchesMethod::Connect => "CONNECT",
            HTTPRouteRulesMatchesMethod::Options => "OPTIONS",
            HTTPRouteRulesMatchesMethod::Trace => "TRACE",
            HTTPRouteRulesMatchesMethod::Patch => "PATCH",
        };
        route_match.headers.push(HeaderMatcher {
            name: ":method".to_string(),
            header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(
                exact_string_matcher(method),
            )),
            ..Default::default()
        });
    }

    Ok(route_match)
}

/// Resolves every backendRef and assembles the weighted forwarding action.
fn build_route_action(
    route_ns: &str,
    backend_refs: &[HTTPRouteRulesBackendRefs],
    view: &ClusterView,
) -> Result<(RouteAction, Vec<ResolvedBackend>), RouteRefError> {
    let mut clusters = Vec::new();
    let mut backends = Vec::new();

    for backend_ref in backend_refs {
        let backend = resolve_backend(route_ns, backend_ref, view)?;

        let weight = backend_ref.weight.unwrap_or(1);
        if weight > 0 {
            let port = backend.route_port(backend_ref.port);
            let mut cluster = ClusterWeight {
                name: cluster_name(&backend.id.namespace, &backend.id.name, port),
                weight: Some(UInt32Value {
                    value: weight as u32,
                }),
                ..Default::default()
            };
            if let ResolvedTarget::Dns { hostname } = &backend.target {
                cluster.host_rewrite_specifier = Some(
                    cluster_weight::HostRewriteSpecifier::HostRewriteLiteral(hostname.clone()),
                );
            }
            clusters.push(cluster);
        }
        backends.push(backend);
    }

    if clusters.is_empty() {
        return Err(RouteRefError::new(
            RouteConditionReason::UnsupportedValue,
            "no valid backends provided with a weight > 0",
        ));
    }

    let action = RouteAction {
        cluster_specifier: Some(route_action::ClusterSpecifier::WeightedClusters(
            WeightedCluster {
                clusters,
                ..Default::default()
            },
        )),
        ..Default::default()
    };
    Ok((action, backends))
}

/// A backendRef becomes a [`ResolvedBackend`], either from a Backend
/// resource or synthesized from a Service.
fn resolve_backend(
    route_ns: &str,
    backend_ref: &HTTPRouteRulesBackendRefs,
    view: &ClusterView,
) -> Result<ResolvedBackend, RouteRefError> {
    let namespace = backend_ref.namespace.as_deref().unwrap_or(route_ns);

    match backend_ref.kind.as_deref().unwrap_or("Service") {
        "Backend" => {
            let backend = view.backend(namespace, &backend_ref.name).ok_or_else(|| {
                RouteRefError::new(
                    RouteConditionReason::BackendNotFound,
                    format!("Backend {namespace}/{} not found", backend_ref.name),
                )
            })?;
            Ok(ResolvedBackend::from_backend(
                namespace,
                &backend_ref.name,
                backend,
            ))
        }
        "Service" => {
            let service = view.service(namespace, &backend_ref.name).ok_or_else(|| {
                RouteRefError::new(
                    RouteConditionReason::BackendNotFound,
                    format!("Service {namespace}/{} not found", backend_ref.name),
                )
            })?;
            Ok(ResolvedBackend::from_service(
                namespace,
                &backend_ref.name,
                service,
                backend_ref.port,
            ))
        }
        kind => Err(RouteRefError::new(
            RouteConditionReason::UnsupportedValue,
            format!("unsupported backend kind: {kind}"),
        )),
    }
}

/// Gateway API route precedence, catch-alls last. The sort is stable so
/// equal routes keep their declared order.
pub(crate) fn sort_routes(routes: &mut [EnvoyRoute]) {
    routes.sort_by(|a, b| {
        let (a, b) = (a.r#match.as_ref(), b.r#match.as_ref());

        // Catch-alls sink to the tail.
        let catch_all = is_catch_all(a).cmp(&is_catch_all(b));
        if catch_all != std::cmp::Ordering::Equal {
            return catch_all;
        }

        // Exact path beats any other path match.
        let exact = is_exact_path(b).cmp(&is_exact_path(a));
        if exact != std::cmp::Ordering::Equal {
            return exact;
        }

        // Longer paths first.
        let length = path_match_value(b).len().cmp(&path_match_value(a).len());
        if length != std::cmp::Ordering::Equal {
            return length;
        }

        // More header predicates first.
        let headers = header_count(b).cmp(&header_count(a));
        if headers != std::cmp::Ordering::Equal {
            return headers;
        }

        // More query predicates first.
        query_count(b).cmp(&query_count(a))
    });
}

fn is_exact_path(route_match: Option<&RouteMatch>) -> bool {
    matches!(
        route_match.and_then(|m| m.path_specifier.as_ref()),
        Some(PathSpecifier::Path(_))
    )
}

fn header_count(route_match: Option<&RouteMatch>) -> usize {
    route_match.map_or(0, |m| m.headers.len())
}

fn query_count(route_match: Option<&RouteMatch>) -> usize {
    route_match.map_or(0, |m| m.query_parameters.len())
}

fn path_match_value(route_match: Option<&RouteMatch>) -> String {
    match route_match.and_then(|m| m.path_specifier.as_ref()) {
        Some(PathSpecifier::Path(path)) => path.clone(),
        Some(PathSpecifier::Prefix(prefix)) => prefix.clone(),
        Some(PathSpecifier::PathSeparatedPrefix(prefix)) => prefix.clone(),
        Some(PathSpecifier::SafeRegex(regex)) => regex
            .regex
            .trim_end_matches("(/.*)?")
            .replace('\\', ""),
        _ => String::new(),
    }
}

/// A catch-all matches `/` as a plain prefix with no other predicates.
pub(crate) fn is_catch_all(route_match: Option<&RouteMatch>) -> bool {
    let Some(route_match) = route_match else {
        return false;
    };
    matches!(
        route_match.path_specifier.as_ref(),
        Some(PathSpecifier::Prefix(prefix)) if prefix == "/"
    ) && route_match.headers.is_empty()
        && route_match.query_parameters.is_empty()
}
