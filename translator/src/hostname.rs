//! Hostname intersection between listeners and routes.
//!
//! An absent listener hostname matches everything. A wildcard `*.example.com`
//! matches exactly one additional label (`api.example.com`, not
//! `a.b.example.com`, not `example.com` itself).

/// Whether a route with `route_hostnames` can attach to a listener with
/// `listener_hostname`.
pub(crate) fn hostnames_intersect(
    listener_hostname: Option<&str>,
    route_hostnames: &[String],
) -> bool {
    !intersecting_hostnames(listener_hostname, route_hostnames).is_empty()
}

/// The virtual-host domains produced by intersecting a listener hostname
/// with a route's hostname set.
pub(crate) fn intersecting_hostnames(
    listener_hostname: Option<&str>,
    route_hostnames: &[String],
) -> Vec<String> {
    match listener_hostname {
        // No listener hostname: the route's own hostnames stand, or the
        // wildcard domain when the route has none either.
        None | Some("") => {
            if route_hostnames.is_empty() {
                vec!["*".to_string()]
            } else {
                route_hostnames.to_vec()
            }
        }
        Some(listener) => {
            if route_hostnames.is_empty() {
                return vec![listener.to_string()];
            }
            let mut domains = Vec::new();
            for route in route_hostnames {
                if let Some(domain) = intersect(listener, route) {
                    domains.push(domain);
                }
            }
            domains
        }
    }
}

/// The more specific of two compatible hostnames, or `None` when they are
/// disjoint.
fn intersect(listener: &str, route: &str) -> Option<String> {
    if listener == route {
        return Some(route.to_string());
    }
    match (listener.strip_prefix("*."), route.strip_prefix("*.")) {
        (Some(suffix), None) => wildcard_matches(suffix, route).then(|| route.to_string()),
        (None, Some(suffix)) => wildcard_matches(suffix, listener).then(|| listener.to_string()),
        // Distinct wildcards never overlap under single-label matching.
        (Some(_), Some(_)) | (None, None) => None,
    }
}

/// Whether `hostname` is `<single label>.<suffix>`.
fn wildcard_matches(suffix: &str, hostname: &str) -> bool {
    hostname
        .strip_suffix(suffix)
        .and_then(|head| head.strip_suffix('.'))
        .is_some_and(|label| !label.is_empty() && !label.contains('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(hostnames: &[&str]) -> Vec<String> {
        hostnames.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn absent_listener_hostname_matches_everything() {
        assert_eq!(intersecting_hostnames(None, &[]), vec!["*"]);
        assert_eq!(
            intersecting_hostnames(None, &hosts(&["a.example.com"])),
            hosts(&["a.example.com"])
        );
        assert_eq!(intersecting_hostnames(Some(""), &[]), vec!["*"]);
    }

    #[test]
    fn exact_hostnames_must_match() {
        assert_eq!(
            intersecting_hostnames(Some("a.example.com"), &hosts(&["a.example.com"])),
            hosts(&["a.example.com"])
        );
        assert!(intersecting_hostnames(Some("a.example.com"), &hosts(&["b.example.com"]))
            .is_empty());
    }

    #[test]
    fn listener_wildcard_matches_one_label() {
        assert_eq!(
            intersecting_hostnames(Some("*.example.com"), &hosts(&["api.example.com"])),
            hosts(&["api.example.com"])
        );
        assert!(intersecting_hostnames(Some("*.example.com"), &hosts(&["a.b.example.com"]))
            .is_empty());
        assert!(
            intersecting_hostnames(Some("*.example.com"), &hosts(&["example.com"])).is_empty()
        );
    }

    #[test]
    fn route_wildcard_admits_concrete_listener() {
        assert_eq!(
            intersecting_hostnames(Some("api.example.com"), &hosts(&["*.example.com"])),
            hosts(&["api.example.com"])
        );
    }

    #[test]
    fn empty_route_hostnames_adopt_the_listener() {
        assert_eq!(
            intersecting_hostnames(Some("gw.example.com"), &[]),
            hosts(&["gw.example.com"])
        );
    }

    #[test]
    fn intersect_filters_mixed_sets() {
        let domains = intersecting_hostnames(
            Some("*.example.com"),
            &hosts(&["api.example.com", "other.org", "web.example.com"]),
        );
        assert_eq!(domains, hosts(&["api.example.com", "web.example.com"]));
    }
}
