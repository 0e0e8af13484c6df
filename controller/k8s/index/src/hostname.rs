/// Intersects a listener's hostname with a route's hostnames.
///
/// An empty result list means every hostname matches. `None` means the route
/// and the listener have no hostname in common.
///
/// A wildcard covers exactly one additional leading label, so
/// `*.example.com` matches `foo.example.com` but neither `example.com` nor
/// `a.b.example.com`.
pub(crate) fn intersect(listener: Option<&str>, route: &[String]) -> Option<Vec<String>> {
    let Some(listener) = listener.filter(|h| !h.is_empty()) else {
        let mut hostnames = route.to_vec();
        hostnames.sort();
        hostnames.dedup();
        return Some(hostnames);
    };
    if route.is_empty() {
        return Some(vec![listener.to_string()]);
    }

    let mut hostnames = route
        .iter()
        .filter_map(|route| intersect_one(listener, route))
        .collect::<Vec<_>>();
    hostnames.sort();
    hostnames.dedup();
    if hostnames.is_empty() {
        None
    } else {
        Some(hostnames)
    }
}

fn intersect_one(listener: &str, route: &str) -> Option<String> {
    if listener.eq_ignore_ascii_case(route) {
        return Some(route.to_ascii_lowercase());
    }
    match (wildcard_suffix(listener), wildcard_suffix(route)) {
        (Some(suffix), None) if covers(suffix, route) => Some(route.to_ascii_lowercase()),
        (None, Some(suffix)) if covers(suffix, listener) => Some(listener.to_ascii_lowercase()),
        _ => None,
    }
}

/// Returns `.example.com` for `*.example.com`.
fn wildcard_suffix(hostname: &str) -> Option<&str> {
    hostname.strip_prefix('*').filter(|s| s.starts_with('.'))
}

fn covers(suffix: &str, hostname: &str) -> bool {
    let (hostname, suffix) = (hostname.to_ascii_lowercase(), suffix.to_ascii_lowercase());
    match hostname.strip_suffix(&suffix) {
        Some(label) => !label.is_empty() && !label.contains('.'),
        None => false,
    }
}
