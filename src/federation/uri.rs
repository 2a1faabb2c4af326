//! URI and domain canonicalization for addressing checks

use url::Url;

pub(crate) fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Canonical form of a local actor URI.
///
/// Forces `scheme`, drops the scheme's default port and any fragment,
/// lowercases the host and trims a trailing slash. Returns `None` for
/// strings that are not absolute http(s) URLs.
pub fn canonicalize_actor_uri(uri: &str, scheme: &str) -> Option<String> {
    let mut parsed = Url::parse(uri.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }

    let explicit_port = parsed.port();
    if parsed.scheme() != scheme {
        parsed.set_scheme(scheme).ok()?;
    }
    // Url::port() hides default ports for the *original* scheme only.
    let port = explicit_port.or_else(|| parsed.port());
    let port = port.filter(|port| Some(*port) != default_port_for_scheme(scheme));
    parsed.set_port(port).ok()?;
    parsed.set_fragment(None);

    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);

    Some(parsed.to_string().trim_end_matches('/').to_string())
}

/// Whether `addressed` names the same local actor as `own_uri`
pub fn addresses_local_actor(addressed: &str, own_uri: &str, scheme: &str) -> bool {
    match (
        canonicalize_actor_uri(addressed, scheme),
        canonicalize_actor_uri(own_uri, scheme),
    ) {
        (Some(addressed), Some(own)) => addressed == own,
        _ => false,
    }
}

/// Lowercase, strip a trailing dot and a leading `www.`
pub fn canonical_domain(domain: &str) -> String {
    let lowered = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    match lowered.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

/// The id of a JSON-LD reference that may be inlined as an object
pub fn reference_id(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(id) => Some(id.as_str()),
        serde_json::Value::Object(map) => map.get("id").and_then(|id| id.as_str()),
        _ => None,
    }
    .filter(|id| !id.trim().is_empty())
}
