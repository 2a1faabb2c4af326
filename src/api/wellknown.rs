//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{OriginalUri, RawQuery, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
};
use http::HeaderMap;

use crate::AppState;
use crate::error::AppError;

const JRD_JSON: &str = "application/jrd+json";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
}

/// `resource` and every `rel` from a WebFinger query string
fn parse_webfinger_query(query: Option<&str>) -> (Option<String>, Vec<String>) {
    let mut resource = None;
    let mut rels = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "resource" if resource.is_none() => resource = Some(value.into_owned()),
            "rel" => rels.push(value.into_owned()),
            _ => {}
        }
    }

    (resource, rels)
}

/// Scheme the client used, as reported by the proxy or configured
fn request_scheme(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| state.config.server.protocol.to_ascii_lowercase())
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain[&rel=...]
async fn webfinger(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if state.config.server.is_https() && request_scheme(&state, &headers) == "http" {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/.well-known/webfinger");
        let location = format!("https://{}{}", state.config.server.domain, path_and_query);
        return Ok(Redirect::permanent(&location).into_response());
    }

    let (resource, rels) = parse_webfinger_query(query.as_deref());
    let resource =
        resource.ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;

    match state.webfinger.lookup(&resource, &rels).await? {
        Some(jrd) => Ok(([(CONTENT_TYPE, JRD_JSON)], Json(jrd)).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "Not Found").into_response()),
    }
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/xrd+xml" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    ([(CONTENT_TYPE, "application/xrd+xml")], xml)
}

#[cfg(test)]
mod tests {
    use super::parse_webfinger_query;

    #[test]
    fn query_collects_repeated_rels() {
        let (resource, rels) = parse_webfinger_query(Some(
            "resource=acct%3Aalice%40example.com&rel=self&rel=http%3A%2F%2Fwebfinger.net%2Frel%2Fprofile-page",
        ));
        assert_eq!(resource.as_deref(), Some("acct:alice@example.com"));
        assert_eq!(rels, vec!["self", "http://webfinger.net/rel/profile-page"]);
    }

    #[test]
    fn query_without_resource() {
        let (resource, rels) = parse_webfinger_query(None);
        assert!(resource.is_none());
        assert!(rels.is_empty());
    }
}
