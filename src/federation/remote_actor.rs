//! Remote actor fetching
//!
//! Dereferences a remote actor URI and extracts what the follow protocol
//! needs: identity, inboxes and the public key.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use url::Url;

use crate::error::AppError;
use crate::federation::uri::{canonical_domain, reference_id};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const ACTIVITY_JSON: &str = "application/activity+json";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::RemoteActor(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::RemoteActor(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// A remote actor as seen by the follow protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActor {
    /// Actor URI
    pub id: String,
    /// `preferredUsername`
    pub handle: String,
    /// Canonical domain of the actor URI
    pub domain: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_pem: Option<String>,
    pub public_key_id: Option<String>,
}

/// Extract the follow-relevant fields from an actor document
///
/// `requested_uri` is the URI the document was fetched from; the document's
/// own `id` must live on the same host.
pub fn parse_remote_actor(doc: &Value, requested_uri: &str) -> Result<RemoteActor, AppError> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::RemoteActor("Actor document has no id".to_string()))?;

    let id_url =
        Url::parse(id).map_err(|e| AppError::RemoteActor(format!("Invalid actor id: {}", e)))?;
    let requested_url = Url::parse(requested_uri)
        .map_err(|e| AppError::RemoteActor(format!("Invalid actor URI: {}", e)))?;
    let host = id_url
        .host_str()
        .ok_or_else(|| AppError::RemoteActor("Actor id has no host".to_string()))?;
    if !requested_url
        .host_str()
        .is_some_and(|requested| requested.eq_ignore_ascii_case(host))
    {
        return Err(AppError::RemoteActor(format!(
            "Actor id {} does not belong to {}",
            id, requested_uri
        )));
    }

    let handle = doc
        .get("preferredUsername")
        .and_then(Value::as_str)
        .filter(|handle| !handle.is_empty())
        .ok_or_else(|| AppError::RemoteActor("Actor document has no preferredUsername".to_string()))?;

    let inbox = doc
        .get("inbox")
        .and_then(reference_id)
        .ok_or_else(|| AppError::RemoteActor("Actor document has no inbox".to_string()))?;

    let shared_inbox = doc
        .get("endpoints")
        .and_then(|endpoints| endpoints.get("sharedInbox"))
        .and_then(reference_id)
        .map(str::to_string);

    let public_key = doc.get("publicKey").map(|key| match key {
        // Some servers publish a list of keys; the first is the main key.
        Value::Array(keys) => keys.first().unwrap_or(&Value::Null),
        other => other,
    });
    let public_key_pem = public_key
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let public_key_id = public_key
        .and_then(|key| key.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RemoteActor {
        id: id.to_string(),
        handle: handle.to_string(),
        domain: canonical_domain(host),
        inbox: inbox.to_string(),
        shared_inbox,
        public_key_pem,
        public_key_id,
    })
}

/// Fetches remote actor documents
pub struct RemoteActorFetcher {
    http_client: Arc<reqwest::Client>,
    timeout: Duration,
    allow_insecure: bool,
}

impl RemoteActorFetcher {
    pub fn new(http_client: Arc<reqwest::Client>, timeout: Duration, allow_insecure: bool) -> Self {
        Self {
            http_client,
            timeout,
            allow_insecure,
        }
    }

    /// Validate an actor URI before dereferencing it.
    ///
    /// Only HTTPS and public hosts are accepted unless insecure remotes are
    /// allowed.
    pub async fn check_target(&self, uri: &str) -> Result<Url, AppError> {
        let parsed = Url::parse(uri)
            .map_err(|e| AppError::RemoteActor(format!("Invalid actor URI: {}", e)))?;

        match parsed.scheme() {
            "https" => {}
            "http" if self.allow_insecure => {}
            scheme => {
                return Err(AppError::RemoteActor(format!(
                    "Unsupported actor URI scheme: {}",
                    scheme
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::RemoteActor("Missing host in actor URI".to_string()))?;

        if !self.allow_insecure {
            if is_disallowed_host(host) {
                return Err(AppError::Forbidden);
            }
            let port = parsed
                .port_or_known_default()
                .ok_or_else(|| AppError::RemoteActor("Missing port in actor URI".to_string()))?;
            // Resolve DNS before fetching and reject local/private destinations.
            validate_resolved_host_ips(host, port).await?;
        }

        Ok(parsed)
    }

    /// Fetch and parse a remote actor
    ///
    /// # Errors
    /// `RemoteActor` on any network, status or document problem; `Forbidden`
    /// for hosts that resolve to private addresses.
    pub async fn fetch(&self, uri: &str) -> Result<RemoteActor, AppError> {
        let mut url = self.check_target(uri).await?;
        url.set_fragment(None);

        let start = Instant::now();
        let result = self
            .http_client
            .get(url.as_str())
            .header("Accept", ACTIVITY_JSON)
            .timeout(self.timeout)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(start.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            AppError::RemoteActor(format!("Failed to fetch actor {}: {}", url, e))
        })?;

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();
        if !status.is_success() {
            return Err(AppError::RemoteActor(format!(
                "Failed to fetch actor {}: HTTP {}",
                url, status
            )));
        }

        let doc: Value = response
            .json()
            .await
            .map_err(|e| AppError::RemoteActor(format!("Failed to parse actor: {}", e)))?;

        let actor = parse_remote_actor(&doc, url.as_str())?;
        tracing::debug!(actor = %actor.id, inbox = %actor.inbox, "Fetched remote actor");
        Ok(actor)
    }
}
