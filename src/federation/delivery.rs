//! Activity delivery
//!
//! Signs and posts single activities to remote inboxes. Fan-out to
//! followers goes through the delivery queue instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use crate::data::{Actor, EntityId};
use crate::error::AppError;
use crate::federation::remote_actor::ACTIVITY_JSON;
use crate::federation::signature::{SignatureHeaders, SignatureService, generate_digest};
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// A signed request ready to be posted
#[derive(Debug, Clone)]
pub struct PreparedDelivery {
    pub inbox: String,
    pub body: Vec<u8>,
    pub headers: SignatureHeaders,
}

/// POST a prepared delivery and return the response status
///
/// Transport failures (including the timeout) are returned as errors; any
/// HTTP answer, successful or not, is returned as a status.
pub async fn post_signed(
    http_client: &reqwest::Client,
    delivery: &PreparedDelivery,
    timeout: Duration,
) -> Result<reqwest::StatusCode, reqwest::Error> {
    let mut request = http_client
        .post(&delivery.inbox)
        .timeout(timeout)
        .header("Content-Type", ACTIVITY_JSON)
        .header("Host", &delivery.headers.host)
        .header("Date", &delivery.headers.date)
        .header("Signature", &delivery.headers.signature);

    if let Some(digest) = &delivery.headers.digest {
        request = request.header("Digest", digest);
    }

    let start = Instant::now();
    let result = request.body(delivery.body.clone()).send().await;
    FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["outbound"])
        .observe(start.elapsed().as_secs_f64());

    let status = result?.status();
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound", status.as_str()])
        .inc();
    Ok(status)
}

/// Synchronous activity sender
///
/// Used for replies that must happen inside the inbound request, such as
/// Accept and Reject.
pub struct ActivitySender {
    http_client: Arc<reqwest::Client>,
    signatures: Arc<SignatureService>,
    base_url: String,
    timeout: Duration,
}

impl ActivitySender {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        signatures: Arc<SignatureService>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            signatures,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Digest and sign `body` for a POST to `inbox` as `actor`
    pub async fn prepare(
        &self,
        actor: &Actor,
        inbox: &str,
        body: Vec<u8>,
    ) -> Result<PreparedDelivery, AppError> {
        let digest = generate_digest(&body);
        let headers = self
            .signatures
            .sign(actor, inbox, Utc::now(), Some(digest))
            .await?;

        Ok(PreparedDelivery {
            inbox: inbox.to_string(),
            body,
            headers,
        })
    }

    /// Deliver activity to a single inbox
    ///
    /// # Errors
    /// `Federation` if the request fails or the inbox answers non-2xx.
    pub async fn deliver(&self, actor: &Actor, inbox: &str, activity: &Value) -> Result<(), AppError> {
        let prepared = self.prepare_activity(actor, inbox, activity).await?;
        self.post(&prepared, activity_type_of(activity)).await
    }

    /// Serialize and sign `activity` without sending it
    async fn prepare_activity(
        &self,
        actor: &Actor,
        inbox: &str,
        activity: &Value,
    ) -> Result<PreparedDelivery, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {e}")))?;
        self.prepare(actor, inbox, body).await
    }

    /// POST an already signed delivery; fails unless the inbox answers 2xx
    async fn post(&self, prepared: &PreparedDelivery, activity_type: &str) -> Result<(), AppError> {
        let inbox = prepared.inbox.as_str();
        let status = post_signed(&self.http_client, prepared, self.timeout)
            .await
            .map_err(|e| {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound", "error"])
                    .inc();
                AppError::Federation(format!("Failed to deliver to {}: {}", inbox, e))
            })?;

        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox, status
            )));
        }

        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[activity_type])
            .inc();
        tracing::info!(inbox, activity_type, "Delivered activity");
        Ok(())
    }

    /// Send Accept for a Follow; fails unless the inbox answers 2xx
    pub async fn send_accept(&self, actor: &Actor, follow: &Value, inbox: &str) -> Result<(), AppError> {
        let actor_uri = actor.uri(&self.base_url);
        let accept_id = format!("{}/accept/{}", actor_uri, EntityId::new());
        let activity = builder::accept(&accept_id, &actor_uri, follow.clone());

        self.deliver(actor, inbox, &activity).await
    }

    /// Send Reject for a Follow
    pub async fn send_reject(&self, actor: &Actor, follow: &Value, inbox: &str) -> Result<(), AppError> {
        let actor_uri = actor.uri(&self.base_url);
        let reject_id = format!("{}/reject/{}", actor_uri, EntityId::new());
        let activity = builder::reject(&reject_id, &actor_uri, follow.clone());

        self.deliver(actor, inbox, &activity).await
    }
}

fn activity_type_of(activity: &Value) -> &str {
    activity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    use super::PUBLIC_AUDIENCE;

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    fn addressed(kind: &str, id: &str, actor: &str, followers: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": kind,
            "id": id,
            "actor": actor,
            "object": object,
            "to": [PUBLIC_AUDIENCE],
            "cc": [followers],
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Create activity addressed to the public and the followers
    pub fn create(id: &str, actor: &str, followers: &str, object: Value) -> Value {
        addressed("Create", id, actor, followers, object)
    }

    /// Build an Update activity for an object that was already published
    pub fn update(id: &str, actor: &str, followers: &str, object: Value) -> Value {
        addressed("Update", id, actor, followers, object)
    }

    /// Build a Delete activity carrying a Tombstone
    pub fn delete(id: &str, actor: &str, followers: &str, tombstone: Value) -> Value {
        addressed("Delete", id, actor, followers, tombstone)
    }

    /// Build a Tombstone standing in for a withdrawn object
    pub fn tombstone(id: &str, former_type: Option<&str>) -> Value {
        let mut object = serde_json::json!({
            "type": "Tombstone",
            "id": id,
            "deleted": chrono::Utc::now().to_rfc3339()
        });
        if let Some(former_type) = former_type {
            object["formerType"] = Value::String(former_type.to_string());
        }
        object
    }
}
