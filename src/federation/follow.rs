//! Inbound Follow / Undo handling
//!
//! A Follow is only stored once the remote inbox has accepted our Accept;
//! a blocked Follow is answered with Reject and leaves no follower behind.

use std::sync::Arc;

use serde_json::Value;

use crate::data::{Actor, Database, NewFollower};
use crate::error::AppError;
use crate::federation::delivery::ActivitySender;
use crate::federation::remote_actor::{RemoteActor, RemoteActorFetcher};
use crate::federation::signature::{
    InboundRequest, extract_signature_key_id, key_id_matches_actor, verify_request,
};
use crate::federation::uri::{addresses_local_actor, reference_id};
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Follow protocol settings
#[derive(Debug, Clone)]
pub struct FollowPolicy {
    /// Federation base URL local actor URIs live under
    pub base_url: String,
    /// Scheme addressed URIs are canonicalized to
    pub scheme: String,
    /// Verify HTTP signatures on Follow as well as on Undo
    pub require_signed_follow: bool,
    pub require_digest: bool,
}

/// Follow / Undo state machine for local actors
pub struct FollowHandler {
    db: Arc<Database>,
    sender: Arc<ActivitySender>,
    fetcher: Arc<RemoteActorFetcher>,
    policy: FollowPolicy,
}

fn required_id<'a>(activity: &'a Value, field: &str) -> Result<&'a str, AppError> {
    activity
        .get(field)
        .and_then(reference_id)
        .ok_or_else(|| AppError::Validation(format!("Activity is missing {}", field)))
}

fn as_remote_actor_error(error: AppError) -> AppError {
    match error {
        AppError::RemoteActor(_) => error,
        other => AppError::RemoteActor(other.to_string()),
    }
}

impl FollowHandler {
    pub fn new(
        db: Arc<Database>,
        sender: Arc<ActivitySender>,
        fetcher: Arc<RemoteActorFetcher>,
        policy: FollowPolicy,
    ) -> Self {
        Self {
            db,
            sender,
            fetcher,
            policy,
        }
    }

    /// Process an activity posted to `actor`'s inbox
    ///
    /// # Returns
    /// `true` when the activity changed follow state (or was refused),
    /// `false` when it was ignored.
    pub async fn process(
        &self,
        actor: &Actor,
        activity: &Value,
        request: &InboundRequest<'_>,
    ) -> Result<bool, AppError> {
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type])
            .inc();

        match activity_type {
            "Follow" => self.handle_follow(actor, activity, request).await,
            "Undo" => self.handle_undo(actor, activity, request).await,
            other => {
                tracing::debug!(actor = %actor.handle, activity_type = other, "Ignoring activity");
                Ok(false)
            }
        }
    }

    fn addresses(&self, actor: &Actor, addressed: &str) -> bool {
        addresses_local_actor(addressed, &actor.uri(&self.policy.base_url), &self.policy.scheme)
    }

    async fn fetch_remote(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        self.fetcher
            .fetch(actor_uri)
            .await
            .map_err(as_remote_actor_error)
    }

    /// Check the request signature against the remote actor's key
    fn verify_remote_signature(
        &self,
        remote: &RemoteActor,
        request: &InboundRequest<'_>,
    ) -> Result<(), AppError> {
        if !verify_request(
            remote.public_key_pem.as_deref(),
            request,
            self.policy.require_digest,
        ) {
            return Err(AppError::InvalidSignature);
        }

        let key_id = extract_signature_key_id(request.headers)?;
        let owns_key = key_id_matches_actor(&key_id, &remote.id)
            || remote.public_key_id.as_deref() == Some(key_id.as_str());
        if !owns_key {
            tracing::warn!(key_id = %key_id, actor = %remote.id, "Signature key does not belong to actor");
            return Err(AppError::InvalidSignature);
        }
        Ok(())
    }

    async fn is_refused(&self, actor: &Actor, remote: &RemoteActor) -> Result<bool, AppError> {
        if !actor.params.allow_follows {
            return Ok(true);
        }
        if self.db.is_domain_blocked(&remote.domain).await? {
            return Ok(true);
        }
        self.db.is_blocked(actor.id, &remote.handle, &remote.domain).await
    }

    /// Handle Follow activity
    async fn handle_follow(
        &self,
        actor: &Actor,
        activity: &Value,
        request: &InboundRequest<'_>,
    ) -> Result<bool, AppError> {
        // 1. Validate shape
        let follow_id = required_id(activity, "id")?;
        let remote_uri = required_id(activity, "actor")?;
        let target = required_id(activity, "object")?;

        // 2. Is this addressed to us?
        if !self.addresses(actor, target) {
            tracing::debug!(actor = %actor.handle, target, "Follow addressed to another actor");
            return Ok(false);
        }

        // 3. Who is asking?
        let remote = self.fetch_remote(remote_uri).await?;
        if self.policy.require_signed_follow {
            self.verify_remote_signature(&remote, request)?;
        }

        // 4. Refused follows get a Reject and no follower row.
        if self.is_refused(actor, &remote).await? {
            if let Err(e) = self.sender.send_reject(actor, activity, &remote.inbox).await {
                tracing::warn!(inbox = %remote.inbox, error = %e, "Failed to send Reject");
            }
            let removed = self.db.delete_follower_by_uri(actor.id, &remote.id).await?;
            tracing::info!(
                actor = %actor.handle,
                remote = %remote.id,
                removed,
                "Refused follow request"
            );
            return Ok(true);
        }

        // 5. Accept first; the follower is stored only after a 2xx.
        if let Err(e) = self.sender.send_accept(actor, activity, &remote.inbox).await {
            tracing::warn!(remote = %remote.id, error = %e, "Accept not delivered; follow discarded");
            return Err(e);
        }

        let follower_id = self
            .db
            .upsert_follower(&NewFollower {
                actor_id: actor.id,
                actor_uri: remote.id.clone(),
                handle: remote.handle.clone(),
                domain: remote.domain.clone(),
                follow_id: follow_id.to_string(),
                inbox: remote.inbox.clone(),
                shared_inbox: remote.shared_inbox.clone(),
            })
            .await?;
        tracing::info!(
            actor = %actor.handle,
            remote = %remote.id,
            follower_id,
            "Accepted follow request"
        );
        Ok(true)
    }

    /// Handle Undo{Follow} activity
    async fn handle_undo(
        &self,
        actor: &Actor,
        activity: &Value,
        request: &InboundRequest<'_>,
    ) -> Result<bool, AppError> {
        // 1. Validate shape
        required_id(activity, "id")?;
        let remote_uri = required_id(activity, "actor")?;
        let follow = activity
            .get("object")
            .filter(|object| object.is_object())
            .ok_or_else(|| AppError::Validation("Undo object must be an activity".to_string()))?;

        if follow.get("type").and_then(Value::as_str) != Some("Follow") {
            tracing::debug!(actor = %actor.handle, "Ignoring Undo of a non-Follow activity");
            return Ok(false);
        }
        let follow_id = required_id(follow, "id")?;

        // 2. Is the undone Follow addressed to us?
        let target = required_id(follow, "object")?;
        if !self.addresses(actor, target) {
            tracing::debug!(actor = %actor.handle, target, "Undo addressed to another actor");
            return Ok(false);
        }

        // 3. Only the follower itself may undo.
        let remote = self.fetch_remote(remote_uri).await?;
        self.verify_remote_signature(&remote, request)?;

        // 4. Remove the follower; an unknown one is fine.
        match self
            .db
            .find_follower(actor.id, &remote.id, follow_id)
            .await?
        {
            Some(follower) => {
                self.db.delete_follower(follower.id).await?;
                tracing::info!(actor = %actor.handle, remote = %remote.id, "Follower removed");
            }
            None => {
                tracing::info!(
                    actor = %actor.handle,
                    remote = %remote.id,
                    follow_id,
                    "Undo for unknown follower"
                );
            }
        }
        Ok(true)
    }
}
