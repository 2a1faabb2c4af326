//! Content publication
//!
//! Turns host content events into stored objects, outbox activities and
//! queued deliveries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::data::{Actor, Database, EntityId, ObjectStatus, OutboxRecord, StoredObject};
use crate::error::AppError;
use crate::federation::{DeliveryQueue, builder};
use crate::service::Eligibility;

/// Produces the federated document for one kind of content
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectGenerator: Send + Sync {
    /// Document for `reference` published by `actor` under `object_uri`,
    /// or `None` when the content should not federate
    async fn generate(
        &self,
        actor: &Actor,
        reference: &str,
        object_uri: &str,
    ) -> Result<Option<Value>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEventKind {
    Published,
    Unpublished,
}

/// A change to a piece of host content
#[derive(Debug, Clone)]
pub struct ContentEvent {
    pub actor_id: i64,
    /// Content-type key a generator is registered under
    pub context: String,
    /// Id of the content in the host platform
    pub reference: String,
    pub kind: ContentEventKind,
}

/// What a handled event produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub object_id: EntityId,
    pub activity_id: EntityId,
    /// `Create`, `Update` or `Delete`
    pub activity_type: &'static str,
    /// Delivery rows queued
    pub queued: u64,
}

pub struct Publisher {
    db: Arc<Database>,
    queue: Arc<DeliveryQueue>,
    eligibility: Arc<Eligibility>,
    base_url: String,
    generators: RwLock<HashMap<String, Arc<dyn ObjectGenerator>>>,
}

impl Publisher {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<DeliveryQueue>,
        eligibility: Arc<Eligibility>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            queue,
            eligibility,
            base_url: base_url.into(),
            generators: RwLock::new(HashMap::new()),
        }
    }

    /// Register the generator for a content context, replacing any previous one
    pub async fn register(&self, context: impl Into<String>, generator: Arc<dyn ObjectGenerator>) {
        let context = context.into();
        tracing::debug!(context = %context, "Registered object generator");
        self.generators.write().await.insert(context, generator);
    }

    fn object_uri(&self, id: &EntityId) -> String {
        format!("{}/object/{}", self.base_url, id)
    }

    /// Handle a content event
    ///
    /// Returns `None` when the event produced nothing to federate.
    pub async fn handle_event(&self, event: &ContentEvent) -> Result<Option<PublishOutcome>, AppError> {
        let actor = self
            .db
            .get_actor(event.actor_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if !self.eligibility.actor_is_eligible(&actor).await? {
            tracing::debug!(actor = %actor.handle, "Actor does not federate; event skipped");
            return Ok(None);
        }

        let current = self
            .db
            .get_current_object(actor.id, &event.context, &event.reference)
            .await?
            .filter(|object| object.status == ObjectStatus::Published);

        let prepared = match event.kind {
            ContentEventKind::Published => self.publish(&actor, event, current).await?,
            ContentEventKind::Unpublished => match current {
                Some(object) => Some(self.withdraw(&actor, object).await?),
                None => None,
            },
        };
        let Some((object_id, activity_type, activity_id, activity)) = prepared else {
            return Ok(None);
        };

        self.db
            .upsert_outbox(&OutboxRecord {
                id: activity_id.clone(),
                actor_id: actor.id,
                document: activity.clone(),
                created_at: Utc::now(),
            })
            .await?;
        let queued = self.queue.enqueue_for_followers(actor.id, &activity).await?;

        tracing::info!(
            actor = %actor.handle,
            context = %event.context,
            reference = %event.reference,
            activity_type,
            queued,
            "Published activity"
        );

        Ok(Some(PublishOutcome {
            object_id,
            activity_id,
            activity_type,
            queued,
        }))
    }

    async fn publish(
        &self,
        actor: &Actor,
        event: &ContentEvent,
        current: Option<StoredObject>,
    ) -> Result<Option<(EntityId, &'static str, EntityId, Value)>, AppError> {
        let generator = self.generators.read().await.get(&event.context).cloned();
        let Some(generator) = generator else {
            tracing::debug!(context = %event.context, "No object generator registered");
            return Ok(None);
        };

        // A live object keeps its id; after a tombstone the content gets a new one.
        let (object_id, activity_type) = match current {
            Some(object) => (object.id, "Update"),
            None => (EntityId::new(), "Create"),
        };
        let object_uri = self.object_uri(&object_id);

        let Some(mut document) = generator.generate(actor, &event.reference, &object_uri).await?
        else {
            return Ok(None);
        };
        let actor_uri = actor.uri(&self.base_url);
        if let Some(fields) = document.as_object_mut() {
            fields.insert("id".to_string(), Value::String(object_uri));
            fields
                .entry("attributedTo")
                .or_insert_with(|| Value::String(actor_uri.clone()));
        }

        self.db
            .upsert_object(&StoredObject {
                id: object_id.clone(),
                actor_id: actor.id,
                context: event.context.clone(),
                reference: event.reference.clone(),
                status: ObjectStatus::Published,
                document: document.clone(),
                updated_at: Utc::now(),
            })
            .await?;

        let activity_id = EntityId::new();
        let activity_uri = self.object_uri(&activity_id);
        let followers = actor.followers_uri(&self.base_url);
        let activity = match activity_type {
            "Update" => builder::update(&activity_uri, &actor_uri, &followers, document),
            _ => builder::create(&activity_uri, &actor_uri, &followers, document),
        };

        Ok(Some((object_id, activity_type, activity_id, activity)))
    }

    async fn withdraw(
        &self,
        actor: &Actor,
        object: StoredObject,
    ) -> Result<(EntityId, &'static str, EntityId, Value), AppError> {
        let object_uri = self.object_uri(&object.id);
        let former_type = object.document.get("type").and_then(Value::as_str);
        let tombstone = builder::tombstone(&object_uri, former_type);

        self.db
            .upsert_object(&StoredObject {
                status: ObjectStatus::Tombstone,
                document: tombstone.clone(),
                updated_at: Utc::now(),
                ..object.clone()
            })
            .await?;

        let activity_id = EntityId::new();
        let activity = builder::delete(
            &self.object_uri(&activity_id),
            &actor.uri(&self.base_url),
            &actor.followers_uri(&self.base_url),
            tombstone,
        );

        Ok((object.id, "Delete", activity_id, activity))
    }
}
