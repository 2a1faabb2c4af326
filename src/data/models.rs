//! Data models
//!
//! Rust structs representing database entities.
//! Object and outbox records use ULID ids; everything else is keyed by
//! integer row ids.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Ids generated by one process are strictly increasing, so sorting
/// by id is the same as sorting by creation time.
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

static ULID_GENERATOR: Mutex<Option<ulid::Generator>> = Mutex::new(None);

impl EntityId {
    /// Generate a new monotonic ULID
    pub fn new() -> Self {
        let generated = ULID_GENERATOR.lock().ok().and_then(|mut guard| {
            guard
                .get_or_insert_with(ulid::Generator::new)
                .generate()
                .ok()
        });

        // Overflow of the random component within one millisecond is the
        // only failure; a fresh ULID is still time-ordered at ms precision.
        Self(generated.unwrap_or_else(ulid::Ulid::new).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Users (owned by the host platform)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub email: Option<String>,
    pub activation_pending: bool,
    pub blocked: bool,
    /// `None` when the user never answered the federation question
    pub federation_opt_in: Option<bool>,
    pub searchable_by_email: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub name: String,
    pub email: Option<String>,
    pub activation_pending: bool,
    pub federation_opt_in: Option<bool>,
    pub searchable_by_email: bool,
}

/// Administrator override attached to a user group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRule {
    Allow,
    Deny,
}

impl GroupRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRule::Allow => "allow",
            GroupRule::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(GroupRule::Allow),
            "deny" => Some(GroupRule::Deny),
            _ => None,
        }
    }
}

// =============================================================================
// Actors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActorKind {
    #[default]
    Person,
    Organization,
    Service,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Person => "Person",
            ActorKind::Organization => "Organization",
            ActorKind::Service => "Service",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Person" => Some(ActorKind::Person),
            "Organization" => Some(ActorKind::Organization),
            "Service" => Some(ActorKind::Service),
            _ => None,
        }
    }
}

/// Serialized RSA key pair (PKCS#8 private key, SPKI public key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyPair {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

fn default_allow_follows() -> bool {
    true
}

/// Parameter bag stored as JSON on the actor row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypair: Option<StoredKeyPair>,
    #[serde(default = "default_allow_follows")]
    pub allow_follows: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Settings owned by other integrations, preserved untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ActorParams {
    fn default() -> Self {
        Self {
            keypair: None,
            allow_follows: true,
            summary: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// A local federated identity
///
/// For actors linked to a user, `handle` and `name` come from the user row.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: i64,
    /// 0 for virtual actors
    pub user_id: i64,
    pub kind: ActorKind,
    pub handle: String,
    pub name: String,
    pub params: ActorParams,
    pub created_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_virtual(&self) -> bool {
        self.user_id == 0
    }

    /// Actor URI under the given federation base URL
    pub fn uri(&self, base_url: &str) -> String {
        format!("{}/actor/{}", base_url, self.handle)
    }

    pub fn key_id(&self, base_url: &str) -> String {
        format!("{}#main-key", self.uri(base_url))
    }

    pub fn inbox_uri(&self, base_url: &str) -> String {
        format!("{}/inbox", self.uri(base_url))
    }

    pub fn outbox_uri(&self, base_url: &str) -> String {
        format!("{}/outbox", self.uri(base_url))
    }

    pub fn followers_uri(&self, base_url: &str) -> String {
        format!("{}/followers", self.uri(base_url))
    }
}

// =============================================================================
// Followers / Blocks
// =============================================================================

/// A remote actor following a local actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub id: i64,
    pub actor_id: i64,
    /// Remote actor URI
    pub actor_uri: String,
    pub handle: String,
    pub domain: String,
    /// Id of the Follow activity, needed to match a later Undo
    pub follow_id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFollower {
    pub actor_id: i64,
    pub actor_uri: String,
    pub handle: String,
    pub domain: String,
    pub follow_id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub id: i64,
    pub actor_id: i64,
    pub handle: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Objects / Outbox
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Published,
    Tombstone,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Published => "published",
            ObjectStatus::Tombstone => "tombstone",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "published" => Some(ObjectStatus::Published),
            "tombstone" => Some(ObjectStatus::Tombstone),
            _ => None,
        }
    }
}

/// Federated representation of a piece of local content
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: EntityId,
    pub actor_id: i64,
    /// Content-type key the object was generated for
    pub context: String,
    /// Id of the originating content in the host platform
    pub reference: String,
    pub status: ObjectStatus,
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// An activity published by a local actor
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: EntityId,
    pub actor_id: i64,
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery queue
// =============================================================================

/// One pending delivery of an activity to a remote inbox
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueItem {
    pub id: i64,
    pub actor_id: i64,
    /// Set when the row serves exactly one follower; the row disappears
    /// with that follower
    pub follower_id: Option<i64>,
    pub inbox: String,
    /// Serialized activity, signed and posted as-is
    pub activity: String,
    pub retry_count: i64,
    /// Unix seconds
    pub next_attempt_at: i64,
    /// Unix seconds
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTarget {
    pub inbox: String,
    pub follower_id: Option<i64>,
}
