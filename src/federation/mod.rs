//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures and actor key pairs
//! - Remote actor fetching
//! - Follow / Undo processing (inbox)
//! - Activity delivery and the durable delivery queue (outbox)
//! - WebFinger

mod delivery;
mod follow;
mod key_cache;
mod queue;
mod remote_actor;
mod signature;
mod uri;
mod webfinger;

pub use delivery::{ActivitySender, PUBLIC_AUDIENCE, PreparedDelivery, builder, post_signed};
pub use follow::{FollowHandler, FollowPolicy};
pub use key_cache::{ActorKeys, KeyPairCache, generate_keypair};
pub use queue::{
    DeliveryOutcome, DeliveryQueue, DrainReport, ParallelDispatcher, apply_failure,
    follower_targets, next_attempt_at,
};
pub use remote_actor::{ACTIVITY_JSON, RemoteActor, RemoteActorFetcher, parse_remote_actor};
pub use signature::{
    InboundRequest, SignatureHeaders, SignatureService, extract_signature_key_id,
    generate_digest, host_header, http_date, key_id_matches_actor, parse_signature_header,
    sign_request, verify_request, verify_signature,
};
pub use uri::{addresses_local_actor, canonical_domain, canonicalize_actor_uri, reference_id};
pub use webfinger::{
    IdentityMatch, IdentityResolver, ProfileUriResolver, Resource, WebFingerLink,
    WebFingerResolver, WebFingerResponse, parse_resource,
};
