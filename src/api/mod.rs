//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actors, inbox, outbox, objects)
//! - WebFinger and host-meta discovery
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
