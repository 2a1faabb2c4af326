//! Service layer
//!
//! Business logic separated from HTTP handlers: the federation consent
//! filter and content publication.

mod eligibility;
mod publisher;

pub use eligibility::{Eligibility, decide};
pub use publisher::{ContentEvent, ContentEventKind, ObjectGenerator, PublishOutcome, Publisher};
