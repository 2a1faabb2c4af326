//! Federation consent filter
//!
//! Decides whether a local actor may be discovered and served.

use std::sync::Arc;

use crate::config::ConsentMode;
use crate::data::{Actor, ActorKind, Database, GroupRule, User};
use crate::error::AppError;

/// Whether a user may federate, given its group rules
///
/// A deny rule beats an allow rule; without rules the consent mode decides.
pub fn decide(user: &User, rules: &[GroupRule], mode: ConsentMode) -> bool {
    if user.activation_pending || user.blocked {
        return false;
    }
    if rules.contains(&GroupRule::Deny) {
        return false;
    }
    if rules.contains(&GroupRule::Allow) {
        return true;
    }

    match mode {
        ConsentMode::DefaultAllow => user.federation_opt_in != Some(false),
        ConsentMode::OptIn => user.federation_opt_in == Some(true),
    }
}

/// Consent filter backed by the user tables
pub struct Eligibility {
    db: Arc<Database>,
    mode: ConsentMode,
}

impl Eligibility {
    pub fn new(db: Arc<Database>, mode: ConsentMode) -> Self {
        Self { db, mode }
    }

    pub async fn user_is_eligible(&self, user: &User) -> Result<bool, AppError> {
        let rules = self.db.group_rules_for_user(user.id).await?;
        Ok(decide(user, &rules, self.mode))
    }

    /// Virtual actors are always eligible
    pub async fn actor_is_eligible(&self, actor: &Actor) -> Result<bool, AppError> {
        if actor.is_virtual() {
            return Ok(true);
        }

        match self.db.get_user(actor.user_id).await? {
            Some(user) => self.user_is_eligible(&user).await,
            None => Ok(false),
        }
    }

    /// Look up an actor by handle, hiding ineligible ones
    ///
    /// An eligible user who never federated gets an actor on first lookup.
    pub async fn eligible_actor_by_handle(&self, handle: &str) -> Result<Option<Actor>, AppError> {
        if let Some(actor) = self.db.get_actor_by_handle(handle).await? {
            return Ok(if self.actor_is_eligible(&actor).await? {
                Some(actor)
            } else {
                None
            });
        }

        let Some(user) = self.db.get_user_by_username(handle).await? else {
            return Ok(None);
        };
        if !self.user_is_eligible(&user).await? {
            return Ok(None);
        }
        Ok(Some(self.db.actor_for_user(user.id, ActorKind::Person).await?))
    }
}
