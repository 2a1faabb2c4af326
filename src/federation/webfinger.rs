//! WebFinger protocol implementation
//!
//! Resolves `acct:`, `mailto:` and actor URI resources to local actors.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::data::{Actor, ActorKind, Database};
use crate::error::AppError;
use crate::federation::remote_actor::ACTIVITY_JSON;
use crate::federation::uri::{canonical_domain, canonicalize_actor_uri};
use crate::metrics::WEBFINGER_LOOKUPS_TOTAL;
use crate::service::Eligibility;

pub const PROFILE_PAGE_REL: &str = "http://webfinger.net/rel/profile-page";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// A parsed `resource` query parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Acct { user: String, domain: String },
    Mailto(String),
    Uri(String),
}

/// Parse a WebFinger resource
///
/// Bare `user@domain` is read as an `acct:` resource.
pub fn parse_resource(raw: &str) -> Result<Resource, AppError> {
    let raw = raw.trim();
    let malformed = || AppError::Validation(format!("Malformed resource: {}", raw));

    if raw.is_empty() {
        return Err(AppError::Validation("Missing resource".to_string()));
    }

    let account = if let Some(rest) = raw.strip_prefix("acct:") {
        Some(rest)
    } else if !raw.contains(':') {
        Some(raw)
    } else {
        None
    };

    if let Some(account) = account {
        let (user, domain) = account
            .trim_start_matches('@')
            .rsplit_once('@')
            .ok_or_else(malformed)?;
        if user.is_empty() || domain.is_empty() {
            return Err(malformed());
        }
        return Ok(Resource::Acct {
            user: user.to_string(),
            domain: domain.to_string(),
        });
    }

    if let Some(address) = raw.strip_prefix("mailto:") {
        if !address.contains('@') {
            return Err(malformed());
        }
        return Ok(Resource::Mailto(address.to_string()));
    }

    let url = Url::parse(raw).map_err(|_| malformed())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(malformed());
    }
    Ok(Resource::Uri(raw.to_string()))
}

/// What an identity resolver found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    Actor(i64),
    User(i64),
}

/// Pluggable resolution step for resources the built-in rules do not cover
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, resource: &str) -> Result<Option<IdentityMatch>, AppError>;
}

/// Resolves `<base>/actor/<handle>` URIs
pub struct ProfileUriResolver {
    db: Arc<Database>,
    actor_prefix: Option<String>,
}

impl ProfileUriResolver {
    pub fn new(db: Arc<Database>, base_url: &str) -> Self {
        let scheme = Url::parse(base_url)
            .map(|url| url.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        let actor_prefix =
            canonicalize_actor_uri(base_url, &scheme).map(|base| format!("{}/actor/", base));

        Self { db, actor_prefix }
    }

    fn handle_of<'a>(&self, canonical: &'a str) -> Option<&'a str> {
        let handle = canonical.strip_prefix(self.actor_prefix.as_deref()?)?;
        (!handle.is_empty() && !handle.contains(['/', '?', '#'])).then_some(handle)
    }
}

#[async_trait]
impl IdentityResolver for ProfileUriResolver {
    async fn resolve(&self, resource: &str) -> Result<Option<IdentityMatch>, AppError> {
        let Some(prefix) = self.actor_prefix.as_deref() else {
            return Ok(None);
        };
        let scheme = prefix.split("://").next().unwrap_or("https");
        let Some(canonical) = canonicalize_actor_uri(resource, scheme) else {
            return Ok(None);
        };
        let Some(handle) = self.handle_of(&canonical) else {
            return Ok(None);
        };

        if let Some(actor) = self.db.get_actor_by_handle(handle).await? {
            return Ok(Some(IdentityMatch::Actor(actor.id)));
        }
        Ok(self
            .db
            .get_user_by_username(handle)
            .await?
            .map(|user| IdentityMatch::User(user.id)))
    }
}

/// WebFinger resolver for the local server
pub struct WebFingerResolver {
    db: Arc<Database>,
    /// Canonical server domain
    domain: String,
    base_url: String,
    eligibility: Arc<Eligibility>,
    resolvers: Vec<Arc<dyn IdentityResolver>>,
}

impl WebFingerResolver {
    /// Resolver with the built-in profile URI step
    pub fn new(
        db: Arc<Database>,
        domain: &str,
        base_url: impl Into<String>,
        eligibility: Arc<Eligibility>,
    ) -> Self {
        let base_url = base_url.into();
        let profile_uris = Arc::new(ProfileUriResolver::new(db.clone(), &base_url));

        Self {
            db,
            domain: canonical_domain(domain),
            base_url,
            eligibility,
            resolvers: vec![profile_uris],
        }
    }

    /// Append a resolver to the chain
    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Find the eligible local actor a resource names
    pub async fn resolve(&self, raw: &str, resource: &Resource) -> Result<Option<Actor>, AppError> {
        let direct = match resource {
            Resource::Acct { user, domain } => {
                if canonical_domain(domain) == self.domain {
                    self.eligibility.eligible_actor_by_handle(user).await?
                } else {
                    None
                }
            }
            Resource::Mailto(address) => self.resolve_email(address).await?,
            Resource::Uri(_) => None,
        };
        if direct.is_some() {
            return Ok(direct);
        }

        for resolver in &self.resolvers {
            let found = match resolver.resolve(raw).await? {
                Some(IdentityMatch::Actor(actor_id)) => self.db.get_actor(actor_id).await?,
                Some(IdentityMatch::User(user_id)) => {
                    let Some(user) = self.db.get_user(user_id).await? else {
                        continue;
                    };
                    if !self.eligibility.user_is_eligible(&user).await? {
                        continue;
                    }
                    Some(self.db.actor_for_user(user_id, ActorKind::Person).await?)
                }
                None => None,
            };

            if let Some(actor) = found {
                if self.eligibility.actor_is_eligible(&actor).await? {
                    return Ok(Some(actor));
                }
            }
        }

        Ok(None)
    }

    async fn resolve_email(&self, address: &str) -> Result<Option<Actor>, AppError> {
        let Some(user) = self.db.get_user_by_email(address).await? else {
            return Ok(None);
        };
        if !user.searchable_by_email || !self.eligibility.user_is_eligible(&user).await? {
            return Ok(None);
        }

        Ok(Some(self.db.actor_for_user(user.id, ActorKind::Person).await?))
    }

    /// Build the JRD for an actor, keeping only links whose rel is listed
    /// (all links when `rels` is empty)
    pub fn to_jrd(&self, subject: &str, actor: &Actor, rels: &[String]) -> WebFingerResponse {
        let actor_uri = actor.uri(&self.base_url);
        let links = vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_uri.clone()),
                template: None,
            },
            WebFingerLink {
                rel: PROFILE_PAGE_REL.to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_uri.clone()),
                template: None,
            },
        ];

        WebFingerResponse {
            subject: subject.to_string(),
            aliases: Some(vec![actor_uri]),
            links: links
                .into_iter()
                .filter(|link| rels.is_empty() || rels.iter().any(|rel| rel == &link.rel))
                .collect(),
        }
    }

    /// Resolve a raw resource to its JRD
    ///
    /// # Errors
    /// `Validation` for a missing or malformed resource.
    pub async fn lookup(
        &self,
        raw: &str,
        rels: &[String],
    ) -> Result<Option<WebFingerResponse>, AppError> {
        let resource = parse_resource(raw)?;

        match self.resolve(raw, &resource).await? {
            Some(actor) => {
                WEBFINGER_LOOKUPS_TOTAL.with_label_values(&["found"]).inc();
                Ok(Some(self.to_jrd(raw.trim(), &actor, rels)))
            }
            None => {
                WEBFINGER_LOOKUPS_TOTAL.with_label_values(&["not_found"]).inc();
                tracing::debug!(resource = raw, "WebFinger resource not found");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsentMode;
    use crate::data::NewUser;
    use tempfile::TempDir;

    const BASE_URL: &str = "https://example.com";

    async fn setup(mode: ConsentMode) -> (Arc<Database>, WebFingerResolver, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("wf.db"))
                .await
                .unwrap(),
        );
        let eligibility = Arc::new(Eligibility::new(db.clone(), mode));
        let resolver = WebFingerResolver::new(db.clone(), "www.Example.com", BASE_URL, eligibility);
        (db, resolver, temp_dir)
    }

    async fn create_user(db: &Database, username: &str, opt_in: Option<bool>) -> i64 {
        db.create_user(&NewUser {
            username: username.to_string(),
            name: username.to_string(),
            email: Some(format!("{username}@mail.example")),
            federation_opt_in: opt_in,
            searchable_by_email: true,
            ..Default::default()
        })
        .await
        .unwrap()
        .id
    }

    #[test]
    fn parse_resource_variants() {
        assert_eq!(
            parse_resource("acct:alice@example.com").unwrap(),
            Resource::Acct {
                user: "alice".to_string(),
                domain: "example.com".to_string()
            }
        );
        assert_eq!(
            parse_resource("@alice@example.com").unwrap(),
            Resource::Acct {
                user: "alice".to_string(),
                domain: "example.com".to_string()
            }
        );
        assert_eq!(
            parse_resource("mailto:alice@mail.example").unwrap(),
            Resource::Mailto("alice@mail.example".to_string())
        );
        assert_eq!(
            parse_resource("https://example.com/actor/alice").unwrap(),
            Resource::Uri("https://example.com/actor/alice".to_string())
        );
    }

    #[test]
    fn parse_resource_rejects_malformed_input() {
        for raw in ["", "acct:alice", "acct:@example.com", "mailto:nobody", "ftp://x/y", "urn:x"] {
            assert!(
                matches!(parse_resource(raw), Err(AppError::Validation(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn acct_resolves_eligible_local_actor() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        let user_id = create_user(&db, "alice", None).await;
        db.actor_for_user(user_id, ActorKind::Person).await.unwrap();

        let jrd = resolver
            .lookup("acct:alice@example.com", &[])
            .await
            .unwrap()
            .expect("alice resolves");
        assert_eq!(jrd.subject, "acct:alice@example.com");
        assert_eq!(jrd.aliases, Some(vec!["https://example.com/actor/alice".to_string()]));
        assert_eq!(jrd.links.len(), 2);
        assert_eq!(jrd.links[0].rel, "self");
        assert_eq!(jrd.links[0].link_type.as_deref(), Some("application/activity+json"));
    }

    #[tokio::test]
    async fn foreign_domain_does_not_resolve() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        let user_id = create_user(&db, "alice", None).await;
        db.actor_for_user(user_id, ActorKind::Person).await.unwrap();

        assert!(resolver.lookup("acct:alice@other.example", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opt_in_mode_hides_undecided_users() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::OptIn).await;
        let user_id = create_user(&db, "alice", None).await;
        db.actor_for_user(user_id, ActorKind::Person).await.unwrap();

        assert!(resolver.lookup("acct:alice@example.com", &[]).await.unwrap().is_none());
        db.set_user_federation_opt_in(user_id, Some(true)).await.unwrap();
        assert!(resolver.lookup("acct:alice@example.com", &[]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mailto_creates_missing_actor() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        let user_id = create_user(&db, "bob", None).await;
        assert!(db.get_actor_by_user(user_id).await.unwrap().is_none());

        let jrd = resolver
            .lookup("mailto:bob@mail.example", &[])
            .await
            .unwrap()
            .expect("bob resolves by email");
        assert_eq!(jrd.subject, "mailto:bob@mail.example");
        assert!(db.get_actor_by_user(user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn acct_creates_missing_actor_for_consenting_user() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::OptIn).await;
        let user_id = create_user(&db, "dave", Some(true)).await;
        assert!(db.get_actor_by_user(user_id).await.unwrap().is_none());

        let jrd = resolver
            .lookup("acct:dave@example.com", &[])
            .await
            .unwrap()
            .expect("dave resolves without a prior actor");
        assert_eq!(jrd.aliases, Some(vec!["https://example.com/actor/dave".to_string()]));
        assert!(db.get_actor_by_user(user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn profile_uri_of_user_without_actor_resolves() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        let user_id = create_user(&db, "frank", None).await;

        let jrd = resolver
            .lookup("https://example.com/actor/frank", &[])
            .await
            .unwrap()
            .expect("frank resolves by profile uri");
        assert_eq!(jrd.subject, "https://example.com/actor/frank");
        assert!(db.get_actor_by_user(user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn profile_uri_resolves_through_chain() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        db.create_virtual_actor("news", "News", ActorKind::Service)
            .await
            .unwrap();

        let jrd = resolver
            .lookup("http://EXAMPLE.com/actor/news/", &[])
            .await
            .unwrap()
            .expect("profile uri resolves");
        assert_eq!(jrd.aliases, Some(vec!["https://example.com/actor/news".to_string()]));
    }

    #[tokio::test]
    async fn custom_resolver_result_passes_consent_filter() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        let declined = create_user(&db, "carol", Some(false)).await;
        let news = db
            .create_virtual_actor("news", "News", ActorKind::Service)
            .await
            .unwrap();

        let mut first = MockIdentityResolver::new();
        first
            .expect_resolve()
            .returning(move |_| Ok(Some(IdentityMatch::User(declined))));
        let mut second = MockIdentityResolver::new();
        let news_id = news.id;
        second
            .expect_resolve()
            .returning(move |_| Ok(Some(IdentityMatch::Actor(news_id))));

        let resolver = resolver
            .with_resolver(Arc::new(first))
            .with_resolver(Arc::new(second));

        let jrd = resolver
            .lookup("https://sso.example/people/42", &[])
            .await
            .unwrap()
            .expect("second resolver wins");
        assert_eq!(jrd.aliases, Some(vec!["https://example.com/actor/news".to_string()]));
        assert!(db.get_actor_by_user(declined).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rel_filters_links() {
        let (db, resolver, _temp_dir) = setup(ConsentMode::DefaultAllow).await;
        db.create_virtual_actor("news", "News", ActorKind::Service)
            .await
            .unwrap();

        let jrd = resolver
            .lookup("acct:news@example.com", &["self".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(jrd.links.len(), 1);
        assert_eq!(jrd.links[0].rel, "self");

        let jrd = resolver
            .lookup("acct:news@example.com", &["http://unknown/rel".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert!(jrd.links.is_empty());
    }
}
