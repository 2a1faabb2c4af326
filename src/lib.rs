//! fedihost - ActivityPub federation for a content platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, outbox, objects)    │
//! │  - WebFinger / host-meta                                    │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Service / Federation Layer                     │
//! │  - Consent filter, content publication                      │
//! │  - HTTP Signatures, Follow / Undo, delivery queue           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Eligibility and publication
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// Cloned per request; everything heavy sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Parsed actor signing keys
    pub keys: Arc<federation::KeyPairCache>,

    pub signatures: Arc<federation::SignatureService>,

    /// Signed one-off deliveries (Accept / Reject)
    pub sender: Arc<federation::ActivitySender>,

    pub fetcher: Arc<federation::RemoteActorFetcher>,

    /// Durable outbound delivery queue
    pub queue: Arc<federation::DeliveryQueue>,

    /// Inbox Follow / Undo handling
    pub follows: Arc<federation::FollowHandler>,

    pub webfinger: Arc<federation::WebFingerResolver>,

    /// Federation consent filter
    pub eligibility: Arc<service::Eligibility>,

    pub publisher: Arc<service::Publisher>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the federation HTTP client
    /// 3. Wire signing, delivery, follow handling and WebFinger
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(config.federation.user_agent.as_str())
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 3. Federation services
        let base_url = config.federation_base_url();
        let keys = Arc::new(federation::KeyPairCache::new(config.federation.key_bits));
        let signatures = Arc::new(federation::SignatureService::new(
            db.clone(),
            keys.clone(),
            base_url.clone(),
        ));
        let sender = Arc::new(federation::ActivitySender::new(
            http_client.clone(),
            signatures.clone(),
            base_url.clone(),
            config.delivery.request_timeout(),
        ));
        let fetcher = Arc::new(federation::RemoteActorFetcher::new(
            http_client.clone(),
            config.federation.fetch_timeout(),
            config.federation.allow_insecure_remotes,
        ));
        let queue = Arc::new(federation::DeliveryQueue::new(
            db.clone(),
            sender.clone(),
            http_client.clone(),
            config.delivery.clone(),
        ));

        let scheme = if config.server.is_https() {
            "https"
        } else {
            "http"
        };
        let follows = Arc::new(federation::FollowHandler::new(
            db.clone(),
            sender.clone(),
            fetcher.clone(),
            federation::FollowPolicy {
                base_url: base_url.clone(),
                scheme: scheme.to_string(),
                require_signed_follow: config.federation.require_signed_follow,
                require_digest: config.federation.require_digest,
            },
        ));

        // 4. Consent filter, discovery and publication
        let eligibility = Arc::new(service::Eligibility::new(
            db.clone(),
            config.federation.consent_mode,
        ));
        let webfinger = Arc::new(federation::WebFingerResolver::new(
            db.clone(),
            &config.server.domain,
            base_url.clone(),
            eligibility.clone(),
        ));
        let publisher = Arc::new(service::Publisher::new(
            db.clone(),
            queue.clone(),
            eligibility.clone(),
            base_url.clone(),
        ));

        tracing::info!(base_url = %base_url, "Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            keys,
            signatures,
            sender,
            fetcher,
            queue,
            follows,
            webfinger,
            eligibility,
            publisher,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);
    let base_path = state.config.federation.base_path.clone();

    let federation_routes = if base_path.is_empty() {
        api::activitypub_router()
    } else {
        Router::new().nest(&base_path, api::activitypub_router())
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(federation_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.is_https() {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
