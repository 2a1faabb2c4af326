//! Common test utilities for E2E tests

#![allow(dead_code)]

pub mod schema_validator;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU16, AtomicU64, Ordering},
};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::Utc;
use fedihost::data::{Actor, ActorKind, NewUser};
use fedihost::federation::{generate_digest, generate_keypair, http_date, sign_request};
use fedihost::{AppState, config};
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use serde_json::{Value, json};
use sha2::Sha256;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// Configuration every test server starts from
pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: "test.example.com".to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        federation: config::FederationConfig {
            key_bits: 1024,
            allow_insecure_remotes: true,
            ..config::FederationConfig::default()
        },
        delivery: config::DeliveryConfig {
            enabled: false,
            ..config::DeliveryConfig::default()
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = fedihost::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public URI of a local actor, as remote servers address it
    pub fn actor_uri(&self, handle: &str) -> String {
        format!("{}/actor/{}", self.state.config.federation_base_url(), handle)
    }

    /// Create a user and its Person actor
    pub async fn create_user(&self, username: &str) -> Actor {
        self.create_user_with(NewUser {
            username: username.to_string(),
            name: format!("{} Example", username),
            email: Some(format!("{}@mail.example.org", username)),
            ..NewUser::default()
        })
        .await
    }

    pub async fn create_user_with(&self, user: NewUser) -> Actor {
        let user = self.state.db.create_user(&user).await.unwrap();
        self.state
            .db
            .actor_for_user(user.id, ActorKind::Person)
            .await
            .unwrap()
    }
}

/// A request received by the mock remote server
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

struct RemoteInner {
    base: String,
    public_key_pem: String,
    inbox_status: AtomicU16,
    inbox_delay_ms: AtomicU64,
    received: Mutex<Vec<ReceivedRequest>>,
}

/// A remote ActivityPub server on 127.0.0.1 with one signing key shared
/// by all of its actors
pub struct MockRemote {
    pub base: String,
    signing_key: SigningKey<Sha256>,
    inner: Arc<RemoteInner>,
}

impl MockRemote {
    pub async fn start() -> Self {
        let keypair = generate_keypair(1024).unwrap();
        let private_key = RsaPrivateKey::from_pkcs8_pem(&keypair.private_key_pem).unwrap();
        let signing_key = SigningKey::<Sha256>::new(private_key);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let inner = Arc::new(RemoteInner {
            base: base.clone(),
            public_key_pem: keypair.public_key_pem,
            inbox_status: AtomicU16::new(202),
            inbox_delay_ms: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/users/:name", get(remote_actor))
            .route("/users/:name/inbox", post(remote_inbox))
            .route("/slow/inbox", post(slow_inbox))
            .with_state(inner.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            signing_key,
            inner,
        }
    }

    pub fn actor_uri(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    pub fn inbox(&self, name: &str) -> String {
        format!("{}/users/{}/inbox", self.base, name)
    }

    /// An inbox that answers only after three seconds
    pub fn slow_inbox(&self) -> String {
        format!("{}/slow/inbox", self.base)
    }

    pub fn key_id(&self, name: &str) -> String {
        format!("{}#main-key", self.actor_uri(name))
    }

    pub fn set_inbox_status(&self, status: u16) {
        self.inner.inbox_status.store(status, Ordering::SeqCst);
    }

    /// Make `/users/:name/inbox` answer only after `delay`
    pub fn set_inbox_delay(&self, delay: Duration) {
        self.inner
            .inbox_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.inner.received.lock().unwrap().clone()
    }

    pub fn follow(&self, name: &str, target: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.actor_uri(name), ulid::Ulid::new()),
            "type": "Follow",
            "actor": self.actor_uri(name),
            "object": target
        })
    }

    pub fn undo(&self, name: &str, follow: &Value) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/undo/{}", self.actor_uri(name), ulid::Ulid::new()),
            "type": "Undo",
            "actor": self.actor_uri(name),
            "object": follow
        })
    }

    /// POST `activity` to `url` signed as `name` over
    /// `(request-target) host date digest`
    pub async fn post_signed(
        &self,
        client: &reqwest::Client,
        name: &str,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let parsed = url::Url::parse(url).unwrap();
        let body = serde_json::to_vec(activity).unwrap();
        let date = http_date(Utc::now());
        let digest = generate_digest(&body);
        let signature =
            sign_request(&self.signing_key, &self.key_id(name), &parsed, &date, Some(&digest))
                .unwrap();

        client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", date)
            .header("Digest", digest)
            .header("Signature", signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

async fn remote_actor(
    State(inner): State<Arc<RemoteInner>>,
    Path(name): Path<String>,
) -> ([(axum::http::HeaderName, &'static str); 1], Json<Value>) {
    let id = format!("{}/users/{}", inner.base, name);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/activity+json",
        )],
        Json(json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": id,
            "type": "Person",
            "preferredUsername": name,
            "inbox": format!("{}/inbox", id),
            "publicKey": {
                "id": format!("{}#main-key", id),
                "owner": id,
                "publicKeyPem": inner.public_key_pem
            }
        })),
    )
}

async fn remote_inbox(
    State(inner): State<Arc<RemoteInner>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    inner.received.lock().unwrap().push(ReceivedRequest {
        path: format!("/users/{}/inbox", name),
        headers,
        body,
    });
    let delay = inner.inbox_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    StatusCode::from_u16(inner.inbox_status.load(Ordering::SeqCst)).unwrap()
}

async fn slow_inbox() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(3)).await;
    StatusCode::OK
}
