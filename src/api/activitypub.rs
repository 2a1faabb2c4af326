//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (Follow / Undo receiving)
//! - Outbox
//! - Followers collection
//! - Object lookup

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, InboundRequest};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
/// Largest activity body accepted by the inbox
const INBOX_BODY_LIMIT: usize = 1024 * 1024;

/// Create ActivityPub router
///
/// Routes:
/// - GET /actor/:handle - Actor profile
/// - POST /actor/:handle/inbox - Personal inbox
/// - GET /actor/:handle/outbox - Outbox
/// - GET /actor/:handle/followers - Followers collection
/// - GET /object/:id - Stored object or activity
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/actor/:handle", get(actor))
        .route(
            "/actor/:handle/inbox",
            post(inbox).layer(RequestBodyLimitLayer::new(INBOX_BODY_LIMIT)),
        )
        .route("/actor/:handle/outbox", get(outbox))
        .route("/actor/:handle/followers", get(followers))
        .route("/object/:id", get(object))
}

fn activity_json(value: Value) -> Response {
    ([(CONTENT_TYPE, ACTIVITY_JSON)], Json(value)).into_response()
}

async fn eligible_actor(state: &AppState, handle: &str) -> Result<Actor, AppError> {
    state
        .eligibility
        .eligible_actor_by_handle(handle)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /actor/:handle
///
/// Returns ActivityPub Actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/actor/:handle"])
        .start_timer();

    let actor = eligible_actor(&state, &handle).await?;
    let base_url = state.config.federation_base_url();
    let actor_url = actor.uri(&base_url);
    let public_key_pem = state.signatures.public_key_pem(&actor).await?;

    let mut document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": actor.kind.as_str(),
        "id": actor_url,
        "preferredUsername": actor.handle,
        "name": actor.name,
        "inbox": actor.inbox_uri(&base_url),
        "outbox": actor.outbox_uri(&base_url),
        "followers": actor.followers_uri(&base_url),
        "url": actor_url,
        "manuallyApprovesFollowers": false,
        "publicKey": {
            "id": actor.key_id(&base_url),
            "owner": actor_url,
            "publicKeyPem": public_key_pem
        }
    });
    if let Some(summary) = &actor.params.summary {
        document["summary"] = Value::String(summary.clone());
    }

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/actor/:handle", "200"])
        .inc();
    Ok(activity_json(document))
}

/// POST /actor/:handle/inbox
///
/// Receives incoming ActivityPub activities.
///
/// Signatures are checked by the follow handler where the activity type
/// requires one.
async fn inbox(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/actor/:handle/inbox"])
        .start_timer();
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let actor = eligible_actor(&state, &handle).await?;

    let activity: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = InboundRequest {
        method: "POST",
        path_and_query,
        headers: &headers,
        body: &body,
    };

    let result = state.follows.process(&actor, &activity, &request).await;
    let status = match &result {
        Ok(_) => "success".to_string(),
        Err(e) => e.status().as_u16().to_string(),
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", &status])
        .inc();

    let handled = result?;
    tracing::debug!(actor = %actor.handle, handled, "Inbox activity processed");

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/actor/:handle/inbox", "200"])
        .inc();
    Ok(Json(json!({ "error": false })))
}

/// Outbox paging parameters
#[derive(Debug, Deserialize)]
struct OutboxQuery {
    #[serde(default)]
    page: bool,
    offset: Option<i64>,
    limit: Option<i64>,
}

/// GET /actor/:handle/outbox
///
/// Without `page=true` returns the collection summary; with it, one page
/// of activities, newest first.
async fn outbox(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<OutboxQuery>,
) -> Result<Response, AppError> {
    let actor = eligible_actor(&state, &handle).await?;
    let base_url = state.config.federation_base_url();
    let outbox_url = actor.outbox_uri(&base_url);
    let total = state.db.count_outbox(actor.id).await?;

    if !query.page {
        let last_offset = if total > 0 {
            ((total - 1) / DEFAULT_PAGE_SIZE) * DEFAULT_PAGE_SIZE
        } else {
            0
        };

        return Ok(activity_json(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "OrderedCollection",
            "id": outbox_url,
            "totalItems": total,
            "first": format!("{}?page=true", outbox_url),
            "last": format!("{}?page=true&offset={}", outbox_url, last_offset)
        })));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let items: Vec<Value> = state
        .db
        .list_outbox(actor.id, offset, limit)
        .await?
        .into_iter()
        .map(|record| record.document)
        .collect();

    let page_url = |offset: i64| {
        format!(
            "{}?page=true&offset={}&limit={}",
            outbox_url, offset, limit
        )
    };

    let mut page = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollectionPage",
        "id": page_url(offset),
        "partOf": outbox_url,
        "totalItems": total,
        "orderedItems": items
    });
    if offset + limit < total {
        page["next"] = Value::String(page_url(offset + limit));
    }
    if offset > 0 {
        page["prev"] = Value::String(page_url((offset - limit).max(0)));
    }

    Ok(activity_json(page))
}

/// GET /actor/:handle/followers
///
/// Only the follower count is published.
async fn followers(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Response, AppError> {
    let actor = eligible_actor(&state, &handle).await?;
    let base_url = state.config.federation_base_url();
    let total = state.db.count_followers(actor.id).await?;

    Ok(activity_json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": actor.followers_uri(&base_url),
        "totalItems": total
    })))
}

/// GET /object/:id
///
/// Serves a stored object (or its tombstone), falling back to outbox
/// activities.
async fn object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (actor_id, document) = match state.db.get_object(&id).await? {
        Some(object) => (object.actor_id, object.document),
        None => {
            let record = state
                .db
                .get_outbox_record(&id)
                .await?
                .ok_or(AppError::NotFound)?;
            (record.actor_id, record.document)
        }
    };

    let actor = state.db.get_actor(actor_id).await?.ok_or(AppError::NotFound)?;
    if !state.eligibility.actor_is_eligible(&actor).await? {
        return Err(AppError::NotFound);
    }

    let mut document = document;
    if let Some(fields) = document.as_object_mut() {
        fields
            .entry("@context")
            .or_insert_with(|| json!("https://www.w3.org/ns/activitystreams"));
    }
    Ok(activity_json(document))
}
