//! E2E tests for ActivityPub endpoints and content publication

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::TestServer;
use common::schema_validator::assert_matches_schema;
use fedihost::data::{Actor, ActorKind, NewUser};
use fedihost::error::AppError;
use fedihost::service::{ContentEvent, ContentEventKind, ObjectGenerator};
use serde_json::{Value, json};

/// Renders every reference as a Note
struct NoteGenerator;

#[async_trait]
impl ObjectGenerator for NoteGenerator {
    async fn generate(
        &self,
        _actor: &Actor,
        reference: &str,
        object_uri: &str,
    ) -> Result<Option<Value>, AppError> {
        if reference.starts_with("draft-") {
            return Ok(None);
        }
        Ok(Some(json!({
            "type": "Note",
            "url": object_uri,
            "content": format!("<p>Post {}</p>", reference)
        })))
    }
}

async fn publish(server: &TestServer, actor: &Actor, reference: &str, kind: ContentEventKind) {
    server
        .state
        .publisher
        .handle_event(&ContentEvent {
            actor_id: actor.id,
            context: "post".to_string(),
            reference: reference.to_string(),
            kind,
        })
        .await
        .unwrap();
}

async fn get_json(server: &TestServer, path: &str) -> (u16, Value) {
    let response = server
        .client
        .get(&server.url(path))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let json = response.json().await.unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_actor_endpoint() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(&server.url("/actor/alice"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/activity+json"
    );

    let json: Value = response.json().await.unwrap();
    assert_matches_schema(&json, "actor");
    assert_eq!(json["type"], "Person");
    assert_eq!(json["id"], "https://test.example.com/actor/alice");
    assert_eq!(json["inbox"], "https://test.example.com/actor/alice/inbox");
    assert_eq!(
        json["publicKey"]["id"],
        "https://test.example.com/actor/alice#main-key"
    );
    assert_eq!(json["publicKey"]["owner"], json["id"]);
}

#[tokio::test]
async fn test_actor_key_is_stable() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let (_, first) = get_json(&server, "/actor/alice").await;
    let (_, second) = get_json(&server, "/actor/alice").await;

    assert_eq!(
        first["publicKey"]["publicKeyPem"],
        second["publicKey"]["publicKeyPem"]
    );
}

#[tokio::test]
async fn test_virtual_actor_endpoint() {
    let server = TestServer::new().await;
    server
        .state
        .db
        .create_virtual_actor("newsroom", "Newsroom", ActorKind::Organization)
        .await
        .unwrap();

    let (status, json) = get_json(&server, "/actor/newsroom").await;

    assert_eq!(status, 200);
    assert_eq!(json["type"], "Organization");
    assert_eq!(json["name"], "Newsroom");
}

#[tokio::test]
async fn test_unknown_actor_is_not_found() {
    let server = TestServer::new().await;

    let (status, json) = get_json(&server, "/actor/nobody").await;

    assert_eq!(status, 404);
    assert_eq!(json["error"], true);
    assert_eq!(json["code"], 404);
}

#[tokio::test]
async fn test_ineligible_actor_is_not_found() {
    let server = TestServer::new().await;
    let alice = server
        .create_user_with(NewUser {
            username: "alice".to_string(),
            name: "Alice".to_string(),
            activation_pending: true,
            ..NewUser::default()
        })
        .await;
    let carol = server.create_user("carol").await;
    server
        .state
        .db
        .set_user_blocked(carol.user_id, true)
        .await
        .unwrap();

    assert_eq!(get_json(&server, "/actor/alice").await.0, 404);
    assert_eq!(get_json(&server, "/actor/carol").await.0, 404);
    assert_eq!(get_json(&server, "/actor/carol/outbox").await.0, 404);

    // Activation makes alice visible
    server
        .state
        .db
        .set_user_activation_pending(alice.user_id, false)
        .await
        .unwrap();
    assert_eq!(get_json(&server, "/actor/alice").await.0, 200);
}

#[tokio::test]
async fn test_followers_collection_reports_count_only() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let (status, json) = get_json(&server, "/actor/alice/followers").await;

    assert_eq!(status, 200);
    assert_matches_schema(&json, "ordered_collection");
    assert_eq!(json["totalItems"], 0);
    assert!(json.get("orderedItems").is_none());
}

#[tokio::test]
async fn test_outbox_lists_published_activities() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    server
        .state
        .publisher
        .register("post", Arc::new(NoteGenerator))
        .await;

    for reference in ["1", "2", "3"] {
        publish(&server, &alice, reference, ContentEventKind::Published).await;
    }

    let (status, collection) = get_json(&server, "/actor/alice/outbox").await;
    assert_eq!(status, 200);
    assert_matches_schema(&collection, "ordered_collection");
    assert_eq!(collection["type"], "OrderedCollection");
    assert_eq!(collection["totalItems"], 3);
    assert_eq!(
        collection["first"],
        "https://test.example.com/actor/alice/outbox?page=true"
    );

    let (status, page) = get_json(&server, "/actor/alice/outbox?page=true&limit=2").await;
    assert_eq!(status, 200);
    assert_matches_schema(&page, "ordered_collection");
    assert_eq!(page["type"], "OrderedCollectionPage");
    assert_eq!(page["partOf"], "https://test.example.com/actor/alice/outbox");

    let items = page["orderedItems"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    // Newest first
    assert_eq!(items[0]["object"]["content"], "<p>Post 3</p>");
    assert_eq!(items[1]["object"]["content"], "<p>Post 2</p>");
    assert!(page["next"].as_str().unwrap().contains("offset=2"));
    assert!(page.get("prev").is_none());

    let (_, last) = get_json(&server, "/actor/alice/outbox?page=true&offset=2&limit=2").await;
    assert_eq!(last["orderedItems"].as_array().unwrap().len(), 1);
    assert!(last.get("next").is_none());
    assert!(last["prev"].as_str().unwrap().contains("offset=0"));
}

#[tokio::test]
async fn test_published_object_lifecycle() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    server
        .state
        .publisher
        .register("post", Arc::new(NoteGenerator))
        .await;

    let created = server
        .state
        .publisher
        .handle_event(&ContentEvent {
            actor_id: alice.id,
            context: "post".to_string(),
            reference: "42".to_string(),
            kind: ContentEventKind::Published,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.activity_type, "Create");
    assert_eq!(created.queued, 0);

    let object_path = format!("/object/{}", created.object_id);
    let (status, note) = get_json(&server, &object_path).await;
    assert_eq!(status, 200);
    assert_eq!(note["type"], "Note");
    assert_eq!(
        note["id"],
        format!("https://test.example.com/object/{}", created.object_id)
    );
    assert_eq!(note["attributedTo"], "https://test.example.com/actor/alice");

    // The activity itself is served too
    let (status, activity) = get_json(&server, &format!("/object/{}", created.activity_id)).await;
    assert_eq!(status, 200);
    assert_eq!(activity["type"], "Create");
    assert_eq!(activity["object"]["id"], note["id"]);

    // Republishing keeps the object id
    let updated = server
        .state
        .publisher
        .handle_event(&ContentEvent {
            actor_id: alice.id,
            context: "post".to_string(),
            reference: "42".to_string(),
            kind: ContentEventKind::Published,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.activity_type, "Update");
    assert_eq!(updated.object_id, created.object_id);

    publish(&server, &alice, "42", ContentEventKind::Unpublished).await;
    let (status, tombstone) = get_json(&server, &object_path).await;
    assert_eq!(status, 200);
    assert_eq!(tombstone["type"], "Tombstone");
    assert_eq!(tombstone["formerType"], "Note");

    let (_, outbox) = get_json(&server, "/actor/alice/outbox?page=true").await;
    assert_eq!(outbox["orderedItems"][0]["type"], "Delete");
    assert_eq!(outbox["totalItems"], 3);
}

#[tokio::test]
async fn test_unpublished_draft_produces_nothing() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    server
        .state
        .publisher
        .register("post", Arc::new(NoteGenerator))
        .await;

    publish(&server, &alice, "draft-1", ContentEventKind::Published).await;
    publish(&server, &alice, "7", ContentEventKind::Unpublished).await;

    let (_, outbox) = get_json(&server, "/actor/alice/outbox").await;
    assert_eq!(outbox["totalItems"], 0);
}

#[tokio::test]
async fn test_unknown_object_is_not_found() {
    let server = TestServer::new().await;

    let (status, _) = get_json(&server, "/object/01HZZZZZZZZZZZZZZZZZZZZZZZ").await;

    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_routes_follow_base_path() {
    let server = TestServer::with_config(|config| {
        config.federation.base_path = "/ap".to_string();
    })
    .await;
    server.create_user("alice").await;

    let (status, json) = get_json(&server, "/ap/actor/alice").await;
    assert_eq!(status, 200);
    assert_eq!(json["id"], "https://test.example.com/ap/actor/alice");
    assert_eq!(json["outbox"], "https://test.example.com/ap/actor/alice/outbox");

    assert_eq!(get_json(&server, "/actor/alice").await.0, 404);

    // Discovery stays at the root
    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:alice@test.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let jrd: Value = response.json().await.unwrap();
    assert_eq!(jrd["aliases"][0], "https://test.example.com/ap/actor/alice");
}
