use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use fidoreg_crypto::{DomainSettings, IntegritySigner, Keyring, SigningConfig};
use fidoreg_lifecycle::{CredentialRegistrar, KeyStateMachine, LifecycleConfig};
use fidoreg_replication::{ReplicaApplier, PEER_TOKEN_HEADER};
use fidoreg_rpc::{build_peer_router, build_router, AppState};
use fidoreg_storage::{CredentialFinder, MemoryStorage, SequenceService, SledStorage};
use fidoreg_types::KeyStatus;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn config() -> LifecycleConfig {
    LifecycleConfig {
        server_id: 5,
        ..Default::default()
    }
}

const PEER_TOKEN: &str = "cluster-secret";

fn state_for(store: &MemoryStorage, replica: ReplicaApplier) -> Arc<AppState> {
    let registrar = CredentialRegistrar::new(config(), Arc::new(store.clone()), Arc::new(store.clone()));
    let state_machine = KeyStateMachine::new(config(), Arc::new(store.clone()));
    let state = AppState::new("test-node", Arc::new(registrar), Arc::new(state_machine))
        .with_replica(Arc::new(replica));
    Arc::new(state)
}

fn router_for(store: &MemoryStorage) -> Router {
    build_router(state_for(store, ReplicaApplier::new(Arc::new(store.clone()))))
}

fn peer_router_for(store: &MemoryStorage) -> Router {
    let state = state_for(store, ReplicaApplier::new(Arc::new(store.clone())));
    build_peer_router(state, PEER_TOKEN)
}

async fn post_as_peer(router: &Router, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/replication")
        .header("content-type", "application/json");
    if let Some(token) = token {
        request = request.header(PEER_TOKEN_HEADER, token);
    }
    send(router, request.body(Body::from(body.to_string())).unwrap()).await
}

async fn post(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn alice_registration() -> Value {
    json!({
        "domainId": 1,
        "username": "alice",
        "keyHandle": "KH1",
        "publicKey": "PK1",
        "fidoVersion": "2.0",
        "fidoProtocol": "2.0",
        "createLocation": "US"
    })
}

fn transition_body(username: &str, handle: &str) -> Value {
    json!({
        "domainId": 1,
        "protocol": "2.0",
        "username": username,
        "handle": handle,
        "modifyLocation": "US"
    })
}

#[tokio::test]
async fn second_identical_registration_answers_status_false() {
    let store = MemoryStorage::new();
    let router = router_for(&store);

    let (status, body) = post(&router, "/fido/keys/register", alice_registration()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);
    assert_eq!(body["handle"], "5-1-alice-1");

    let (status, body) = post(&router, "/fido/keys/register", alice_registration()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], false);
    assert!(body["message"].as_str().unwrap().contains("already exists"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn registration_validation_failure_names_the_field() {
    let store = MemoryStorage::new();
    let router = router_for(&store);

    let mut request = alice_registration();
    request["fidoProtocol"] = json!("UAF");
    let (status, body) = post(&router, "/fido/keys/register", request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], false);
    assert!(body["message"].as_str().unwrap().contains("fido_protocol"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn malformed_json_keeps_response_shape() {
    let store = MemoryStorage::new();
    let router = router_for(&store);

    let request = Request::builder()
        .method("POST")
        .uri("/fido/keys/register")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], false);
}

#[tokio::test]
async fn owner_can_deactivate_and_reactivate() {
    let store = MemoryStorage::new();
    let router = router_for(&store);
    post(&router, "/fido/keys/register", alice_registration()).await;

    let (status, body) = post(
        &router,
        "/fido/keys/deactivate",
        transition_body("alice", "5-1-alice-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Successfully deactivated the key");
    let stored = store.by_key(5, 1, 1).unwrap().unwrap();
    assert_eq!(stored.status, KeyStatus::Inactive);

    let (status, body) = post(
        &router,
        "/fido/keys/activate",
        transition_body("alice", "5-1-alice-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Successfully activated the key");
}

#[tokio::test]
async fn foreign_handle_returns_error_key() {
    let store = MemoryStorage::new();
    let router = router_for(&store);
    post(&router, "/fido/keys/register", alice_registration()).await;

    let (status, body) = post(
        &router,
        "/fido/keys/deactivate",
        transition_body("bob", "5-1-alice-1"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errorKey"], "authorization_error");
    assert!(body["errorMessage"].is_string());
    assert!(body.get("response").is_none());

    let (status, body) = post(
        &router,
        "/fido/keys/activate",
        transition_body("alice", "not-a-handle"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorKey"], "invalid_handle");
}

#[tokio::test]
async fn documented_activation_example() {
    let store = MemoryStorage::new();
    for _ in 0..6 {
        store.next_key_id(1).unwrap();
    }
    let router = router_for(&store);
    let (_, body) = post(&router, "/fido/keys/register", alice_registration()).await;
    assert_eq!(body["handle"], "5-1-alice-7");

    let (status, body) = post(
        &router,
        "/fido/keys/activate",
        json!({
            "domainId": "1",
            "protocol": "2.0",
            "username": "alice",
            "handle": "5-1-alice-7",
            "modifyLocation": "US"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Successfully activated the key");

    let (status, body) = post(
        &router,
        "/fido/keys/activate",
        json!({
            "domainId": "1",
            "protocol": "2.0",
            "username": "alice",
            "handle": "5-1-bob-7",
            "modifyLocation": "US"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errorKey"], "authorization_error");
}

fn add_event(credential: &fidoreg_types::Credential, operation: &str, origin: u16) -> Value {
    json!({
        "origin": origin,
        "sequence": 1,
        "entity": "FIDO_KEY",
        "operation": operation,
        "primary_key": credential.handle.as_str(),
        "payload": serde_json::to_value(credential).unwrap(),
        "issued_at": "2026-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn replication_endpoint_applies_peer_events() {
    let origin = MemoryStorage::new();
    let origin_router = router_for(&origin);
    post(&origin_router, "/fido/keys/register", alice_registration()).await;
    let credential = origin.by_key(5, 1, 1).unwrap().unwrap();

    let peer = MemoryStorage::new();
    let peer_router = peer_router_for(&peer);
    let event = add_event(&credential, "ADD", 5);

    let (status, body) = post_as_peer(&peer_router, Some(PEER_TOKEN), event.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);
    assert_eq!(peer.by_key(5, 1, 1).unwrap(), Some(credential));

    // redelivery is acknowledged without a second write
    let (status, body) = post_as_peer(&peer_router, Some(PEER_TOKEN), event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);
    assert_eq!(peer.len(), 1);
}

#[tokio::test]
async fn forged_events_do_not_reach_the_store() {
    let store = MemoryStorage::new();
    let router = router_for(&store);
    post(&router, "/fido/keys/register", alice_registration()).await;
    let original = store.by_key(5, 1, 1).unwrap().unwrap();

    let mut forged = original.clone();
    forged.public_key = "ATTACKER-PK".into();
    forged.status = KeyStatus::Inactive;
    let event = add_event(&forged, "UPDATE", 999);

    // the client listener has no replication route at all
    let (status, _) = post(&router, "/replication", event.clone()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let peer_router = peer_router_for(&store);
    let (status, body) = post_as_peer(&peer_router, None, event.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], false);
    let (status, _) = post_as_peer(&peer_router, Some("guess"), event.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // a peer presenting the token still cannot install an unsigned row
    let domains = vec![DomainSettings {
        id: 1,
        signing_identity: "CN=domain-1".into(),
        seed_hex: Some("2a".repeat(32)),
    }];
    let verifier = IntegritySigner::new(
        Arc::new(Keyring::from_domains(&domains).unwrap()),
        SigningConfig {
            enabled: true,
            ..Default::default()
        },
        &domains,
    );
    let replica = ReplicaApplier::new(Arc::new(store.clone())).with_verifier(verifier);
    let verifying_router = build_peer_router(state_for(&store, replica), PEER_TOKEN);
    let (status, body) = post_as_peer(&verifying_router, Some(PEER_TOKEN), event).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], false);

    assert_eq!(store.by_key(5, 1, 1).unwrap(), Some(original));
}

#[tokio::test]
async fn node_without_replica_refuses_events() {
    let store = MemoryStorage::new();
    let registrar = CredentialRegistrar::new(config(), Arc::new(store.clone()), Arc::new(store.clone()));
    let state_machine = KeyStateMachine::new(config(), Arc::new(store.clone()));
    let state = Arc::new(AppState::new(
        "solo",
        Arc::new(registrar),
        Arc::new(state_machine),
    ));

    let peer_router = build_peer_router(state.clone(), PEER_TOKEN);
    let (status, body) = post_as_peer(&peer_router, Some(PEER_TOKEN), json!({})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], false);

    let router = build_router(state);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "solo");
    assert_eq!(body["accepts_replication"], false);
}

#[tokio::test]
async fn sled_backed_router_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(SledStorage::new(dir.path()).unwrap());
        let registrar = CredentialRegistrar::new(config(), store.clone(), store.clone());
        let state_machine = KeyStateMachine::new(config(), store.clone());
        let router = build_router(Arc::new(AppState::new(
            "sled",
            Arc::new(registrar),
            Arc::new(state_machine),
        )));
        let (_, body) = post(&router, "/fido/keys/register", alice_registration()).await;
        assert_eq!(body["status"], true);
    }

    let store = Arc::new(SledStorage::new(dir.path()).unwrap());
    let registrar = CredentialRegistrar::new(config(), store.clone(), store.clone());
    let state_machine = KeyStateMachine::new(config(), store.clone());
    let router = build_router(Arc::new(AppState::new(
        "sled",
        Arc::new(registrar),
        Arc::new(state_machine),
    )));
    let (status, body) = post(&router, "/fido/keys/register", alice_registration()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], false);
}
