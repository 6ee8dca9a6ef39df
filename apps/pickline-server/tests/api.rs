mod common;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use common::fixture;
use pickline_core::{PairingGrant, SessionSnapshot, SessionStatus};
use pickline_server::build_router;
use pickline_server::collaborators::PackagingSuggestions;
use pickline_server::routes::{MutationResponse, PhotoResponse, RedeemResponse};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

async fn send(app: &Router, method: &str, uri: &str, payload: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    let request_body = match payload {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(request_body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

async fn start(app: &Router, order_ids: &[i64]) -> SessionSnapshot {
    let (status, bytes) = send(app, "POST", "/sessions", Some(json!({ "order_ids": order_ids }))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&bytes));
    decode(&bytes)
}

#[tokio::test]
async fn health_and_metrics() {
    let fx = fixture();
    let app = build_router(fx.state.clone());

    let (status, bytes) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"ok");

    // No recorder is installed in tests.
    let (status, _) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_session_locks_orders() {
    let fx = fixture();
    let app = build_router(fx.state.clone());

    let snapshot = start(&app, &[2, 1]).await;
    assert_eq!(snapshot.sequence, 0);
    assert_eq!(snapshot.session.status, SessionStatus::Active);
    let ids: Vec<_> = snapshot.session.orders.iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![2, 1]);
    assert_eq!(snapshot.session.current_order_id, Some(2));

    let (status, bytes) = send(&app, "POST", "/sessions", Some(json!({ "order_ids": [1, 3] }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body: Value = decode(&bytes);
    assert_eq!(body["error"], "state_conflict");

    let (status, _) = send(&app, "POST", "/sessions", Some(json!({ "order_ids": [99] }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", "/sessions", Some(json!({ "order_ids": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "POST", "/sessions", Some(json!({ "order_ids": [3, 3] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn item_updates_clamp_and_report_events() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1, 2]).await.session.id;
    let uri = format!("/sessions/{session_id}/items/12");

    let (status, bytes) = send(&app, "POST", &uri, Some(json!({ "role": "mobile", "action": "increment" }))).await;
    assert_eq!(status, StatusCode::OK);
    let MutationResponse::Applied { event } = decode::<MutationResponse>(&bytes) else {
        panic!("expected an applied event");
    };
    assert_eq!(event.sequence, 1);

    // Quantity is 1; a second increment clamps but still sequences.
    let (status, bytes) = send(&app, "POST", &uri, Some(json!({ "role": "mobile", "action": "increment" }))).await;
    assert_eq!(status, StatusCode::OK);
    let MutationResponse::Applied { event } = decode::<MutationResponse>(&bytes) else {
        panic!("expected an applied event");
    };
    assert_eq!(event.sequence, 2);

    let (_, bytes) = send(&app, "GET", &format!("/sessions/{session_id}"), None).await;
    let snapshot: SessionSnapshot = decode(&bytes);
    assert_eq!(snapshot.session.order(1).unwrap().items[1].picked_quantity, 1);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/items/999"),
        Some(json!({ "role": "mobile", "action": "increment" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_request_id_is_reported() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[3]).await.session.id;
    let request_id = Uuid::new_v4();
    let body = json!({ "role": "desktop", "action": "increment", "request_id": request_id });
    let uri = format!("/sessions/{session_id}/items/31");

    send(&app, "POST", &uri, Some(body.clone())).await;
    let (status, bytes) = send(&app, "POST", &uri, Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    match decode::<MutationResponse>(&bytes) {
        MutationResponse::Duplicate { request_id: echoed } => assert_eq!(echoed, request_id),
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn pack_flow_over_http() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[2, 3]).await.session.id;
    let pack_uri = format!("/sessions/{session_id}/orders/2/pack");
    let pack_body = json!({ "role": "desktop", "packaging_material_id": 8, "weight": 0.4, "send_email": true });

    let (status, bytes) = send(&app, "POST", &pack_uri, Some(pack_body.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body: Value = decode(&bytes);
    assert_eq!(body["order_id"], 2);

    send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/items/21"),
        Some(json!({ "role": "mobile", "action": "pick_all" })),
    )
    .await;

    fx.orders.fail_persist(true);
    let (status, _) = send(&app, "POST", &pack_uri, Some(pack_body.clone())).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    fx.orders.fail_persist(false);

    let (status, _) = send(&app, "POST", &pack_uri, Some(pack_body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let persisted = fx.orders.persisted();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].send_email);

    let (status, _) = send(&app, "POST", &pack_uri, Some(pack_body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/orders/3/pack"),
        Some(json!({ "role": "desktop", "weight": -1.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn navigate_moves_the_current_order() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1, 2]).await.session.id;

    let (status, _) = send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/orders/2/navigate"),
        Some(json!({ "role": "mobile" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let snapshot = fx.state.store.snapshot(session_id).unwrap();
    assert_eq!(snapshot.session.current_order_id, Some(2));

    let (status, _) = send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/orders/3/navigate"),
        Some(json!({ "role": "mobile" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn only_the_desktop_ends_a_session() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1]).await.session.id;
    let complete = format!("/sessions/{session_id}/complete");

    let (status, bytes) = send(&app, "POST", &complete, Some(json!({ "role": "mobile" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = decode(&bytes);
    assert_eq!(body["error"], "forbidden");

    let (status, _) = send(&app, "POST", &complete, Some(json!({ "role": "desktop" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/cancel"),
        Some(json!({ "role": "desktop" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(fx.orders.release_calls().is_empty());
}

#[tokio::test]
async fn cancel_releases_the_session_orders() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1, 3]).await.session.id;

    let (status, _) = send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/cancel"),
        Some(json!({ "role": "desktop" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fx.orders.release_calls(), vec![vec![1, 3]]);

    // Released orders can be picked up by a new session.
    start(&app, &[1, 3]).await;
}

#[tokio::test]
async fn pairing_issue_and_redeem() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1]).await.session.id;

    let (status, bytes) = send(&app, "POST", &format!("/sessions/{session_id}/pairing"), None).await;
    assert_eq!(status, StatusCode::OK);
    let grant: PairingGrant = decode(&bytes);
    assert_eq!(grant.token.len(), 32);
    assert_eq!(grant.qr_payload, format!("https://wms.test/m/{}", grant.token));
    assert_eq!(fx.pairing_store.len(), 1);

    let (status, bytes) = send(&app, "POST", "/pairing/redeem", Some(json!({ "token": grant.token }))).await;
    assert_eq!(status, StatusCode::OK);
    let redeemed: RedeemResponse = decode(&bytes);
    assert_eq!(redeemed.session_id, session_id);

    let (status, _) = send(&app, "POST", "/pairing/redeem", Some(json!({ "token": "bogus" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", &format!("/sessions/{}/pairing", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn suggestions_are_fetched_once_per_session() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1, 3]).await.session.id;
    let uri = format!("/sessions/{session_id}/orders/3/suggestions");

    let (status, bytes) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let suggestions: PackagingSuggestions = decode(&bytes);
    assert_eq!(suggestions.suggestions[0].id, 7);
    assert_eq!(suggestions.total_weight, 2.5);
    assert_eq!(suggestions.all_materials.len(), 2);

    send(&app, "GET", &uri, None).await;
    assert_eq!(fx.suggestions.calls(), 1);

    let (status, _) = send(&app, "GET", &format!("/sessions/{session_id}/orders/2/suggestions"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(fx.suggestions.calls(), 1);

    send(
        &app,
        "POST",
        &format!("/sessions/{session_id}/complete"),
        Some(json!({ "role": "desktop" })),
    )
    .await;
    assert!(fx.state.suggestions.cached(session_id, 3).is_none());

    // Ended sessions do not refill the cache.
    let (status, _) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(fx.state.suggestions.sessions(), 0);
    assert_eq!(fx.suggestions.calls(), 1);
}

#[tokio::test]
async fn photo_upload_requires_a_pairing_token() {
    let fx = fixture();
    let app = build_router(fx.state.clone());
    let session_id = start(&app, &[1]).await.session.id;
    let other_session = start(&app, &[2]).await.session.id;
    let grant = fx.state.pairing.issue(session_id).await.unwrap();
    let foreign = fx.state.pairing.issue(other_session).await.unwrap();

    let upload = |token: &str| {
        Request::builder()
            .method("POST")
            .uri(format!("/sessions/{session_id}/orders/1/photo?token={token}"))
            .header("content-type", "image/jpeg")
            .body(Body::from(vec![0xFF, 0xD8, 0xFF, 0xE0]))
            .unwrap()
    };

    let response = app.clone().oneshot(upload("bogus")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.clone().oneshot(upload(&foreign.token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(fx.photos.stored(), 0);

    let response = app.clone().oneshot(upload(&grant.token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let photo: PhotoResponse = decode(&bytes);
    assert_eq!(photo.order_id, 1);
    assert!(photo.photo_url.starts_with("https://cdn.test/photos/"));
    assert_eq!(fx.photos.stored(), 1);

    let snapshot = fx.state.store.snapshot(session_id).unwrap();
    assert_eq!(
        snapshot.session.order(1).unwrap().packing_photo_url.as_deref(),
        Some(photo.photo_url.as_str())
    );
    assert_eq!(snapshot.sequence, 0);
}
