//! HTTP surface tests, driven through the router without a socket

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use common::*;
use whip_mpegts_server::api::{build_router, AppState};
use whip_mpegts_server::config::Config;

fn app(factory: Arc<FakePeerFactory>, config: Config) -> Router {
    let (consumer, _streams) = collecting_consumer();
    let manager = manager(&config, factory, consumer);
    build_router(AppState::new(manager, Arc::new(config)))
}

fn idle_config() -> Config {
    let mut config = test_config();
    config.pipeline.barrier_timeout_secs = 30;
    config
}

fn idle_app() -> (Router, Arc<FakePeerFactory>) {
    let factory = Arc::new(FakePeerFactory::new(&["a"], Vec::new()));
    (app(Arc::clone(&factory), idle_config()), factory)
}

fn request(method: Method, uri: &str, content_type: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// POST an offer and return the session's Location
async fn publish(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(request(Method::POST, "/", Some("application/sdp"), OFFER))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_offer_returns_answer() {
    let (app, _) = idle_app();

    let response = app
        .oneshot(request(Method::POST, "/", Some("application/sdp"), OFFER))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/sdp"
    );
    let location = response.headers().get(header::LOCATION).unwrap();
    let location = location.to_str().unwrap().to_string();
    assert!(location.starts_with('/'));
    assert_eq!(location.len(), 33);

    let body = body_string(response).await;
    assert!(body.contains("a=fake-answer"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_location_uses_public_base_url() {
    let mut config = idle_config();
    config.server.public_base_url = Some("https://ingest.example.com/whip/".to_string());
    let app = app(
        Arc::new(FakePeerFactory::new(&["a"], Vec::new())),
        config,
    );

    let location = publish(&app).await;
    assert!(location.starts_with("https://ingest.example.com/whip/"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_requires_sdp() {
    let (app, factory) = idle_app();

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/", Some("text/plain"), OFFER))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = body_string(response).await;
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "unsupported_media_type");

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/", None, OFFER))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = app
        .oneshot(request(Method::POST, "/", Some("application/sdp"), "  "))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(factory.log.created.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_bad_offer_is_bad_request() {
    let (app, _) = idle_app();

    let response = app
        .oneshot(request(Method::POST, "/", Some("application/sdp"), BAD_OFFER))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"], "negotiation_failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_patch_session() {
    let (app, factory) = idle_app();
    let location = publish(&app).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::PATCH,
            &location,
            Some("application/trickle-ice-sdpfrag"),
            "a=candidate:1 1 udp 1 127.0.0.1 9 typ host\r\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = app
        .clone()
        .oneshot(request(Method::PATCH, &location, Some("application/sdp"), OFFER))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(factory.log.remote_updates.load(Ordering::SeqCst), 1);

    let response = app
        .oneshot(request(Method::PATCH, "/missing", Some("application/sdp"), OFFER))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_session_twice() {
    let (app, factory) = idle_app();
    let location = publish(&app).await;

    let response = app
        .clone()
        .oneshot(request(Method::DELETE, &location, None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(factory.log.closed.load(Ordering::SeqCst), 1);

    let response = app
        .oneshot(request(Method::DELETE, &location, None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"], "session_not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_on_endpoint_not_allowed() {
    let (app, _) = idle_app();

    let response = app
        .oneshot(request(Method::GET, "/", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_and_metrics() {
    let (app, _) = idle_app();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/health", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK");

    let response = app
        .oneshot(request(Method::GET, "/metrics", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(json.get("sessions_created").is_some());
    assert!(json.get("active_sessions").is_some());
}
