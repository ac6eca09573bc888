//! # Stevedore API
//!
//! The HTTP edge of the deployment controller: a thin translator between
//! JSON requests and controller operations, plus the streaming response
//! multiplexer. Endpoints:
//!
//! | Method | Path | Body |
//! |---|---|---|
//! | GET | `/list` | — |
//! | PUT | `/create` | `{deploy_id}` |
//! | POST | `/setup` | `{deploy_id, services, globals, force}` |
//! | POST | `/upload` | multipart (files + JSON `data`) |
//! | any | `/{plugin}/{func}` | JSON or multipart; plugin-provided |
//!
//! Authentication is a single process-wide bearer token checked against the
//! store; plugin functions may opt out. Streaming responses are the
//! operation's progress context serialized as newline-delimited JSON.

pub mod routes;
pub mod servicefile;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get, post, put};
use tracing::info;

use stevedore_core::Result;
use stevedore_runtime::Controller;

pub use routes::AppState;
pub use servicefile::ServiceFile;
pub use stream::{StreamFormat, stream_response};

/// Builds the edge router for the given controller root.
pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/list", get(routes::list))
        .route("/create", put(routes::create))
        .route("/setup", post(routes::setup))
        .route("/upload", post(routes::upload))
        .route("/{plugin}/{func}", any(routes::plugin_api))
        .with_state(AppState { controller })
}

/// Serves the API until the process is stopped.
pub async fn serve(controller: Arc<Controller>) -> Result<()> {
    let bind = controller.config().bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "serving API");
    axum::serve(listener, router(controller)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use stevedore_core::StaticDiscovery;
    use stevedore_engine::plugins::RequiresPlugin;
    use stevedore_engine::testing::RecordingBackend;
    use stevedore_runtime::Config;
    use tower::ServiceExt;

    fn test_router(dir: &std::path::Path) -> (Router, Arc<Controller>) {
        let config = Config {
            data_dir: dir.join("volumes"),
            state_dir: dir.join("state"),
            ..Config::default()
        };
        let controller = Arc::new(
            Controller::new(
                config,
                "127.0.0.1".to_string(),
                RecordingBackend::new(),
                Arc::new(StaticDiscovery::new()),
                Arc::new(vec![Arc::new(RequiresPlugin)]),
            )
            .unwrap(),
        );
        (router(controller.clone()), controller)
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn json_request(method: &str, path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn setup_for_unknown_deployment_streams_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _controller) = test_router(dir.path());

        let response = router
            .oneshot(json_request(
                "POST",
                "/setup",
                json!({"deploy_id": "nope", "services": {}, "globals": {}, "force": false}),
            ))
            .await
            .unwrap();

        let body = body_string(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        let event: Value = serde_json::from_str(lines[0]).unwrap();
        assert!(
            event["error"]
                .as_str()
                .unwrap()
                .contains("no such deployment")
        );
    }

    #[tokio::test]
    async fn create_then_setup_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _controller) = test_router(dir.path());

        let response = router
            .clone()
            .oneshot(json_request("PUT", "/create", json!({"deploy_id": "foo"})))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("\"job\""), "got: {body}");

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/setup",
                json!({
                    "deploy_id": "foo",
                    "services": {"web": {"image": "example/web"}},
                    "globals": {},
                    "force": false,
                }),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("web - installing"), "got: {body}");
        assert!(!body.contains("\"error\""), "got: {body}");

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listing: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(listing["foo"]["web"]["versions"], json!(1));
        assert_eq!(listing["foo"]["web"]["instances"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected_without_a_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _controller) = test_router(dir.path());

        router
            .clone()
            .oneshot(json_request("PUT", "/create", json!({"deploy_id": "foo"})))
            .await
            .unwrap();
        // Allow the worker to commit.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let response = router
            .oneshot(json_request("PUT", "/create", json!({"deploy_id": "foo"})))
            .await
            .unwrap();
        let event: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(event["error"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let (router, controller) = test_router(dir.path());
        let (key, _) = controller.ensure_auth_key().unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/list")
                    .header(header::AUTHORIZATION, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/list")
                    .header(header::AUTHORIZATION, key)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn held_services_stream_their_hold_reason() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _controller) = test_router(dir.path());

        router
            .clone()
            .oneshot(json_request("PUT", "/create", json!({"deploy_id": "foo"})))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let response = router
            .oneshot(json_request(
                "POST",
                "/setup",
                json!({
                    "deploy_id": "foo",
                    "services": {"web": {"image": "web", "require": "db"}},
                    "globals": {},
                    "force": false,
                }),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("service was held"), "got: {body}");
        assert!(body.contains("waiting for requirement(s): db"), "got: {body}");
    }
}
