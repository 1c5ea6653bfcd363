//! The JSON-over-HTTP surface.
//!
//! | Route | Body | Reply |
//! |-------|------|-------|
//! | `POST /v1/id` | `{"name"}` | `{"name","id"}` |
//! | `POST /v1/id/set` | `{"name","value","force"}` | `{"name","current"}` |
//! | `POST /v1/id/mset` | `{"force","values":[{"name","value"}]}` | `{"values":{name:current}}` |
//! | `GET /v1/services` | | `{"services":{name:current}}` |
//!
//! Failures reply `{"error": message}` with 400, 404 or 500. A failed `mset`
//! replies 500 with the entries applied before the failure.

pub mod handler;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use segid::{Manager, Store};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub fn router<S: Store>(manager: Arc<Manager<S>>) -> Router {
    Router::new()
        .route("/v1/id", post(handler::next_id::<S>))
        .route("/v1/id/set", post(handler::set_id::<S>))
        .route("/v1/id/mset", post(handler::set_multi::<S>))
        .route("/v1/services", get(handler::list_services::<S>))
        .with_state(manager)
}

/// Serves `router` until `shutdown` is cancelled and in-flight requests
/// complete.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::http::types::{ErrorReply, IdReply, MultiSetReply, ServicesReply, SetReply};
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
    };
    use segid::{ManagerConfig, MemoryStore, StoreOp};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let manager = Manager::new(
            Arc::clone(&store),
            ManagerConfig::default().with_batch_size(10),
        );
        (store, router(Arc::new(manager)))
    }

    async fn call<T: DeserializeOwned>(
        app: &Router,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, T) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn set_then_next() {
        let (_store, app) = app();

        let (status, reply): (_, SetReply) = call(
            &app,
            Method::POST,
            "/v1/id/set",
            r#"{"name":"orders","value":1000}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            reply,
            SetReply {
                name: "orders".to_owned(),
                current: 1000
            }
        );

        let (status, reply): (_, IdReply) =
            call(&app, Method::POST, "/v1/id", r#"{"name":"orders"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.id, 1001);

        let (_, reply): (_, ServicesReply) = call(&app, Method::GET, "/v1/services", "").await;
        assert_eq!(reply.services.get("orders"), Some(&1001));
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let (store, app) = app();
        let (status, reply): (_, ErrorReply) =
            call(&app, Method::POST, "/v1/id", r#"{"name":"missing"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reply.error, "service name not exists");
        assert!(!store.peek_table("gid_key_missing"));
    }

    #[tokio::test]
    async fn bad_requests() {
        let (_store, app) = app();
        for (uri, body) in [
            ("/v1/id/set", r#"{"name":"o","value":10}"#),
            ("/v1/id/set", r#"{"name":"orders","value":0}"#),
            ("/v1/id/set", r#"{"name":"bad-name","value":10}"#),
            ("/v1/id/set", r#"{"name":"orders""#),
            ("/v1/id", r#"{}"#),
            ("/v1/id/mset", r#"{"values":[]}"#),
        ] {
            let (status, _): (_, ErrorReply) = call(&app, Method::POST, uri, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} {body}");
        }
    }

    #[tokio::test]
    async fn multi_set_applies_in_order() {
        let (_store, app) = app();
        let (status, reply): (_, MultiSetReply) = call(
            &app,
            Method::POST,
            "/v1/id/mset",
            r#"{"force":false,"values":[{"name":"orders","value":10},{"name":"users","value":20}]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.values.len(), 2);
        assert_eq!(reply.values["users"], 20);
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn multi_set_failure_reports_partial_results() {
        let (store, app) = app();
        let (status, reply): (_, MultiSetReply) = call(
            &app,
            Method::POST,
            "/v1/id/mset",
            r#"{"values":[{"name":"orders","value":30},{"name":"bad-name","value":20},{"name":"users","value":5}]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.values.get("orders"), Some(&30));
        assert_eq!(reply.values.len(), 1);
        assert!(reply.error.is_some());
        assert!(!store.peek_table("gid_key_users"));
    }

    #[tokio::test]
    async fn store_failures_are_internal_errors() {
        let (store, app) = app();
        store.fail_next(StoreOp::CreateTable);
        let (status, reply): (_, ErrorReply) = call(
            &app,
            Method::POST,
            "/v1/id/set",
            r#"{"name":"orders","value":10}"#,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.error, "injected CreateTable failure");
    }
}
