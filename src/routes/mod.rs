pub mod admin;
pub mod logs;
pub mod relay;

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_mw, Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::auth;
use crate::state::AppState;

fn cors(origin: &str) -> CorsLayer {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-goog-api-key"),
        ])
}

/// Assemble the full HTTP surface over shared state.
pub fn app(state: Arc<AppState>) -> Router {
    let admin_routes = admin::router()
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::admin_auth))
        .merge(logs::stream_router());

    let relay_routes = relay::router()
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::api_key_auth));

    let gemini_routes = relay::gemini_router()
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::api_key_auth));

    Router::new()
        .nest("/admin", admin_routes)
        .nest("/v1", relay_routes)
        .nest("/v1beta", gemini_routes)
        .layer(cors(&state.config.cors_origin))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::client::fake::FakeUpstream;
    use crate::config::Config;
    use crate::store::memory::MemoryStore;
    use crate::tasks::BackgroundTask;

    const ADMIN: &str = "Bearer admin-secret";

    async fn setup() -> (Arc<AppState>, mpsc::Receiver<BackgroundTask>) {
        let (state, rx) = AppState::new(
            Config::for_tests(),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeUpstream::new()),
        );
        state.warm_up().await.unwrap();
        (Arc::new(state), rx)
    }

    async fn call(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        auth: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let res = app(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn admin_routes_require_admin_key() {
        let (state, _rx) = setup().await;

        let (status, _) = call(&state, "GET", "/admin/channels", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&state, "GET", "/admin/channels", Some("Bearer nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&state, "GET", "/admin/channels", Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn creating_a_channel_queues_background_work() {
        let (state, mut rx) = setup().await;

        let (status, body) = call(
            &state,
            "POST",
            "/admin/channels",
            Some(ADMIN),
            Some(json!({
                "name": "primary",
                "channel_type": "openai_chat",
                "key": "sk-abcdefghijkl",
                "model": "gpt-4o, gpt-4o-mini",
                "auto_group": "fuzzy"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["base_url"], "https://api.openai.com/v1");
        assert_eq!(body["key_preview"], "sk-a...ijkl");

        let id = body["id"].as_i64().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            BackgroundTask::AutoGroup { channel_id: id }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            BackgroundTask::PriceBackfill {
                names: vec!["gpt-4o".into(), "gpt-4o-mini".into()]
            }
        );

        // renaming leaves the model list alone
        let (status, _) = call(
            &state,
            "PUT",
            &format!("/admin/channels/{id}"),
            Some(ADMIN),
            Some(json!({ "name": "renamed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_names_are_listed_as_models() {
        let (state, _rx) = setup().await;

        let (status, _) = call(
            &state,
            "POST",
            "/admin/groups",
            Some(ADMIN),
            Some(json!({ "name": "smart", "items": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&state, "POST", "/admin/keys", Some(ADMIN), Some(json!({ "name": "ci" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let key = body["key"].as_str().unwrap().to_string();

        let (status, _) = call(&state, "GET", "/v1/models", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&state, "GET", "/v1/models", Some(&format!("Bearer {key}")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "smart");
    }

    #[tokio::test]
    async fn price_names_may_contain_slashes() {
        let (state, _rx) = setup().await;

        let (status, _) = call(
            &state,
            "POST",
            "/admin/prices",
            Some(ADMIN),
            Some(json!({ "name": "meta/llama-3", "input": 0.5, "output": 1.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&state, "GET", "/admin/prices/meta/llama-3", Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], 1.5);

        let (status, _) = call(
            &state,
            "POST",
            "/admin/prices",
            Some(ADMIN),
            Some(json!({ "name": "bad", "input": -1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_token_is_single_use() {
        let (state, _rx) = setup().await;

        let (status, _) = call(&state, "GET", "/admin/logs/stream?token=guess", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, body) = call(&state, "POST", "/admin/logs/stream-token", Some(ADMIN), None).await;
        let token = body["token"].as_str().unwrap().to_string();
        assert!(state.logs.verify_stream_token(&token));

        let req = Request::builder()
            .uri(format!("/admin/logs/stream?token={token}"))
            .body(Body::empty())
            .unwrap();
        let res = app(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!state.logs.verify_stream_token(&token));
    }
}
