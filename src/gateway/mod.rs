pub mod admin;
pub mod proxy;
pub mod sdk;

use crate::key_pool::KeyPool;
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

/// 转发请求体上限（含 base64 内联媒体）。
const MAX_PROXY_BODY_BYTES: usize = 64 * 1024 * 1024;

pub const SERVICE_NAME: &str = "Gemini API Key Pool Proxy";

/// 组装全部路由：/、/health、/admin/*、/sdk/* 优先于兜底转发路由。
pub fn build_router(pool: Arc<KeyPool>, proxy_state: Arc<proxy::ProxyState>) -> Router {
    let handler = proxy::handle_proxy;
    let proxy_routes = Router::new()
        .route(
            "/{*path}",
            get(handler)
                .post(handler)
                .put(handler)
                .delete(handler)
                .patch(handler),
        )
        .layer(DefaultBodyLimit::max(MAX_PROXY_BODY_BYTES))
        .with_state(proxy_state);

    let info_routes = Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .with_state(pool.clone());

    Router::new()
        .merge(info_routes)
        .merge(admin::router(pool.clone()))
        .merge(sdk::router(pool))
        .merge(proxy_routes)
}

async fn handle_root(State(pool): State<Arc<KeyPool>>) -> Json<serde_json::Value> {
    let status = pool.snapshot().await;
    Json(json!({
        "service": SERVICE_NAME,
        "status": "running",
        "keys_available": status.available_keys,
        "total_keys": status.total_keys,
    }))
}

async fn handle_health(State(pool): State<Arc<KeyPool>>) -> Json<serde_json::Value> {
    let status = pool.snapshot().await;
    Json(json!({
        "status": "healthy",
        "keys_available": status.available_keys,
        "total_keys": status.total_keys,
    }))
}
