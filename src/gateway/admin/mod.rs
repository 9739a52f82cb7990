//! 管理接口：查看状态、重置计数、增删 Key。
//!
//! 无鉴权，部署时应只在内网暴露。

mod handler;

use crate::key_pool::KeyPool;
use axum::Router;
use axum::routing::{delete, get, post};
use handler::{handle_add_key, handle_key_status, handle_remove_key, handle_reset, handle_status};
use std::sync::Arc;

pub fn router(pool: Arc<KeyPool>) -> Router {
    Router::new()
        .route("/admin/status", get(handle_status))
        .route("/admin/status/{key_id}", get(handle_key_status))
        .route("/admin/reset", post(handle_reset))
        .route("/admin/keys", post(handle_add_key))
        .route("/admin/keys/{key_id}", delete(handle_remove_key))
        .with_state(pool)
}
