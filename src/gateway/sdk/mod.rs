//! SDK 直连模式：客户端借出真实 Key 自行调用上游，再回报用量与错误。

mod handler;

use crate::key_pool::KeyPool;
use axum::Router;
use axum::routing::post;
use handler::{handle_allocate_key, handle_report_error, handle_report_usage};
use std::sync::Arc;

pub fn router(pool: Arc<KeyPool>) -> Router {
    Router::new()
        .route("/sdk/allocate-key", post(handle_allocate_key))
        .route("/sdk/report-usage", post(handle_report_usage))
        .route("/sdk/report-error", post(handle_report_error))
        .with_state(pool)
}
