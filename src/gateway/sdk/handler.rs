use crate::error::AppError;
use crate::gateway::proxy::POOL_EXHAUSTED_MESSAGE;
use crate::key_pool::KeyPool;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// POST /sdk/allocate-key
///
/// 返回真实 Key。借出本身不计用量：调用方每次调用上游后须回报 report-usage。
pub async fn handle_allocate_key(State(pool): State<Arc<KeyPool>>) -> Result<Response, AppError> {
    let cred = pool
        .select_credential()
        .await
        .ok_or_else(|| AppError::unavailable(POOL_EXHAUSTED_MESSAGE))?;
    tracing::info!(key = %cred.redacted(), "SDK 借出 Key");
    Ok(Json(json!({"key_id": cred.id, "api_key": cred.secret})).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ReportRequest {
    #[serde(default)]
    key_id: Option<String>,
    #[serde(default)]
    is_rpd_limit: bool,
}

/// POST /sdk/report-usage `{"key_id": "key_1"}`
pub async fn handle_report_usage(
    State(pool): State<Arc<KeyPool>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let key_id = known_key_id(&pool, &body).await?.0;
    pool.record_success(&key_id).await;
    Ok(recorded())
}

/// POST /sdk/report-error `{"key_id": "key_1", "is_rpd_limit": false}`
pub async fn handle_report_error(
    State(pool): State<Arc<KeyPool>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let (key_id, is_rpd_limit) = known_key_id(&pool, &body).await?;
    pool.record_failure(&key_id, is_rpd_limit).await;
    tracing::warn!(key_id = %key_id, is_rpd_limit, "SDK 回报错误");
    Ok(recorded())
}

async fn known_key_id(pool: &KeyPool, body: &[u8]) -> Result<(String, bool), AppError> {
    let req: ReportRequest = serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))?;
    let key_id = req
        .key_id
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AppError::bad_request("key_id is required"))?;
    if !pool.contains(&key_id).await {
        return Err(AppError::not_found(format!("Key {key_id} not found")));
    }
    Ok((key_id, req.is_rpd_limit))
}

fn recorded() -> Response {
    Json(json!({"status": "recorded"})).into_response()
}
