use crate::error::AppError;
use crate::key_pool::{DEFAULT_DAILY_LIMIT, DEFAULT_PER_MINUTE_LIMIT, KeyPool};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// GET /admin/status - 全部 Key 的状态
pub async fn handle_status(State(pool): State<Arc<KeyPool>>) -> Response {
    Json(pool.snapshot().await).into_response()
}

/// GET /admin/status/{key_id} - 单个 Key 的状态
pub async fn handle_key_status(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<String>,
) -> Result<Response, AppError> {
    let status = pool
        .credential_status(&key_id)
        .await
        .ok_or_else(|| AppError::not_found(format!("Key {key_id} not found")))?;
    Ok(Json(status).into_response())
}

/// POST /admin/reset - 立即清零所有日计数
pub async fn handle_reset(State(pool): State<Arc<KeyPool>>) -> Response {
    pool.force_reset().await;
    tracing::info!("管理接口触发计数重置");
    Json(json!({"message": "Counters reset successfully"})).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct AddKeyRequest {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    rpd_limit: Option<serde_json::Value>,
    #[serde(default)]
    rpm_limit: Option<serde_json::Value>,
}

/// POST /admin/keys - 新增 Key
pub async fn handle_add_key(
    State(pool): State<Arc<KeyPool>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let req: AddKeyRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))?;

    // 原样保存；只拒绝空白值。
    let api_key = req
        .api_key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("api_key is required"))?;
    let rpd_limit = positive_limit(req.rpd_limit.as_ref(), DEFAULT_DAILY_LIMIT, "rpd_limit")?;
    let rpm_limit = positive_limit(req.rpm_limit.as_ref(), DEFAULT_PER_MINUTE_LIMIT, "rpm_limit")?;

    let key_id = pool.add_credential(&api_key, rpd_limit, rpm_limit).await?;
    tracing::info!(key_id = %key_id, rpd_limit, rpm_limit, "新增 Key");
    Ok((StatusCode::CREATED, Json(json!({"key_id": key_id}))).into_response())
}

/// DELETE /admin/keys/{key_id} - 删除 Key
pub async fn handle_remove_key(
    State(pool): State<Arc<KeyPool>>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !pool.remove_credential(&key_id).await {
        return Err(AppError::not_found(format!("Key {key_id} not found")));
    }
    tracing::info!(key_id = %key_id, "删除 Key");
    Ok(StatusCode::NO_CONTENT)
}

/// 缺省取默认值；必须是正整数（JSON 数字，不接受字符串或小数）。
fn positive_limit(
    value: Option<&serde_json::Value>,
    default: u32,
    field: &str,
) -> Result<u32, AppError> {
    let Some(value) = value else {
        return Ok(default);
    };
    value
        .as_u64()
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| AppError::bad_request(format!("{field} must be a positive integer")))
}
