use super::forwarder::{Forwarder, InboundRequest, RetryPolicy};
use crate::key_pool::KeyPool;
use crate::logging::{self, LogLevel};
use crate::upstream::sanitize::is_streaming_query;
use crate::util::id;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct ProxyState {
    pub forwarder: Forwarder<KeyPool>,
    pub policy: RetryPolicy,
    pub log_level: LogLevel,
}

/// 兜底路由：除健康检查 / admin / sdk 外的所有路径都转发到上游。
pub async fn handle_proxy(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started_at = Instant::now();
    let request_id = id::request_id();
    let path = uri.path().to_string();

    logging::client_request(state.log_level, method.as_str(), &path, &headers, &body);

    let streaming = is_streaming_query(uri.query());

    let span = tracing::info_span!("proxy", request_id = %request_id, method = %method, path = %path);
    let req = InboundRequest {
        method,
        path,
        query: uri.query().map(str::to_string),
        headers,
        body,
    };
    let resp = state
        .forwarder
        .forward(req, state.policy)
        .instrument(span)
        .await;

    if !logs_buffered_body(state.log_level, streaming, resp.status()) {
        // 成功的流式响应由转发任务在结束时记录。
        return resp;
    }

    let (parts, body) = resp.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "读取响应体用于日志失败");
            Bytes::new()
        }
    };
    logging::client_response(
        state.log_level,
        parts.status.as_u16(),
        started_at.elapsed(),
        &bytes,
    );
    Response::from_parts(parts, Body::from(bytes))
}

/// 非流式响应（以及流式路径上的错误响应）的响应体已完整在内存中，可以记录。
fn logs_buffered_body(level: LogLevel, streaming: bool, status: StatusCode) -> bool {
    level.client_enabled() && !(streaming && status == StatusCode::OK)
}
