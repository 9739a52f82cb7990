use crate::key_pool::{Credential, CredentialProvider};
use crate::logging::{self, LogLevel};
use crate::upstream::sanitize::prepare_response_headers;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

/// 上游流已建立（响应头已返回）：计一次用量，然后把响应体原样转给客户端。
///
/// 非 200 时读完整个响应体，连同上游状态码一起返回（不改写为 200 + SSE），
/// 不做 429 分类，也不重试。
pub async fn relay_stream<P: CredentialProvider>(
    provider: &P,
    cred: &Credential,
    resp: reqwest::Response,
    log_level: LogLevel,
) -> Response {
    provider.record_success(&cred.id).await;

    let started_at = Instant::now();
    let status = resp.status();
    let mut headers = prepare_response_headers(resp.headers());
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
    }

    if status != StatusCode::OK {
        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(key = %cred.redacted(), error = %e, "读取上游流式错误响应失败");
                Bytes::new()
            }
        };
        tracing::warn!(
            key = %cred.redacted(),
            status = status.as_u16(),
            "上游流式请求返回非 200，原样透传"
        );
        logging::backend_response(log_level, status.as_u16(), started_at.elapsed(), &body);
        return build_response(status, headers, Body::from(body));
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
    let key = cred.redacted();

    tokio::spawn(async move {
        if let Some(total) = pump(resp.bytes_stream(), tx, log_level, &key).await {
            logging::client_stream_response(log_level, status.as_u16(), started_at.elapsed(), total);
        }
    });

    build_response(status, headers, Body::from_stream(ReceiverStream::new(rx)))
}

/// 逐块转发上游流，返回转发的总字节数。
///
/// 客户端断开（接收端被丢弃）时立即返回 None，不再等待上游的下一块数据；
/// 上游读取失败时把错误交给响应体，客户端连接随之异常结束。
async fn pump<S, E>(
    mut upstream: S,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    log_level: LogLevel,
    key: &str,
) -> Option<usize>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut total = 0usize;
    loop {
        let item = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::debug!(key = %key, "客户端已断开，停止转发上游流");
                return None;
            }
            item = upstream.next() => item,
        };

        match item {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                total += chunk.len();
                logging::backend_stream_chunk_raw(log_level, &chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    tracing::debug!(key = %key, "客户端已断开，停止转发上游流");
                    return None;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "上游流读取中断");
                let _ = tx.send(Err(std::io::Error::other(e))).await;
                return None;
            }
            None => return Some(total),
        }
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
