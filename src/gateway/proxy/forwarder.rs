use super::stream::relay_stream;
use crate::error::AppError;
use crate::key_pool::{Credential, CredentialProvider};
use crate::upstream::sanitize::{
    is_streaming_query, prepare_request_headers, prepare_response_headers, strip_key_from_query,
};
use crate::upstream::{
    OutboundRequest, UpstreamClient, UpstreamError, UpstreamResponse, classify_quota_error,
};
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Duration;

pub const POOL_EXHAUSTED_MESSAGE: &str = "All API keys exhausted";
pub const ATTEMPTS_EXHAUSTED_MESSAGE: &str = "Service temporarily unavailable";

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// 每分钟限流（RPM）429 后、同 Key 重试前的等待时间。
    pub retry_delay: Duration,
}

/// 入站请求（路由层提取后的原始形态）。
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 带 Key 轮换与有限重试的上游转发器。
#[derive(Debug)]
pub struct Forwarder<P> {
    provider: Arc<P>,
    upstream: UpstreamClient,
}

impl<P> Clone for Forwarder<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

impl<P: CredentialProvider> Forwarder<P> {
    pub fn new(provider: Arc<P>, upstream: UpstreamClient) -> Self {
        Self { provider, upstream }
    }

    /// 转发一次入站请求。
    ///
    /// - 无可用 Key：立即 503（不计入重试次数）
    /// - 传输错误：记失败，下一轮重新选 Key
    /// - 429 日配额：标记耗尽并换 Key；429 每分钟限流：等待 retry_delay 后同 Key 重试
    /// - 其他状态码：原样返回
    /// - 重试次数用尽：503
    ///
    /// 调用方断开时 axum 会丢弃该 future，循环随之终止；已记录的计数不回滚。
    pub async fn forward(&self, req: InboundRequest, policy: RetryPolicy) -> Response {
        let outbound = OutboundRequest {
            method: req.method,
            path: req.path,
            query: strip_key_from_query(req.query.as_deref()),
            headers: prepare_request_headers(&req.headers),
            body: req.body,
        };
        let streaming = is_streaming_query(outbound.query.as_deref());

        let mut reuse: Option<Credential> = None;
        for attempt in 1..=policy.max_attempts {
            let cred = match reuse.take() {
                Some(c) => c,
                None => match self.provider.select_credential().await {
                    Some(c) => c,
                    None => {
                        tracing::warn!(attempt, "没有可用的 API Key，返回 503");
                        return AppError::unavailable(POOL_EXHAUSTED_MESSAGE).into_response();
                    }
                },
            };

            if streaming {
                match self.upstream.open_stream(&outbound, &cred.secret).await {
                    Ok(resp) => {
                        return relay_stream(
                            self.provider.as_ref(),
                            &cred,
                            resp,
                            self.upstream.log_level(),
                        )
                        .await;
                    }
                    Err(e) => {
                        self.record_transport_failure(&cred, attempt, &e).await;
                        continue;
                    }
                }
            }

            let resp = match self.upstream.send(&outbound, &cred.secret).await {
                Ok(r) => r,
                Err(e) => {
                    self.record_transport_failure(&cred, attempt, &e).await;
                    continue;
                }
            };

            // 只要请求到达上游就计一次用量，包括随后被判定为 429 的请求。
            self.provider.record_success(&cred.id).await;

            if resp.status == StatusCode::TOO_MANY_REQUESTS {
                let kind = classify_quota_error(&resp.body);
                self.provider
                    .record_failure(&cred.id, kind.is_daily())
                    .await;
                tracing::warn!(
                    key = %cred.redacted(),
                    kind = kind.as_str(),
                    attempt,
                    "上游返回 429"
                );
                if !kind.is_daily() {
                    tokio::time::sleep(policy.retry_delay).await;
                    reuse = Some(cred);
                }
                continue;
            }

            return passthrough(resp);
        }

        tracing::warn!(
            max_attempts = policy.max_attempts,
            "重试次数已用尽，返回 503"
        );
        AppError::unavailable(ATTEMPTS_EXHAUSTED_MESSAGE).into_response()
    }

    async fn record_transport_failure(&self, cred: &Credential, attempt: usize, e: &UpstreamError) {
        if e.is_timeout() {
            tracing::error!(key = %cred.redacted(), attempt, "转发到上游超时");
        } else {
            tracing::error!(key = %cred.redacted(), attempt, error = %e, "转发到上游失败");
        }
        self.provider.record_failure(&cred.id, false).await;
    }
}

fn passthrough(resp: UpstreamResponse) -> Response {
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    *out.headers_mut() = prepare_response_headers(&resp.headers);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::key_pool::KeyPool;
    use axum::http::{HeaderValue, header};
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GENERATE_PATH: &str = "/v1beta/models/gemini-2.0-flash:generateContent";

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_delay: Duration::ZERO,
        }
    }

    fn upstream_for(server_uri: &str) -> UpstreamClient {
        UpstreamClient::new(&Config::for_tests(server_uri)).unwrap()
    }

    fn pool(secrets: &[&str], rpd: u32) -> Arc<KeyPool> {
        let seeds: Vec<String> = secrets.iter().map(|s| s.to_string()).collect();
        Arc::new(KeyPool::new(&seeds, rpd, 10))
    }

    fn inbound(query: Option<&str>) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        InboundRequest {
            method: Method::POST,
            path: GENERATE_PATH.to_string(),
            query: query.map(str::to_string),
            headers,
            body: Bytes::from_static(br#"{"contents":[]}"#),
        }
    }

    async fn body_bytes(resp: Response) -> Bytes {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn sent_keys(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| {
                r.headers
                    .get("x-goog-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    async fn total_used(pool: &KeyPool) -> u32 {
        pool.snapshot().await.keys.iter().map(|k| k.rpd_used).sum()
    }

    /// 测试替身：按顺序发放 Key，并记录所有回写调用。
    #[derive(Debug, Default)]
    struct FakeProvider {
        keys: Mutex<Vec<Credential>>,
        successes: Mutex<Vec<String>>,
        failures: Mutex<Vec<(String, bool)>>,
    }

    impl FakeProvider {
        fn with_keys(keys: &[(&str, &str)]) -> Self {
            let mut list: Vec<Credential> = keys
                .iter()
                .map(|(id, secret)| Credential::new(*id, *secret, 250, 10))
                .collect();
            list.reverse();
            Self {
                keys: Mutex::new(list),
                ..Self::default()
            }
        }
    }

    impl CredentialProvider for FakeProvider {
        async fn select_credential(&self) -> Option<Credential> {
            self.keys.lock().unwrap().pop()
        }

        async fn record_success(&self, id: &str) {
            self.successes.lock().unwrap().push(id.to_string());
        }

        async fn record_failure(&self, id: &str, is_daily_limit: bool) {
            self.failures
                .lock()
                .unwrap()
                .push((id.to_string(), is_daily_limit));
        }
    }

    #[tokio::test]
    async fn successful_requests_charge_exactly_once_each() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1", "secret-bbbbbbbb-2", "secret-cccccccc-3"], 250);
        let fwd = Forwarder::new(pool.clone(), upstream_for(&server.uri()));

        for _ in 0..3 {
            let resp = fwd.forward(inbound(None), policy(3)).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_bytes(resp).await.as_ref(), br#"{"ok":true}"#);
        }

        assert_eq!(total_used(&pool).await, 3);
        // 按剩余配额最大者选择：三次请求分散到三个 Key。
        let mut keys = sent_keys(&server).await;
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn daily_quota_error_fails_over_to_another_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": 429, "message": "quota exceeded per day", "status": "RESOURCE_EXHAUSTED"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1", "secret-bbbbbbbb-2"], 250);
        let fwd = Forwarder::new(pool.clone(), upstream_for(&server.uri()));

        let resp = fwd.forward(inbound(None), policy(3)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let keys = sent_keys(&server).await;
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);

        let status = pool.snapshot().await;
        assert_eq!(status.exhausted_keys, 1);
        // 已知行为：被 429 拒绝的那次请求同样计入日用量。
        assert_eq!(total_used(&pool).await, 2);
    }

    #[tokio::test]
    async fn per_minute_quota_error_retries_same_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": 429, "message": "Quota exceeded per minute"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let provider = Arc::new(FakeProvider::with_keys(&[
            ("key_1", "server-key-1"),
            ("key_2", "server-key-2"),
        ]));
        let fwd = Forwarder::new(provider.clone(), upstream_for(&server.uri()));

        let resp = fwd.forward(inbound(None), policy(2)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(sent_keys(&server).await, ["server-key-1", "server-key-1"]);

        assert_eq!(*provider.failures.lock().unwrap(), [("key_1".to_string(), false)]);
        assert_eq!(*provider.successes.lock().unwrap(), ["key_1", "key_1"]);
        // 复用时不会再调用 select：第二个 Key 仍未发放。
        assert_eq!(provider.keys.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_pool_returns_503_without_calling_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1"], 250);
        pool.record_failure("key_1", true).await;
        let fwd = Forwarder::new(pool, upstream_for(&server.uri()));

        let resp = fwd.forward(inbound(None), policy(3)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "60");
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(body["error"]["message"], POOL_EXHAUSTED_MESSAGE);
        assert_eq!(body["error"]["status"], "UNAVAILABLE");

        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_return_503() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "rate limited"}
            })))
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1"], 250);
        let fwd = Forwarder::new(pool.clone(), upstream_for(&server.uri()));

        let resp = fwd.forward(inbound(None), policy(3)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "60");
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(body["error"]["message"], ATTEMPTS_EXHAUSTED_MESSAGE);

        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        let s = pool.credential_status("key_1").await.unwrap();
        assert_eq!(s.rpd_used, 3);
        assert_eq!(s.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn other_errors_pass_through_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("x-upstream-trace", "abc123")
                    .set_body_raw(r#"{"error":{"code":400,"message":"bad"}}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1"], 250);
        let fwd = Forwarder::new(pool.clone(), upstream_for(&server.uri()));

        let resp = fwd.forward(inbound(None), policy(3)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()["x-upstream-trace"], "abc123");
        assert!(resp.headers().get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(
            body_bytes(resp).await.as_ref(),
            br#"{"error":{"code":400,"message":"bad"}}"#
        );
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(total_used(&pool).await, 1);
    }

    #[tokio::test]
    async fn caller_credentials_are_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = pool(&["server-key-1"], 250);
        let fwd = Forwarder::new(pool, upstream_for(&server.uri()));

        let mut req = inbound(Some("key=caller-key&foo=bar"));
        req.headers
            .insert("x-goog-api-key", HeaderValue::from_static("caller-key"));
        req.headers
            .insert("custom-header", HeaderValue::from_static("custom-value"));
        req.headers
            .insert(header::HOST, HeaderValue::from_static("incoming.example"));

        let resp = fwd.forward(req, policy(1)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let received = server.received_requests().await.unwrap();
        let sent = &received[0];
        assert_eq!(sent.headers["x-goog-api-key"], "server-key-1");
        assert_eq!(sent.headers["custom-header"], "custom-value");
        assert_ne!(sent.headers["host"], "incoming.example");
        assert_eq!(sent.url.query(), Some("foo=bar"));
        assert_eq!(sent.body, br#"{"contents":[]}"#);
    }

    #[tokio::test]
    async fn transport_errors_rotate_keys_and_record_failures() {
        // 端口 1 上没有服务：连接被拒绝。
        let provider = Arc::new(FakeProvider::with_keys(&[
            ("key_1", "server-key-1"),
            ("key_2", "server-key-2"),
        ]));
        let fwd = Forwarder::new(provider.clone(), upstream_for("http://127.0.0.1:1"));

        let resp = fwd.forward(inbound(None), policy(2)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            *provider.failures.lock().unwrap(),
            [("key_1".to_string(), false), ("key_2".to_string(), false)]
        );
        assert!(provider.successes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn streaming_relays_bytes_and_charges_once() {
        let sse = "data: {\"candidates\":[1]}\n\ndata: {\"candidates\":[2]}\n\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1"], 250);
        let fwd = Forwarder::new(pool.clone(), upstream_for(&server.uri()));

        let mut req = inbound(Some("alt=sse&key=caller"));
        req.path = "/v1beta/models/gemini-2.0-flash:streamGenerateContent".to_string();
        let resp = fwd.forward(req, policy(3)).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(body_bytes(resp).await.as_ref(), sse.as_bytes());
        assert_eq!(total_used(&pool).await, 1);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].url.query(), Some("alt=sse"));
    }

    #[tokio::test]
    async fn streaming_errors_are_relayed_once_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "quota exceeded per day"}
            })))
            .mount(&server)
            .await;

        let pool = pool(&["secret-aaaaaaaa-1", "secret-bbbbbbbb-2"], 250);
        let fwd = Forwarder::new(pool.clone(), upstream_for(&server.uri()));

        let resp = fwd.forward(inbound(Some("alt=sse")), policy(3)).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(body["error"]["message"], "quota exceeded per day");

        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        // 流式路径不解析 429：只计用量，不标记耗尽。
        let status = pool.snapshot().await;
        assert_eq!(status.exhausted_keys, 0);
        assert_eq!(total_used(&pool).await, 1);
    }
}
