use crate::config::Config;
use crate::logging::{self, LogLevel};
use crate::upstream::sanitize::CREDENTIAL_HEADER;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Deserialize;
use sonic_rs::JsonValueTrait;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// 连接失败、超时、读取响应体失败等传输层错误。
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// Key 含有不能放进 HTTP 头的字符。
    #[error("凭证无法写入请求头")]
    InvalidCredential,
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }
}

/// 429 的两类来源：日配额用尽（换 Key）与每分钟限流（等待后同 Key 重试）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Daily,
    PerMinute,
}

impl QuotaKind {
    pub fn is_daily(self) -> bool {
        self == Self::Daily
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "RPD",
            Self::PerMinute => "RPM",
        }
    }
}

/// 上游错误体 `{"error":{"message":...}}` 中含 "per day"/"daily" 即视为日配额；
/// 其余（包括无法解析的响应体）一律视为每分钟限流。
pub fn classify_quota_error(body: &[u8]) -> QuotaKind {
    #[derive(Deserialize)]
    struct ErrResp {
        #[serde(default)]
        error: Option<ErrInner>,
    }

    #[derive(Deserialize)]
    struct ErrInner {
        #[serde(default)]
        message: Option<sonic_rs::Value>,
    }

    let message = sonic_rs::from_slice::<ErrResp>(body)
        .ok()
        .and_then(|r| r.error)
        .and_then(|e| e.message)
        .and_then(|m| m.as_str().map(str::to_lowercase))
        .unwrap_or_default();

    if message.contains("per day") || message.contains("daily") {
        QuotaKind::Daily
    } else {
        QuotaKind::PerMinute
    }
}

/// 一次非流式上游调用的完整结果（响应体已读完）。
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 发往上游的请求描述；headers 已清洗，凭证在发送时注入。
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    http_stream: reqwest::Client,
    base_url: String,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut http_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(cfg.connect_timeout);

        // 流式响应可能持续很久，只限制建立连接的时间。
        let mut stream_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(cfg.connect_timeout);

        if cfg.request_timeout > Duration::ZERO {
            http_builder = http_builder.timeout(cfg.request_timeout);
        }

        if !cfg.proxy.trim().is_empty() {
            http_builder = http_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
            stream_builder = stream_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: http_builder.build()?,
            http_stream: stream_builder.build()?,
            base_url: cfg.gemini_base_url.trim_end_matches('/').to_string(),
            log_level: cfg.detail_log_level(),
        })
    }

    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let path = path.trim_start_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{}/{path}?{q}", self.base_url),
            _ => format!("{}/{path}", self.base_url),
        }
    }

    fn build_headers(&self, req: &OutboundRequest, secret: &str) -> Result<HeaderMap, UpstreamError> {
        let mut headers = req.headers.clone();
        let value =
            HeaderValue::from_str(secret).map_err(|_| UpstreamError::InvalidCredential)?;
        headers.insert(CREDENTIAL_HEADER, value);
        Ok(headers)
    }

    /// 非流式转发：发送并读完整个响应体。
    pub async fn send(
        &self,
        req: &OutboundRequest,
        secret: &str,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.url_for(&req.path, req.query.as_deref());
        let headers = self.build_headers(req, secret)?;
        logging::backend_request(
            self.log_level,
            req.method.as_str(),
            &url,
            &headers,
            &req.body,
        );

        let start = Instant::now();
        let resp = self
            .http
            .request(req.method.clone(), url)
            .headers(headers)
            .body(req.body.clone())
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        logging::backend_response(self.log_level, status.as_u16(), start.elapsed(), &body);

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// 流式转发：只等到响应头返回，响应体由调用方逐块读取。
    pub async fn open_stream(
        &self,
        req: &OutboundRequest,
        secret: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.url_for(&req.path, req.query.as_deref());
        let headers = self.build_headers(req, secret)?;
        logging::backend_request(
            self.log_level,
            req.method.as_str(),
            &url,
            &headers,
            &req.body,
        );

        let resp = self
            .http_stream
            .request(req.method.clone(), url)
            .headers(headers)
            .body(req.body.clone())
            .send()
            .await?;
        Ok(resp)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }
}
