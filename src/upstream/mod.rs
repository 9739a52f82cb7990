//! 上游 Gemini API 客户端与请求清洗。

pub mod client;
pub mod sanitize;

pub use client::{
    OutboundRequest, QuotaKind, UpstreamClient, UpstreamError, UpstreamResponse,
    classify_quota_error,
};
