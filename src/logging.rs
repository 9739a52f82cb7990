use crate::key_pool::redact_secret;
use crate::upstream::sanitize::CREDENTIAL_HEADER;
use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 请求/响应明细日志等级（DEBUG 环境变量）：
/// - off：不输出明细
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：再加上后端（上游）请求/响应（格式化/脱敏）
/// - high：客户端 + 后端，完全原始输出（凭证头仍脱敏）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(level: LogLevel, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.client_enabled() {
        return;
    }
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        body
    );
}

pub fn client_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !level.client_enabled() {
        return;
    }
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body
    );
}

pub fn client_stream_response(level: LogLevel, status: u16, duration: Duration, bytes: usize) {
    if !level.client_enabled() {
        return;
    }
    tracing::info!(
        "\n=================== 客户端流式响应 =======================\n[客户端流式] {} {}ms 共 {} 字节\n==========================================================",
        status,
        format_duration_ms(duration),
        bytes
    );
}

pub fn backend_request(level: LogLevel, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.backend_enabled() {
        return;
    }
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        body
    );
}

pub fn backend_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !level.backend_enabled() {
        return;
    }
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body
    );
}

pub fn backend_stream_chunk_raw(level: LogLevel, chunk: &[u8]) {
    if !level.raw_enabled() {
        return;
    }
    tracing::info!("{}", String::from_utf8_lossy(chunk));
}

/// 头部格式化：凭证类头一律脱敏，即使是 high 级别。
fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        let key = name.as_str();
        let val: Cow<'_, str> = match key {
            CREDENTIAL_HEADER => Cow::Owned(redact_secret(value.to_str().unwrap_or(""))),
            "authorization" | "proxy-authorization" | "cookie" => Cow::Borrowed("***"),
            _ => Cow::Borrowed(value.to_str().unwrap_or("<binary>")),
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&val);
        out.push('\n');
    }
    out
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 极端大包：不做 JSON 解析，只输出头尾。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head = &bytes[..HEAD_TAIL];
        let tail = &bytes[bytes.len() - HEAD_TAIL..];
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(head)),
            truncate_text_for_log(&String::from_utf8_lossy(tail))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => {
            let sanitized = sanitize_json_for_log(&v, false);
            sonic_rs::to_string_pretty(&sanitized).unwrap_or_else(|_| sanitized.to_string())
        }
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn format_bytes_raw(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

/// Gemini 请求里的 inlineData.data 是 base64 媒体，日志中只保留头尾。
fn sanitize_json_for_log(v: &sonic_rs::Value, in_inline_data: bool) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match key {
                "inlineData" | "inline_data" => sanitize_json_for_log(child, true),
                "data" if in_inline_data => match child.as_str() {
                    Some(s) => sonic_rs::Value::from(truncate_base64(s).as_ref()),
                    None => sanitize_json_for_log(child, false),
                },
                _ => sanitize_json_for_log(child, in_inline_data),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr
            .iter()
            .map(|item| sanitize_json_for_log(item, in_inline_data))
            .collect();
        return sonic_rs::Value::from(out);
    }

    v.to_owned()
}

fn truncate_base64(s: &str) -> Cow<'_, str> {
    const KEEP: usize = 20;
    if s.len() <= 100 || !s.is_ascii() {
        return Cow::Borrowed(s);
    }
    let omitted = s.len() - KEEP * 2;
    Cow::Owned(format!(
        "{}...[TRUNCATED: {omitted} chars]...{}",
        &s[..KEEP],
        &s[s.len() - KEEP..]
    ))
}
