//! 入站请求 → 上游请求的清洗规则：去掉逐跳头与调用方自带的凭证。

use axum::http::{HeaderMap, HeaderName};

/// 上游凭证头；入站同名头一律丢弃，由代理注入自己的 Key。
pub const CREDENTIAL_HEADER: &str = "x-goog-api-key";

/// 不能原样透传的逐跳头（含 host 与编码/长度相关头，由 HTTP 客户端重新生成）。
pub const HOP_BY_HOP_HEADERS: [&str; 11] = [
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
    "content-encoding",
    "content-length",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    // HeaderName 总是小写。
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// 过滤入站请求头：逐跳头 + 调用方的 x-goog-api-key。
///
/// accept-encoding 也不透传：压缩由 HTTP 客户端协商并自动解压。
pub fn prepare_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name.as_str() == CREDENTIAL_HEADER
            || name.as_str() == "accept-encoding"
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// 过滤上游响应头：仅去掉逐跳头。
pub fn prepare_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// 去掉 query 中所有 `key` 参数；其余参数保持原顺序与原编码。
///
/// 结果为空时返回 None。
pub fn strip_key_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| query_pair_name(pair) != "key")
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

/// `alt=sse` 表示流式请求。
pub fn is_streaming_query(query: Option<&str>) -> bool {
    let Some(query) = query else {
        return false;
    };
    query.split('&').any(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        decode_component(name) == "alt" && decode_component(value) == "sse"
    })
}

fn query_pair_name(pair: &str) -> String {
    let name = pair.split_once('=').map_or(pair, |(n, _)| n);
    decode_component(name)
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    match urlencoding::decode(&s) {
        Ok(v) => v.into_owned(),
        Err(_) => s,
    }
}
