use crate::key_pool::{DEFAULT_DAILY_LIMIT, DEFAULT_PER_MINUTE_LIMIT};
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRY_DELAY_SECONDS: u64 = 2;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// 启动时的种子 Key（GEMINI_API_KEYS，逗号分隔）。
    pub api_keys: Vec<String>,
    pub default_rpd_limit: u32,
    pub default_rpm_limit: u32,

    pub max_retries: usize,
    pub retry_delay: Duration,

    pub gemini_base_url: String,
    pub connect_timeout: Duration,
    /// 非流式请求的整体超时；流式请求只受 connect_timeout 约束。
    pub request_timeout: Duration,
    pub proxy: String,

    pub log_level: String,
    pub debug: String,
}

/// figment 会把 `1`、`true` 之类的值解析成数字/布尔；字符串字段统一接受这些形式。
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
enum StringLike {
    Str(String),
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl StringLike {
    fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::UInt(n) => n.to_string(),
            Self::Int(n) => n.to_string(),
            Self::Float(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(default, alias = "HOST")]
    host: Option<StringLike>,
    #[serde(default, alias = "PORT")]
    port: Option<u16>,

    #[serde(default, alias = "GEMINI_API_KEYS")]
    gemini_api_keys: Option<StringLike>,
    #[serde(default, alias = "DEFAULT_RPD_LIMIT")]
    default_rpd_limit: Option<u32>,
    #[serde(default, alias = "DEFAULT_RPM_LIMIT")]
    default_rpm_limit: Option<u32>,

    #[serde(default, alias = "MAX_RETRIES")]
    max_retries: Option<usize>,
    #[serde(default, alias = "RETRY_DELAY_SECONDS")]
    retry_delay_seconds: Option<u64>,

    #[serde(default, alias = "GEMINI_BASE_URL")]
    gemini_base_url: Option<StringLike>,
    #[serde(default, alias = "CONNECT_TIMEOUT_SECONDS")]
    connect_timeout_seconds: Option<u64>,
    #[serde(default, alias = "REQUEST_TIMEOUT_SECONDS")]
    request_timeout_seconds: Option<u64>,
    #[serde(default, alias = "PROXY")]
    proxy: Option<StringLike>,

    #[serde(default, alias = "LOG_LEVEL")]
    log_level: Option<StringLike>,
    #[serde(default, alias = "DEBUG")]
    debug: Option<StringLike>,
}

impl Config {
    /// 读取 .env 与进程环境变量。任一变量类型不符时返回错误（错误信息包含变量名）。
    pub fn load() -> Result<Self, figment::Error> {
        load_dotenv();
        Self::from_figment(Figment::from(Env::raw()))
    }

    fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        let raw = figment.extract::<RawEnv>()?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw
                .host
                .map(StringLike::into_string)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_keys: parse_api_keys(
                raw.gemini_api_keys
                    .map(StringLike::into_string)
                    .as_deref(),
            ),
            default_rpd_limit: raw.default_rpd_limit.unwrap_or(DEFAULT_DAILY_LIMIT),
            default_rpm_limit: raw.default_rpm_limit.unwrap_or(DEFAULT_PER_MINUTE_LIMIT),
            max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_secs(
                raw.retry_delay_seconds
                    .unwrap_or(DEFAULT_RETRY_DELAY_SECONDS),
            ),
            gemini_base_url: raw
                .gemini_base_url
                .map(StringLike::into_string)
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            connect_timeout: Duration::from_secs(
                raw.connect_timeout_seconds
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            ),
            request_timeout: Duration::from_secs(
                raw.request_timeout_seconds
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            ),
            proxy: raw.proxy.map(StringLike::into_string).unwrap_or_default(),
            log_level: raw
                .log_level
                .map(StringLike::into_string)
                .unwrap_or_else(|| "info".to_string()),
            debug: raw
                .debug
                .map(StringLike::into_string)
                .unwrap_or_else(|| "off".to_string()),
        }
    }

    /// 启动前校验；失败时由 main 以 anyhow 错误退出。
    pub fn validate(&self) -> Result<(), String> {
        if self.api_keys.is_empty() {
            return Err("GEMINI_API_KEYS 必须设置且不能为空".to_string());
        }
        if self.default_rpd_limit == 0 || self.default_rpm_limit == 0 {
            return Err("DEFAULT_RPD_LIMIT / DEFAULT_RPM_LIMIT 必须为正整数".to_string());
        }
        if self.max_retries == 0 {
            return Err("MAX_RETRIES 必须为正整数".to_string());
        }
        Ok(())
    }

    /// 测试用配置：单个种子 Key、零重试间隔、短超时。
    #[cfg(test)]
    pub fn for_tests(base_url: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_keys: vec!["k1".to_string()],
            default_rpd_limit: DEFAULT_DAILY_LIMIT,
            default_rpm_limit: DEFAULT_PER_MINUTE_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::ZERO,
            gemini_base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            proxy: String::new(),
            log_level: "info".to_string(),
            debug: "off".to_string(),
        }
    }

    pub fn detail_log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn parse_api_keys(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已存在的进程环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改环境变量为 unsafe；这里只在启动阶段、单线程读取配置前调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') {
            return value[..i].trim_end();
        }
    }
    value
}
