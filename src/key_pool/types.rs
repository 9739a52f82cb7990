use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// 每分钟限流的滑动窗口长度。
pub const MINUTE_WINDOW: Duration = Duration::seconds(60);

pub const DEFAULT_DAILY_LIMIT: u32 = 250;
pub const DEFAULT_PER_MINUTE_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialState {
    Active,
    Exhausted,
}

/// 池中的一个上游 API Key 及其用量记录。
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: String,
    pub daily_limit: u32,
    pub per_minute_limit: u32,
    pub daily_used: u32,
    /// 最近请求时刻（升序），只追加；过期条目由 prune 清理。
    pub minute_window: VecDeque<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub state: CredentialState,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<String>,
        daily_limit: u32,
        per_minute_limit: u32,
    ) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            daily_limit,
            per_minute_limit,
            daily_used: 0,
            minute_window: VecDeque::new(),
            last_used_at: None,
            last_error_at: None,
            consecutive_failures: 0,
            state: CredentialState::Active,
        }
    }

    pub fn daily_remaining(&self) -> i64 {
        i64::from(self.daily_limit) - i64::from(self.daily_used)
    }

    /// 移除窗口外（早于 now - 60s）的时间戳。
    pub fn prune_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - MINUTE_WINDOW;
        while self.minute_window.front().is_some_and(|ts| *ts <= cutoff) {
            self.minute_window.pop_front();
        }
    }

    /// 不修改窗口，仅统计 now 之前 60 秒内的请求数。
    pub fn minute_count(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - MINUTE_WINDOW;
        self.minute_window.iter().filter(|ts| **ts > cutoff).count()
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == CredentialState::Active
            && self.daily_used < self.daily_limit
            && self.minute_count(now) < self.per_minute_limit as usize
    }

    /// 日志/状态接口中使用的脱敏形式：前 8 位 + ... + 后 3 位。
    pub fn redacted(&self) -> String {
        redact_secret(&self.secret)
    }

    pub fn status(&self, now: DateTime<Utc>) -> CredentialStatus {
        CredentialStatus {
            id: self.id.clone(),
            key_prefix: self.redacted(),
            status: self.state,
            rpd_used: self.daily_used,
            rpd_limit: self.daily_limit,
            rpd_remaining: self.daily_remaining(),
            rpm_limit: self.per_minute_limit,
            rpm_current: self.minute_count(now),
            last_used: self.last_used_at,
            last_error: self.last_error_at,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

pub fn redact_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 11 {
        return secret.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}...{tail}")
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: String,
    pub key_prefix: String,
    pub status: CredentialState,
    pub rpd_used: u32,
    pub rpd_limit: u32,
    pub rpd_remaining: i64,
    pub rpm_limit: u32,
    pub rpm_current: usize,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// 池的只读聚合视图（同一临界区内一次性计算）。
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub next_reset: Option<NaiveDate>,
    pub keys: Vec<CredentialStatus>,
}
