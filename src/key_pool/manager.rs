use crate::key_pool::clock::{Clock, SystemClock, reference_date};
use crate::key_pool::selector;
use crate::key_pool::types::{Credential, CredentialState, CredentialStatus, PoolStatus};
use chrono::{Days, NaiveDate};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("API key already exists")]
    DuplicateCredential,
}

/// Key 池管理器：所有读写都在同一把互斥锁内完成，锁内只做纯内存计算。
#[derive(Debug)]
pub struct KeyPool {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct Inner {
    /// 按插入顺序保存；选择时同分按此顺序取先者。
    credentials: Vec<Credential>,
    last_reset_date: NaiveDate,
}

impl Inner {
    fn find_mut(&mut self, id: &str) -> Option<&mut Credential> {
        self.credentials.iter_mut().find(|c| c.id == id)
    }

    fn reset_counters(&mut self, today: NaiveDate) {
        for c in &mut self.credentials {
            c.daily_used = 0;
            c.consecutive_failures = 0;
            if c.state == CredentialState::Exhausted {
                c.state = CredentialState::Active;
            }
        }
        self.last_reset_date = today;
    }

    fn reset_if_new_day(&mut self, today: NaiveDate) -> bool {
        if today <= self.last_reset_date {
            return false;
        }
        self.reset_counters(today);
        true
    }

    /// “最大数字后缀 + 1”；非 key_N 形式的 id 不参与计算。
    fn next_id(&self) -> String {
        let max = self
            .credentials
            .iter()
            .filter_map(|c| c.id.strip_prefix("key_"))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("key_{}", max + 1)
    }
}

impl KeyPool {
    /// 用启动时的种子 Key 建池，id 依次为 key_1..key_n。
    pub fn new(seed_secrets: &[String], daily_limit: u32, per_minute_limit: u32) -> Self {
        Self::with_clock(
            seed_secrets,
            daily_limit,
            per_minute_limit,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        seed_secrets: &[String],
        daily_limit: u32,
        per_minute_limit: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let credentials = seed_secrets
            .iter()
            .enumerate()
            .map(|(i, secret)| {
                Credential::new(
                    format!("key_{}", i + 1),
                    secret.clone(),
                    daily_limit,
                    per_minute_limit,
                )
            })
            .collect();
        let last_reset_date = reference_date(clock.now());
        Self {
            inner: Mutex::new(Inner {
                credentials,
                last_reset_date,
            }),
            clock,
        }
    }

    /// 选择一个当前可用的 Key（返回值拷贝，而非锁）。None 表示池已耗尽。
    pub async fn select_credential(&self) -> Option<Credential> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if inner.reset_if_new_day(reference_date(now)) {
            tracing::info!("已跨越太平洋时间日界，所有 Key 的日用量已重置");
        }
        for c in &mut inner.credentials {
            c.prune_window(now);
        }
        let idx = selector::select_most_remaining(&inner.credentials, now)?;
        Some(inner.credentials[idx].clone())
    }

    /// 记录一次成功转发。id 已被删除时静默忽略。
    pub async fn record_success(&self, id: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(c) = inner.find_mut(id) else {
            return;
        };
        c.daily_used += 1;
        c.minute_window.push_back(now);
        c.last_used_at = Some(now);
        if c.daily_used >= c.daily_limit {
            c.state = CredentialState::Exhausted;
            tracing::info!(key = %c.redacted(), used = c.daily_used, "Key 当日配额已用尽");
        }
    }

    /// 记录一次失败；is_daily_limit 为 true 时无条件标记为 Exhausted。
    pub async fn record_failure(&self, id: &str, is_daily_limit: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(c) = inner.find_mut(id) else {
            return;
        };
        c.last_error_at = Some(now);
        c.consecutive_failures += 1;
        if is_daily_limit {
            c.state = CredentialState::Exhausted;
        }
    }

    /// 参考时区日期前进时清零日用量与失败计数，返回是否发生了重置。
    pub async fn reset_if_new_day(&self) -> bool {
        let today = reference_date(self.clock.now());
        let mut inner = self.inner.lock().await;
        inner.reset_if_new_day(today)
    }

    /// 管理接口：不论日期，立即清零所有日计数。分钟窗口保留。
    pub async fn force_reset(&self) {
        let today = reference_date(self.clock.now());
        let mut inner = self.inner.lock().await;
        inner.reset_counters(today);
    }

    pub async fn add_credential(
        &self,
        secret: &str,
        daily_limit: u32,
        per_minute_limit: u32,
    ) -> Result<String, PoolError> {
        let mut inner = self.inner.lock().await;
        if inner.credentials.iter().any(|c| c.secret == secret) {
            return Err(PoolError::DuplicateCredential);
        }
        let id = inner.next_id();
        inner.credentials.push(Credential::new(
            id.clone(),
            secret,
            daily_limit,
            per_minute_limit,
        ));
        Ok(id)
    }

    pub async fn remove_credential(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.credentials.len();
        inner.credentials.retain(|c| c.id != id);
        inner.credentials.len() != before
    }

    pub async fn contains(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.credentials.iter().any(|c| c.id == id)
    }

    pub async fn credential_status(&self, id: &str) -> Option<CredentialStatus> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;
        inner
            .credentials
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.status(now))
    }

    pub async fn snapshot(&self) -> PoolStatus {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let mut available_keys = 0usize;
        let mut exhausted_keys = 0usize;
        let mut keys = Vec::with_capacity(inner.credentials.len());
        for c in &inner.credentials {
            if c.state == CredentialState::Exhausted {
                exhausted_keys += 1;
            }
            if c.is_eligible(now) {
                available_keys += 1;
            }
            keys.push(c.status(now));
        }

        PoolStatus {
            total_keys: inner.credentials.len(),
            available_keys,
            exhausted_keys,
            next_reset: inner.last_reset_date.checked_add_days(Days::new(1)),
            keys,
        }
    }
}
