//! Key 池（Key Pool）模块。
//!
//! 维护所有上游 API Key 的日配额（RPD）与每分钟限流（RPM）状态，
//! 负责选择、用量记录、错误记录以及按太平洋时间的每日重置。状态只存在于内存中。

mod clock;
mod manager;
mod provider;
mod reset_task;
mod selector;
mod types;

pub use clock::{Clock, SystemClock, reference_date};
pub use manager::{KeyPool, PoolError};
pub use provider::CredentialProvider;
pub use reset_task::spawn_daily_reset_task;
pub use types::{
    Credential, CredentialState, CredentialStatus, DEFAULT_DAILY_LIMIT, DEFAULT_PER_MINUTE_LIMIT,
    PoolStatus, redact_secret,
};
