//! 选择算法：在全部可用 Key 中取“当日剩余配额”最大者。
//!
//! 贪心地把负载推向用得最少的 Key；同分时取插入顺序靠前者，保证同一状态下结果确定。

use crate::key_pool::types::Credential;
use chrono::{DateTime, Utc};

/// 返回被选中 Key 在切片中的下标；没有可用 Key 时返回 None。
pub fn select_most_remaining(credentials: &[Credential], now: DateTime<Utc>) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (idx, c) in credentials.iter().enumerate() {
        if !c.is_eligible(now) {
            continue;
        }
        let remaining = c.daily_remaining();
        match best {
            // 严格大于才替换：同分保留先出现的。
            Some((_, r)) if remaining <= r => {}
            _ => best = Some((idx, remaining)),
        }
    }
    best.map(|(idx, _)| idx)
}
