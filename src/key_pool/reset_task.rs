//! 后台日界检查：即使没有流量，太平洋时间午夜后状态接口也能反映已重置的配额。

use crate::key_pool::KeyPool;
use std::sync::Arc;
use std::time::Duration;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn_daily_reset_task(pool: Arc<KeyPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if pool.reset_if_new_day().await {
                tracing::info!("日配额已重置（America/Los_Angeles 新的一天）");
            }
        }
    });
}
