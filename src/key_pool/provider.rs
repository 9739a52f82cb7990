use crate::key_pool::KeyPool;
use crate::key_pool::types::Credential;
use std::future::Future;

/// 转发器依赖的 Key 来源：选择、记录成功、记录失败。
///
/// 与 [`KeyPool`] 的同名方法一一对应；测试中可替换为桩实现。
pub trait CredentialProvider: Send + Sync + 'static {
    fn select_credential(&self) -> impl Future<Output = Option<Credential>> + Send;

    fn record_success(&self, id: &str) -> impl Future<Output = ()> + Send;

    fn record_failure(&self, id: &str, is_daily_limit: bool) -> impl Future<Output = ()> + Send;
}

impl CredentialProvider for KeyPool {
    async fn select_credential(&self) -> Option<Credential> {
        KeyPool::select_credential(self).await
    }

    async fn record_success(&self, id: &str) {
        KeyPool::record_success(self, id).await
    }

    async fn record_failure(&self, id: &str, is_daily_limit: bool) {
        KeyPool::record_failure(self, id, is_daily_limit).await
    }
}
