//! 测试辅助工具

use std::time::Duration;
use tokio::time::sleep;

/// 测试环境辅助
pub struct TestEnv;

impl TestEnv {
    /// 在超时前等待条件成立
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }

        condition().await
    }

    /// 同步条件版本
    pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        Self::wait_for(|| std::future::ready(condition()), timeout).await
    }
}
