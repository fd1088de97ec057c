//! 会话清理与暂存目录清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::{AuthConfig, prune_expired_sessions, prune_login_attempts};
use crate::config::{SESSION_PRUNE_INTERVAL_SECS, STAGING_CLEAN_INTERVAL_SECS};
use crate::staging::Staging;

/// 启动后台任务；`staging_ttl` 为 0 时不清理暂存目录。
pub fn spawn_background_tasks(auth: Arc<AuthConfig>, staging: Arc<Staging>, staging_ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_expired_sessions(&auth).await;
            prune_login_attempts(&auth).await;
        }
    });

    if staging_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match staging.cleanup_stale(staging_ttl).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "stale staged files swept"),
                Err(err) => warn!(error = %err, "staging cleanup failed"),
            }
        }
    });
}
