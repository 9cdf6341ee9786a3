//! 余额同步：分批并发查询上游账单，把本地估算余额校准到远端视图。

use crate::credential::store::Store;
use crate::credential::types::{KeyRecord, KeyStatus};
use crate::logging;
use crate::upstream::{UpstreamClient, UsageError};
use std::sync::Arc;
use std::time::Duration;

/// 批与批之间的停顿，限制对上游账单接口的压力。
const BATCH_PAUSE: Duration = Duration::from_millis(200);

/// 一轮同步的汇总结果。单个 Key 的失败只计数，不向上抛。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub synced: usize,
    pub invalid: usize,
    pub failed: usize,
}

/// 单个 Key 的同步结果标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    Invalid,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Invalid => "invalid",
            Self::Failed => "failed",
        }
    }
}

/// 同步单个 Key。
///
/// - 账单查询成功：用远端剩余额度覆盖本地余额（状态随之重算）
/// - 账单 401：标记 Invalid，余额保持不动
/// - 其余失败：本地状态完全不动
pub async fn sync_one(store: &Store, upstream: &UpstreamClient, key: &KeyRecord) -> SyncOutcome {
    match upstream.check_usage(&key.secret).await {
        Ok(usage) => {
            store.sync_balance(key.id, usage.remaining).await;
            SyncOutcome::Synced
        }
        Err(UsageError::Unauthorized) => {
            store.set_status(key.id, KeyStatus::Invalid).await;
            SyncOutcome::Invalid
        }
        Err(UsageError::Failed(reason)) => {
            tracing::warn!(
                key = %logging::mask_secret(&key.secret),
                "同步余额失败: {reason}"
            );
            SyncOutcome::Failed
        }
    }
}

/// 对全部 Key 做一轮同步：按 `batch_size` 分批，批内并发，批间停顿。
///
/// 永不失败，总是返回按结果标签累加出的汇总。
pub async fn sync_all(store: &Store, upstream: &UpstreamClient, batch_size: usize) -> SyncReport {
    let keys = store.list_keys(None).await;
    let mut report = SyncReport {
        total: keys.len(),
        ..Default::default()
    };

    let batch_size = batch_size.max(1);
    let mut batches = keys.chunks(batch_size).peekable();
    while let Some(batch) = batches.next() {
        let outcomes =
            futures::future::join_all(batch.iter().map(|key| sync_one(store, upstream, key)))
                .await;
        for outcome in outcomes {
            match outcome {
                SyncOutcome::Synced => report.synced += 1,
                SyncOutcome::Invalid => report.invalid += 1,
                SyncOutcome::Failed => report.failed += 1,
            }
        }

        if batches.peek().is_some() {
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }

    report
}

/// 启动后台同步任务：先睡一个周期再同步，循环往复，任何一轮失败都不会终止任务。
pub fn spawn_sync_task(
    store: Arc<Store>,
    upstream: UpstreamClient,
    interval: Duration,
    batch_size: usize,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let report = sync_all(&store, &upstream, batch_size).await;
            tracing::info!(
                "余额同步完成：共 {}，成功 {}，无效 {}，失败 {}",
                report.total,
                report.synced,
                report.invalid,
                report.failed
            );
        }
    });
}
