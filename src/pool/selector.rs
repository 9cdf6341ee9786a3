//! Key 选取：对存储做有限次轮询，容忍"马上就有 Key 被释放"的短暂竞态。

use crate::credential::store::Store;
use crate::credential::types::KeyRecord;
use std::time::Duration;

/// 默认轮询次数（含首次查询）。
pub const ACQUIRE_MAX_ATTEMPTS: u32 = 3;

/// 两次轮询之间的固定间隔。
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// 取一个余额不低于 `min_balance` 的可用 Key。
///
/// 查不到时按固定间隔重试至多 `max_attempts` 次；期间同步任务或
/// 故障转移可能刚好释放出可用 Key。全部落空返回 None。
pub async fn acquire(store: &Store, min_balance: f64, max_attempts: u32) -> Option<KeyRecord> {
    let attempts = max_attempts.max(1);
    for attempt in 0..attempts {
        if let Some(key) = store.acquire_available(min_balance).await {
            return Some(key);
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    None
}
