use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 余额低于该阈值的 Key 视为耗尽，不再参与选取。
pub const EXHAUST_THRESHOLD: f64 = 0.01;

/// 新导入 Key 的默认初始余额。
pub const DEFAULT_KEY_BALANCE: f64 = 0.24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Exhausted,
    Invalid,
}

impl KeyStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "exhausted" => Some(Self::Exhausted),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// 池中的一条上游凭证记录。
///
/// `balance` 是本地估算值：每次请求乐观扣减，由后台同步定期校准。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: u64,
    pub secret: String,
    pub balance: f64,
    pub initial_balance: f64,
    pub used_amount: f64,
    pub request_count: u64,
    pub status: KeyStatus,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 模型计费规则：按 id 升序逐条做通配符匹配，首个命中生效。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: u64,
    pub pattern: String,
    pub price_per_request: f64,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// 对外访问令牌（网关入站认证用，与上游凭证无关）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: u64,
    pub name: String,
    pub token: String,
    pub enabled: bool,
    pub request_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub exhausted_keys: usize,
    pub invalid_keys: usize,
    pub total_balance: f64,
    pub total_used: f64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportReport {
    pub total: usize,
    pub added: usize,
    pub duplicates: usize,
}

/// 条件扣费的结果：余额不足时拒绝扣减，而不是把余额打成负数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Applied,
    Insufficient,
    Missing,
}
