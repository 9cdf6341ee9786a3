use crate::credential::pricing;
use crate::credential::types::{
    AccessToken, DeductOutcome, EXHAUST_THRESHOLD, ImportReport, KeyRecord, KeyStatus, PoolStats,
    PricingRule,
};
use anyhow::{Context, anyhow};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Key / 计费规则 / 访问令牌的唯一持久化入口。
///
/// 所有余额变更（扣费、同步）都在同一把写锁内做条件更新，
/// 选取（acquire）只是建议性的读查询，正确性由扣费时的再校验保证。
#[derive(Debug)]
pub struct Store {
    file_path: PathBuf,
    state: RwLock<State>,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
struct State {
    keys: Vec<KeyRecord>,
    pricing: Vec<PricingRule>,
    tokens: Vec<AccessToken>,
    next_key_id: u64,
    next_rule_id: u64,
    next_token_id: u64,
}

impl State {
    fn alloc_key_id(&mut self) -> u64 {
        self.next_key_id += 1;
        self.next_key_id
    }

    fn alloc_rule_id(&mut self) -> u64 {
        self.next_rule_id += 1;
        self.next_rule_id
    }

    fn alloc_token_id(&mut self) -> u64 {
        self.next_token_id += 1;
        self.next_token_id
    }
}

impl Store {
    pub fn new(data_dir: &str) -> Self {
        Self {
            file_path: PathBuf::from(data_dir).join("keys.json"),
            state: RwLock::new(State::default()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;

        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // 首次启动：写入默认计费规则（含 `*` 兜底）。
                let snapshot = {
                    let mut state = self.state.write().await;
                    seed_default_pricing(&mut state);
                    state.clone()
                };
                return self.save_snapshot(&snapshot).await;
            }
            Err(e) => return Err(e).context("读取 keys.json 失败"),
        };

        let mut loaded: State = match sonic_rs::from_slice(&data) {
            Ok(v) => v,
            Err(e) => return Err(anyhow!(e)).context("解析 keys.json 失败"),
        };

        if loaded.pricing.is_empty() {
            seed_default_pricing(&mut loaded);
        }

        let mut state = self.state.write().await;
        *state = loaded;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key 管理
    // ------------------------------------------------------------------

    /// 添加单个 Key。secret 重复时返回 None。
    pub async fn add_key(&self, secret: &str, balance: f64) -> Option<KeyRecord> {
        let secret = secret.trim();
        if secret.is_empty() {
            return None;
        }

        let (record, snapshot) = {
            let mut state = self.state.write().await;
            if state.keys.iter().any(|k| k.secret == secret) {
                return None;
            }
            let record = KeyRecord {
                id: state.alloc_key_id(),
                secret: secret.to_string(),
                balance,
                initial_balance: balance,
                used_amount: 0.0,
                request_count: 0,
                status: KeyStatus::Active,
                last_used_at: None,
                last_synced_at: None,
                created_at: Utc::now(),
            };
            state.keys.push(record.clone());
            (record, state.clone())
        };

        self.persist(&snapshot).await;
        Some(record)
    }

    /// 批量导入，逐条去重统计。
    pub async fn import_keys(&self, items: &[(String, f64)]) -> ImportReport {
        let mut report = ImportReport {
            total: items.len(),
            ..Default::default()
        };

        let snapshot = {
            let mut state = self.state.write().await;
            for (secret, balance) in items {
                let secret = secret.trim();
                if secret.is_empty() || state.keys.iter().any(|k| k.secret == secret) {
                    report.duplicates += 1;
                    continue;
                }
                let record = KeyRecord {
                    id: state.alloc_key_id(),
                    secret: secret.to_string(),
                    balance: *balance,
                    initial_balance: *balance,
                    used_amount: 0.0,
                    request_count: 0,
                    status: KeyStatus::Active,
                    last_used_at: None,
                    last_synced_at: None,
                    created_at: Utc::now(),
                };
                state.keys.push(record);
                report.added += 1;
            }
            state.clone()
        };

        self.persist(&snapshot).await;
        report
    }

    pub async fn get_key(&self, id: u64) -> Option<KeyRecord> {
        let state = self.state.read().await;
        state.keys.iter().find(|k| k.id == id).cloned()
    }

    /// 列出 Key（可按状态过滤），按创建时间倒序。
    pub async fn list_keys(&self, status: Option<KeyStatus>) -> Vec<KeyRecord> {
        let state = self.state.read().await;
        let mut out: Vec<KeyRecord> = state
            .keys
            .iter()
            .filter(|k| status.is_none_or(|s| k.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// 选出一个可用 Key：Active 且余额达标，最久未用优先（从未使用的排最前），
    /// 再按 id 升序打破平局。这是建议性查询，不预留余额。
    pub async fn acquire_available(&self, min_balance: f64) -> Option<KeyRecord> {
        let state = self.state.read().await;
        state
            .keys
            .iter()
            .filter(|k| k.status == KeyStatus::Active && k.balance >= min_balance)
            .min_by_key(|k| (k.last_used_at.is_some(), k.last_used_at, k.id))
            .cloned()
    }

    /// 条件扣费：仅当当前余额仍足以覆盖 amount 时生效。
    ///
    /// 生效时在同一临界区内完成余额扣减、累计用量、请求计数、lastUsedAt
    /// 以及低于阈值时的 Exhausted 转换；Key 已被并发删除时为 no-op。
    pub async fn deduct(&self, id: u64, amount: f64) -> DeductOutcome {
        let (outcome, snapshot) = {
            let mut state = self.state.write().await;
            let Some(key) = state.keys.iter_mut().find(|k| k.id == id) else {
                return DeductOutcome::Missing;
            };
            if key.balance < amount {
                return DeductOutcome::Insufficient;
            }

            key.balance -= amount;
            key.used_amount += amount;
            key.request_count += 1;
            key.last_used_at = Some(Utc::now());
            // Invalid 具有粘性：选取与扣费之间被同步判为 Invalid 的 Key
            // 不能被改写成 Exhausted（否则下次同步会把它拉回 Active）。
            if key.balance < EXHAUST_THRESHOLD && key.status != KeyStatus::Invalid {
                key.status = KeyStatus::Exhausted;
            }
            (DeductOutcome::Applied, state.clone())
        };

        self.persist(&snapshot).await;
        outcome
    }

    pub async fn set_status(&self, id: u64, status: KeyStatus) {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(key) = state.keys.iter_mut().find(|k| k.id == id) else {
                return;
            };
            key.status = status;
            state.clone()
        };
        self.persist(&snapshot).await;
    }

    /// 管理员显式重新激活：唯一能把 Invalid 拉回 Active 的路径。
    pub async fn activate_key(&self, id: u64) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(key) = state.keys.iter_mut().find(|k| k.id == id) else {
                return false;
            };
            key.status = KeyStatus::Active;
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    /// 用远端账单视图覆盖本地余额并打上同步时间戳。
    ///
    /// 状态按余额重算为 Active/Exhausted；Invalid 具有粘性，这里不会解除
    /// （账单 401 之外的任何结果都不能证明 Key 重新可用）。
    pub async fn sync_balance(&self, id: u64, balance: f64) {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(key) = state.keys.iter_mut().find(|k| k.id == id) else {
                return;
            };
            key.balance = balance;
            key.last_synced_at = Some(Utc::now());
            if key.status != KeyStatus::Invalid {
                key.status = if balance < EXHAUST_THRESHOLD {
                    KeyStatus::Exhausted
                } else {
                    KeyStatus::Active
                };
            }
            state.clone()
        };
        self.persist(&snapshot).await;
    }

    pub async fn delete_key(&self, id: u64) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.keys.len();
            state.keys.retain(|k| k.id != id);
            if state.keys.len() == before {
                return false;
            }
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.read().await;
        let mut stats = PoolStats {
            total_keys: state.keys.len(),
            ..Default::default()
        };
        for k in &state.keys {
            match k.status {
                KeyStatus::Active => stats.active_keys += 1,
                KeyStatus::Exhausted => stats.exhausted_keys += 1,
                KeyStatus::Invalid => stats.invalid_keys += 1,
            }
            stats.total_balance += k.balance;
            stats.total_used += k.used_amount;
            stats.total_requests += k.request_count;
        }
        stats
    }

    // ------------------------------------------------------------------
    // 计费规则
    // ------------------------------------------------------------------

    pub async fn resolve_price(&self, model: &str) -> f64 {
        let state = self.state.read().await;
        pricing::resolve_price(&state.pricing, model)
    }

    pub async fn list_pricing(&self) -> Vec<PricingRule> {
        let state = self.state.read().await;
        state.pricing.clone()
    }

    /// 新增计费规则。pattern 重复时返回 None。
    pub async fn add_pricing(
        &self,
        pattern: &str,
        price: f64,
        description: &str,
    ) -> Option<PricingRule> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }

        let (rule, snapshot) = {
            let mut state = self.state.write().await;
            if state.pricing.iter().any(|r| r.pattern == pattern) {
                return None;
            }
            let rule = PricingRule {
                id: state.alloc_rule_id(),
                pattern: pattern.to_string(),
                price_per_request: price,
                description: description.to_string(),
                created_at: Utc::now(),
            };
            state.pricing.push(rule.clone());
            (rule, state.clone())
        };

        self.persist(&snapshot).await;
        Some(rule)
    }

    pub async fn update_pricing(&self, id: u64, price: f64, description: &str) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(rule) = state.pricing.iter_mut().find(|r| r.id == id) else {
                return false;
            };
            rule.price_per_request = price;
            rule.description = description.to_string();
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    pub async fn delete_pricing(&self, id: u64) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.pricing.len();
            state.pricing.retain(|r| r.id != id);
            if state.pricing.len() == before {
                return false;
            }
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    // ------------------------------------------------------------------
    // 访问令牌
    // ------------------------------------------------------------------

    pub async fn create_token(&self, name: &str) -> AccessToken {
        let (token, snapshot) = {
            let mut state = self.state.write().await;
            let token = AccessToken {
                id: state.alloc_token_id(),
                name: name.trim().to_string(),
                token: format!("sk-ex-{}", uuid::Uuid::new_v4().simple()),
                enabled: true,
                request_count: 0,
                created_at: Utc::now(),
                last_used_at: None,
            };
            state.tokens.push(token.clone());
            (token, state.clone())
        };

        self.persist(&snapshot).await;
        token
    }

    pub async fn list_tokens(&self) -> Vec<AccessToken> {
        let state = self.state.read().await;
        state.tokens.clone()
    }

    /// 校验访问令牌；命中时累加使用计数并更新 lastUsedAt。
    pub async fn verify_token(&self, token: &str) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(t) = state
                .tokens
                .iter_mut()
                .find(|t| t.enabled && t.token == token)
            else {
                return false;
            };
            t.request_count += 1;
            t.last_used_at = Some(Utc::now());
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    pub async fn toggle_token(&self, id: u64, enabled: bool) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(t) = state.tokens.iter_mut().find(|t| t.id == id) else {
                return false;
            };
            t.enabled = enabled;
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    pub async fn delete_token(&self, id: u64) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.tokens.len();
            state.tokens.retain(|t| t.id != id);
            if state.tokens.len() == before {
                return false;
            }
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    // ------------------------------------------------------------------
    // 持久化
    // ------------------------------------------------------------------

    /// 尽力而为的持久化：请求路径上的扣费不能因为磁盘问题失败。
    async fn persist(&self, snapshot: &State) {
        if let Err(e) = self.save_snapshot(snapshot).await {
            tracing::warn!("写入 keys.json 失败: {e:#}");
        }
    }

    async fn save_snapshot(&self, snapshot: &State) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;
        let data = sonic_rs::to_vec_pretty(snapshot).context("序列化 keys.json 失败")?;
        tokio::fs::write(&self.file_path, data)
            .await
            .context("写入 keys.json 失败")
    }
}

fn seed_default_pricing(state: &mut State) {
    let now = Utc::now();
    for (pattern, price, description) in pricing::default_rules() {
        let id = state.alloc_rule_id();
        state.pricing.push(PricingRule {
            id,
            pattern: pattern.to_string(),
            price_per_request: price,
            description: description.to_string(),
            created_at: now,
        });
    }
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn new_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path().to_str().unwrap());
        store.load().await.expect("load");
        (store, dir)
    }

    #[tokio::test]
    async fn first_load_seeds_default_pricing_with_catch_all() {
        let (store, _dir) = new_store().await;
        let rules = store.list_pricing().await;
        assert!(!rules.is_empty());
        assert_eq!(rules.last().unwrap().pattern, "*");
        // 兜底价格生效
        assert_eq!(store.resolve_price("totally-unknown").await, 0.08);
        assert_eq!(store.resolve_price("gemini-3-flash-exp").await, 0.05);
    }

    #[tokio::test]
    async fn add_key_rejects_duplicate_secret() {
        let (store, _dir) = new_store().await;
        assert!(store.add_key("sk-a", 0.24).await.is_some());
        assert!(store.add_key("sk-a", 0.24).await.is_none());

        let report = store
            .import_keys(&[("sk-a".to_string(), 0.24), ("sk-b".to_string(), 0.5)])
            .await;
        assert_eq!(report.total, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn acquire_prefers_never_used_then_least_recently_used() {
        let (store, _dir) = new_store().await;
        let a = store.add_key("sk-a", 1.0).await.unwrap();
        let b = store.add_key("sk-b", 1.0).await.unwrap();
        let c = store.add_key("sk-c", 1.0).await.unwrap();

        // a 用过，b/c 从未使用：先取 id 更小的 b。
        assert_eq!(store.deduct(a.id, 0.1).await, DeductOutcome::Applied);
        let picked = store.acquire_available(0.08).await.unwrap();
        assert_eq!(picked.id, b.id);

        // b 也用过之后轮到 c，最后才回到最久未用的 a。
        store.deduct(b.id, 0.1).await;
        assert_eq!(store.acquire_available(0.08).await.unwrap().id, c.id);
        store.deduct(c.id, 0.1).await;
        assert_eq!(store.acquire_available(0.08).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn acquire_honors_balance_floor_and_status() {
        let (store, _dir) = new_store().await;
        let a = store.add_key("sk-a", 0.05).await.unwrap();
        assert!(store.acquire_available(0.08).await.is_none());
        assert!(store.acquire_available(0.05).await.is_some());

        store.set_status(a.id, KeyStatus::Invalid).await;
        // Invalid 即使 minBalance 为 0 也永远不会被选中。
        assert!(store.acquire_available(0.0).await.is_none());
    }

    #[tokio::test]
    async fn deduct_updates_counters_and_marks_exhausted_below_threshold() {
        let (store, _dir) = new_store().await;
        let key = store.add_key("sk-a", 0.1).await.unwrap();

        assert_eq!(store.deduct(key.id, 0.095).await, DeductOutcome::Applied);
        let key = store.get_key(key.id).await.unwrap();
        assert!(key.balance < EXHAUST_THRESHOLD);
        assert_eq!(key.status, KeyStatus::Exhausted);
        assert_eq!(key.request_count, 1);
        assert!(key.last_used_at.is_some());
        assert!((key.used_amount - 0.095).abs() < 1e-9);
    }

    #[tokio::test]
    async fn deduct_rejects_insufficient_balance_and_missing_key() {
        let (store, _dir) = new_store().await;
        let key = store.add_key("sk-a", 0.05).await.unwrap();

        assert_eq!(
            store.deduct(key.id, 0.08).await,
            DeductOutcome::Insufficient
        );
        let after = store.get_key(key.id).await.unwrap();
        assert_eq!(after.balance, 0.05);
        assert_eq!(after.request_count, 0);

        assert_eq!(store.deduct(9999, 0.08).await, DeductOutcome::Missing);
    }

    #[tokio::test]
    async fn deduct_does_not_rewrite_invalid_status() {
        let (store, _dir) = new_store().await;
        let key = store.add_key("sk-a", 0.1).await.unwrap();
        // 模拟选取后、扣费前 Key 被余额同步判为 Invalid。
        store.set_status(key.id, KeyStatus::Invalid).await;

        // 扣费照常入账，但状态保持 Invalid，不被降格成 Exhausted。
        assert_eq!(store.deduct(key.id, 0.095).await, DeductOutcome::Applied);
        let after = store.get_key(key.id).await.unwrap();
        assert_eq!(after.status, KeyStatus::Invalid);
        assert!(after.balance < EXHAUST_THRESHOLD);
        assert!(store.acquire_available(0.0).await.is_none());

        // 余额同步也解除不了：唯一出口仍是显式激活。
        store.sync_balance(key.id, 0.50).await;
        assert_eq!(
            store.get_key(key.id).await.unwrap().status,
            KeyStatus::Invalid
        );
    }

    #[tokio::test]
    async fn concurrent_deductions_never_overdraw() {
        let (store, _dir) = new_store().await;
        // 0.25 = 4 × 0.0625，二进制可精确表示，避免浮点尾差干扰断言。
        let key = store.add_key("sk-a", 0.25).await.unwrap();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let id = key.id;
            handles.push(tokio::spawn(
                async move { store.deduct(id, 0.0625).await },
            ));
        }

        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() == DeductOutcome::Applied {
                applied += 1;
            }
        }

        assert_eq!(applied, 4);
        let after = store.get_key(key.id).await.unwrap();
        assert!(after.balance >= 0.0);
        assert_eq!(after.balance, 0.0);
        assert_eq!(after.status, KeyStatus::Exhausted);
    }

    #[tokio::test]
    async fn sync_balance_recomputes_status_but_invalid_is_sticky() {
        let (store, _dir) = new_store().await;
        let key = store.add_key("sk-a", 0.0).await.unwrap();
        store.set_status(key.id, KeyStatus::Exhausted).await;

        // 远端报告仍有余额：Exhausted -> Active，并盖上同步时间戳。
        store.sync_balance(key.id, 0.30).await;
        let after = store.get_key(key.id).await.unwrap();
        assert_eq!(after.status, KeyStatus::Active);
        assert_eq!(after.balance, 0.30);
        assert!(after.last_synced_at.is_some());

        // Invalid 不会被余额同步解除。
        store.set_status(key.id, KeyStatus::Invalid).await;
        store.sync_balance(key.id, 0.50).await;
        let after = store.get_key(key.id).await.unwrap();
        assert_eq!(after.status, KeyStatus::Invalid);
        assert_eq!(after.balance, 0.50);

        // 只有管理员显式激活才能恢复。
        assert!(store.activate_key(key.id).await);
        let after = store.get_key(key.id).await.unwrap();
        assert_eq!(after.status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_str().unwrap().to_string();

        let store = Store::new(&path);
        store.load().await.unwrap();
        let key = store.add_key("sk-a", 0.24).await.unwrap();
        store.deduct(key.id, 0.08).await;

        let reopened = Store::new(&path);
        reopened.load().await.unwrap();
        let loaded = reopened.get_key(key.id).await.unwrap();
        assert_eq!(loaded.secret, "sk-a");
        assert!((loaded.balance - 0.16).abs() < 1e-9);
        assert_eq!(loaded.request_count, 1);
    }

    #[tokio::test]
    async fn access_token_verify_counts_usage() {
        let (store, _dir) = new_store().await;
        let token = store.create_token("测试").await;
        assert!(store.verify_token(&token.token).await);
        assert!(!store.verify_token("sk-ex-nope").await);

        assert!(store.toggle_token(token.id, false).await);
        assert!(!store.verify_token(&token.token).await);

        let listed = &store.list_tokens().await[0];
        assert_eq!(listed.request_count, 1);
        assert!(listed.last_used_at.is_some());
    }
}
