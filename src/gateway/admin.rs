//! 管理接口：Key 池、计费规则与访问令牌的增删改查，以及手动余额同步。

use crate::credential::types::{DEFAULT_KEY_BALANCE, KeyStatus};
use crate::error::AppError;
use crate::gateway::GatewayState;
use crate::pool::reconciler;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// 手动触发全量同步时的批大小（比后台任务激进）。
const MANUAL_SYNC_BATCH: usize = 50;

pub async fn handle_stats(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let stats = state.store.stats().await;
    Json(json!({ "success": true, "stats": stats }))
}

// ---- Key 池 ----

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    status: Option<String>,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

pub async fn handle_list_keys(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ListKeysQuery>,
) -> Result<Json<Value>, AppError> {
    let status = match query.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(
            KeyStatus::parse(raw)
                .ok_or_else(|| AppError::bad_request(format!("未知的 Key 状态: {raw}")))?,
        ),
    };

    let keys = state.store.list_keys(status).await;
    let total = keys.len();
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);
    let page_keys: Vec<_> = keys
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    Ok(Json(json!({
        "success": true,
        "total": total,
        "page": page,
        "page_size": page_size,
        "keys": page_keys,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AddKeyRequest {
    key: String,
    #[serde(default = "default_balance")]
    balance: f64,
}

fn default_balance() -> f64 {
    DEFAULT_KEY_BALANCE
}

pub async fn handle_add_key(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<AddKeyRequest>,
) -> Result<Json<Value>, AppError> {
    if req.key.trim().is_empty() {
        return Err(AppError::bad_request("key 不能为空"));
    }

    match state.store.add_key(req.key.trim(), req.balance).await {
        Some(record) => Ok(Json(json!({ "success": true, "key": record }))),
        None => Err(AppError::bad_request("该 Key 已存在")),
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportKeysRequest {
    keys: Vec<AddKeyRequest>,
}

pub async fn handle_import_keys(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<ImportKeysRequest>,
) -> Result<Json<Value>, AppError> {
    let items: Vec<(String, f64)> = req
        .keys
        .into_iter()
        .filter(|k| !k.key.trim().is_empty())
        .map(|k| (k.key.trim().to_string(), k.balance))
        .collect();
    if items.is_empty() {
        return Err(AppError::bad_request("没有可导入的 Key"));
    }

    let report = state.store.import_keys(&items).await;
    Ok(Json(json!({ "success": true, "report": report })))
}

pub async fn handle_delete_key(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_key(id).await {
        return Err(AppError::not_found(format!("Key {id} 不存在")));
    }
    Ok(Json(json!({ "success": true })))
}

/// 手动复活一把 Key。这是 Invalid 状态唯一的出口。
pub async fn handle_activate_key(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    if !state.store.activate_key(id).await {
        return Err(AppError::not_found(format!("Key {id} 不存在")));
    }
    let key = state.store.get_key(id).await;
    Ok(Json(json!({ "success": true, "key": key })))
}

pub async fn handle_sync_key(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    let Some(record) = state.store.get_key(id).await else {
        return Err(AppError::not_found(format!("Key {id} 不存在")));
    };

    let outcome = reconciler::sync_one(&state.store, &state.upstream, &record).await;
    let key = state.store.get_key(id).await;
    Ok(Json(json!({
        "success": true,
        "result": outcome.as_str(),
        "key": key,
    })))
}

pub async fn handle_sync_all(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let report = reconciler::sync_all(&state.store, &state.upstream, MANUAL_SYNC_BATCH).await;
    Json(json!({ "success": true, "report": report }))
}

// ---- 计费规则 ----

pub async fn handle_list_pricing(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let rules = state.store.list_pricing().await;
    Json(json!({ "success": true, "pricing": rules }))
}

#[derive(Debug, Deserialize)]
pub struct AddPricingRequest {
    pattern: String,
    price_per_request: f64,
    #[serde(default)]
    description: String,
}

pub async fn handle_add_pricing(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<AddPricingRequest>,
) -> Result<Json<Value>, AppError> {
    if req.price_per_request < 0.0 {
        return Err(AppError::bad_request("价格不能为负数"));
    }
    match state
        .store
        .add_pricing(&req.pattern, req.price_per_request, &req.description)
        .await
    {
        Some(rule) => Ok(Json(json!({ "success": true, "rule": rule }))),
        None => Err(AppError::bad_request("pattern 为空或已存在")),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdatePricingRequest {
    price_per_request: f64,
    #[serde(default)]
    description: String,
}

pub async fn handle_update_pricing(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
    Json(req): Json<UpdatePricingRequest>,
) -> Result<Json<Value>, AppError> {
    if req.price_per_request < 0.0 {
        return Err(AppError::bad_request("价格不能为负数"));
    }
    if !state
        .store
        .update_pricing(id, req.price_per_request, &req.description)
        .await
    {
        return Err(AppError::not_found(format!("计费规则 {id} 不存在")));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn handle_delete_pricing(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_pricing(id).await {
        return Err(AppError::not_found(format!("计费规则 {id} 不存在")));
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct PriceCheckQuery {
    model: String,
}

pub async fn handle_check_price(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<PriceCheckQuery>,
) -> Json<Value> {
    let price = state.store.resolve_price(&query.model).await;
    Json(json!({ "model": query.model, "price": price }))
}

// ---- 访问令牌 ----

pub async fn handle_list_tokens(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let tokens = state.store.list_tokens().await;
    Json(json!({ "success": true, "tokens": tokens }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    name: String,
}

pub async fn handle_create_token(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreateTokenRequest>,
) -> Result<Json<Value>, AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("令牌名称不能为空"));
    }
    let token = state.store.create_token(req.name.trim()).await;
    Ok(Json(json!({ "success": true, "token": token })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleTokenRequest {
    enabled: bool,
}

pub async fn handle_toggle_token(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
    Json(req): Json<ToggleTokenRequest>,
) -> Result<Json<Value>, AppError> {
    if !state.store.toggle_token(id, req.enabled).await {
        return Err(AppError::not_found(format!("令牌 {id} 不存在")));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn handle_delete_token(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_token(id).await {
        return Err(AppError::not_found(format!("令牌 {id} 不存在")));
    }
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credential::store::Store;
    use crate::upstream::UpstreamClient;

    async fn new_state() -> (Arc<GatewayState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::for_tests("http://127.0.0.1:1/v1");
        let store = Arc::new(Store::new(dir.path().to_str().unwrap()));
        store.load().await.expect("load");
        let upstream = UpstreamClient::new(&cfg).unwrap();
        (
            Arc::new(GatewayState {
                cfg,
                store,
                upstream,
            }),
            dir,
        )
    }

    #[tokio::test]
    async fn add_key_rejects_duplicates_and_blank() {
        let (state, _dir) = new_state().await;

        let ok = handle_add_key(
            State(state.clone()),
            Json(AddKeyRequest {
                key: "sk-a".to_string(),
                balance: 0.24,
            }),
        )
        .await;
        assert!(ok.is_ok());

        let dup = handle_add_key(
            State(state.clone()),
            Json(AddKeyRequest {
                key: "sk-a".to_string(),
                balance: 0.24,
            }),
        )
        .await;
        assert!(matches!(dup, Err(AppError::BadRequest(_))));

        let blank = handle_add_key(
            State(state.clone()),
            Json(AddKeyRequest {
                key: "   ".to_string(),
                balance: 0.24,
            }),
        )
        .await;
        assert!(matches!(blank, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn list_keys_paginates_and_validates_status() {
        let (state, _dir) = new_state().await;
        for i in 0..5 {
            state
                .store
                .add_key(&format!("sk-{i}"), 0.24)
                .await
                .unwrap();
        }

        let Json(page) = handle_list_keys(
            State(state.clone()),
            Query(ListKeysQuery {
                status: None,
                page: 2,
                page_size: 2,
            }),
        )
        .await
        .unwrap();
        assert_eq!(page["total"], 5);
        assert_eq!(page["keys"].as_array().unwrap().len(), 2);

        let bad = handle_list_keys(
            State(state.clone()),
            Query(ListKeysQuery {
                status: Some("frozen".to_string()),
                page: 1,
                page_size: 20,
            }),
        )
        .await;
        assert!(matches!(bad, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn price_check_uses_rule_table() {
        let (state, _dir) = new_state().await;
        let Json(v) = handle_check_price(
            State(state.clone()),
            Query(PriceCheckQuery {
                model: "gemini-3-pro-preview-y".to_string(),
            }),
        )
        .await;
        assert_eq!(v["price"], 0.08);
    }
}
