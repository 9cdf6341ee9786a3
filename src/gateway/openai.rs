//! OpenAI 兼容接口：/v1/chat/completions 与 /v1/models。
//!
//! 转发失败时按错误类别处理：耗尽/无效换 Key 重试，
//! 业务类错误原样透传，超时与传输错误直接向调用方报错。

use crate::credential::types::{DeductOutcome, EXHAUST_THRESHOLD, KeyStatus};
use crate::error::AppError;
use crate::gateway::{GatewayState, stream};
use crate::logging;
use crate::pool::classifier::{self, ErrorKind};
use crate::pool::selector;
use crate::upstream::ApiError;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    /// 其余字段不做校验，原样转发给上游。
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let log = state.cfg.log_level();
    if log.client_enabled() {
        logging::client_request("POST", "/v1/chat/completions", &body);
    }

    let req: ChatRequest = sonic_rs::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("请求体 JSON 解析失败: {e}")))?;
    let is_stream = req.stream;
    let payload =
        sonic_rs::to_vec(&req).map_err(|e| AppError::bad_request(format!("请求序列化失败: {e}")))?;

    let price = state.store.resolve_price(&req.model).await;

    let mut retries = 0usize;
    loop {
        let Some(key) =
            selector::acquire(&state.store, price, selector::ACQUIRE_MAX_ATTEMPTS).await
        else {
            return Err(AppError::pool_unavailable(format!(
                "No available API keys with sufficient balance (need ${price:.2}). Please add more keys."
            )));
        };

        let err = if is_stream {
            match state
                .upstream
                .chat_completions_stream(&key.secret, &payload)
                .await
            {
                Ok(resp) => {
                    // 先扣费再透传：调用方中途断开也保留这笔扣费。
                    charge(&state, key.id, price).await;
                    return Ok(stream::relay(resp));
                }
                Err(e) => e,
            }
        } else {
            match state.upstream.chat_completions(&key.secret, &payload).await {
                Ok(bytes) => {
                    charge(&state, key.id, price).await;
                    if log.client_enabled() {
                        logging::client_response(200, start.elapsed(), &bytes);
                    }
                    return Ok((
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "application/json")],
                        bytes,
                    )
                        .into_response());
                }
                Err(e) => e,
            }
        };

        match err {
            // 超时不消耗重试次数，也不动 Key 状态：慢不代表坏。
            ApiError::Timeout => return Err(AppError::UpstreamTimeout),
            ApiError::Transport(e) => {
                return Err(AppError::backend(format!("上游请求失败: {e}")));
            }
            ApiError::Json(e) => {
                return Err(AppError::backend(format!("上游响应处理失败: {e}")));
            }
            ApiError::Http { status, body } => match classifier::classify(&body) {
                ErrorKind::Transient => {
                    if log.client_enabled() {
                        logging::client_response(status, start.elapsed(), body.as_bytes());
                    }
                    return Err(AppError::Upstream { status, body });
                }
                kind => {
                    let new_status = match kind {
                        ErrorKind::Exhausted => KeyStatus::Exhausted,
                        _ => KeyStatus::Invalid,
                    };
                    tracing::warn!(
                        key = %logging::mask_secret(&key.secret),
                        upstream_status = status,
                        "Key 判定为 {new_status:?}，换 Key 重试"
                    );
                    state.store.set_status(key.id, new_status).await;

                    retries += 1;
                    if retries >= state.cfg.max_retries {
                        return Err(AppError::MaxRetries);
                    }
                }
            },
        }
    }
}

/// 请求成功后的扣费。
///
/// 选取只是建议性的：并发请求可能在选取与扣费之间花掉余额。
/// 此时上游已经产生消费，只能记一条告警，不能把状态改成 Exhausted
/// （那会破坏"Exhausted 蕴含余额低于阈值"的约定）。
async fn charge(state: &GatewayState, key_id: u64, price: f64) {
    match state.store.deduct(key_id, price).await {
        DeductOutcome::Applied => {}
        DeductOutcome::Insufficient => {
            tracing::warn!(key_id, price, "扣费时余额已不足，本次费用未入账");
        }
        DeductOutcome::Missing => {
            tracing::warn!(key_id, "扣费时 Key 已被删除");
        }
    }
}

pub async fn handle_list_models(
    State(state): State<Arc<GatewayState>>,
) -> Result<Response, AppError> {
    let Some(key) = selector::acquire(&state.store, EXHAUST_THRESHOLD, 1).await else {
        return Ok(Json(empty_model_list()).into_response());
    };

    match state.upstream.list_models(&key.secret).await {
        Ok((200, bytes)) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response()),
        Ok((status, _)) => {
            tracing::warn!(upstream_status = status, "上游模型列表不可用，返回兜底列表");
            Ok(Json(fallback_model_list()).into_response())
        }
        Err(e) => {
            tracing::warn!("上游模型列表查询失败: {e}");
            Ok(Json(empty_model_list()).into_response())
        }
    }
}

fn empty_model_list() -> serde_json::Value {
    serde_json::json!({ "object": "list", "data": [] })
}

fn fallback_model_list() -> serde_json::Value {
    serde_json::json!({
        "object": "list",
        "data": [{
            "id": "gemini-3-pro-preview-y",
            "object": "model",
            "created": 1_700_000_000,
            "owned_by": "api-exchange",
        }]
    })
}
