use crate::config::Config;
use crate::logging::{self, LogLevel};
use axum::body::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("上游 API 错误 {status}")]
    Http { status: u16, body: String },

    #[error("上游请求超时")]
    Timeout,

    #[error(transparent)]
    Transport(reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ApiError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e)
        }
    }
}

/// 账单查询的独立错误域：401 是唯一能证明 Key 无效的信号，
/// 其余失败一律视为软失败，不改动本地状态。
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Key 无效（账单接口返回 401）")]
    Unauthorized,

    #[error("用量查询失败: {0}")]
    Failed(String),
}

/// 单个 Key 在上游账单视图里的用量快照。
#[derive(Debug, Clone, Copy)]
pub struct KeyUsage {
    pub remaining: f64,
    pub used: f64,
    pub total: f64,
}

/// 上游 HTTP 客户端。
///
/// 缓冲请求与账单查询走带超时的 `http`；流式请求走 `http_stream`，
/// 不设整体超时（流的自然结束就是边界），只限制建连时间。
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    http_stream: reqwest::Client,
    base_url: String,
    billing_base: String,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut http_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        let mut stream_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10));

        if cfg.timeout_ms > 0 {
            http_builder = http_builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }

        if !cfg.proxy.trim().is_empty() {
            // Proxy 不保证可 Clone，这里各自构建一次避免 trait 约束。
            http_builder = http_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
            stream_builder = stream_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: http_builder.build()?,
            http_stream: stream_builder.build()?,
            base_url: cfg.upstream_base_url.trim_end_matches('/').to_string(),
            billing_base: cfg.effective_billing_base(),
            log_level: cfg.log_level(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn build_headers(&self, secret: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {secret}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    /// 缓冲模式的 chat completions：等待完整响应，200 时返回原始响应体。
    pub async fn chat_completions(&self, secret: &str, payload: &[u8]) -> Result<Bytes, ApiError> {
        let url = self.chat_url();
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, secret, payload.len());
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(&url)
            .headers(self.build_headers(secret))
            .body(payload.to_vec())
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(ApiError::from_reqwest)?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), bytes.len());
        }

        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }

    /// 流式模式的 chat completions。
    ///
    /// 非 200 的失败发生在任何字节下发之前，响应体被完整读出供分类；
    /// 200 时把连接原样交给调用方做透传。
    pub async fn chat_completions_stream(
        &self,
        secret: &str,
        payload: &[u8],
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.chat_url();
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &url, secret, payload.len());
        }

        let start = std::time::Instant::now();
        let resp = self
            .http_stream
            .post(&url)
            .headers(self.build_headers(secret))
            .body(payload.to_vec())
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.map_err(ApiError::from_reqwest)?;
            if self.log_level.backend_enabled() {
                logging::backend_response(status.as_u16(), start.elapsed(), bytes.len());
            }
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), 0);
        }
        Ok(resp)
    }

    /// 拉取上游模型列表，返回 (状态码, 原始响应体)，由调用方决定兜底策略。
    pub async fn list_models(&self, secret: &str) -> Result<(u16, Bytes), ApiError> {
        let url = self.models_url();
        if self.log_level.backend_enabled() {
            logging::backend_request("GET", &url, secret, 0);
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .get(&url)
            .headers(self.build_headers(secret))
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(ApiError::from_reqwest)?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status, start.elapsed(), bytes.len());
        }
        Ok((status, bytes))
    }

    /// 查询单个 Key 的账单视图（总额度 + 已用额度）。
    ///
    /// 任一接口 401 即判定 Key 无效；其余失败（超时、5xx、解析失败）
    /// 都归为软失败，交由调用方计数而不是改状态。
    pub async fn check_usage(&self, secret: &str) -> Result<KeyUsage, UsageError> {
        let sub_url = format!("{}/dashboard/billing/subscription", self.billing_base);
        let usage_url = format!("{}/dashboard/billing/usage", self.billing_base);
        let headers = self.build_headers(secret);

        let sub_resp = self
            .http
            .get(&sub_url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| UsageError::Failed(e.to_string()))?;
        let sub_status = sub_resp.status().as_u16();
        let sub_bytes = sub_resp
            .bytes()
            .await
            .map_err(|e| UsageError::Failed(e.to_string()))?;

        let usage_resp = self
            .http
            .get(&usage_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| UsageError::Failed(e.to_string()))?;
        let usage_status = usage_resp.status().as_u16();
        let usage_bytes = usage_resp
            .bytes()
            .await
            .map_err(|e| UsageError::Failed(e.to_string()))?;

        if sub_status == 401 || usage_status == 401 {
            return Err(UsageError::Unauthorized);
        }
        if sub_status != 200 || usage_status != 200 {
            return Err(UsageError::Failed(format!(
                "账单接口异常: subscription={sub_status}, usage={usage_status}"
            )));
        }

        let sub: SubscriptionResp = sonic_rs::from_slice(&sub_bytes)
            .map_err(|e| UsageError::Failed(format!("subscription 解析失败: {e}")))?;
        let usage: UsageResp = sonic_rs::from_slice(&usage_bytes)
            .map_err(|e| UsageError::Failed(format!("usage 解析失败: {e}")))?;

        Ok(compute_usage(&sub, &usage))
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct SubscriptionResp {
    #[serde(default)]
    hard_limit_usd: Option<f64>,
    #[serde(default)]
    soft_limit_usd: Option<f64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct UsageResp {
    #[serde(default)]
    total_usage: Option<f64>,
}

fn compute_usage(sub: &SubscriptionResp, usage: &UsageResp) -> KeyUsage {
    let total = sub.hard_limit_usd.or(sub.soft_limit_usd).unwrap_or(0.0);
    // total_usage 的单位是 0.01 美元。
    let used = usage.total_usage.unwrap_or(0.0) / 100.0;
    KeyUsage {
        remaining: total - used,
        used,
        total,
    }
}
