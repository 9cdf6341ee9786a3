use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 池中没有满足价格门槛的 Key。
    #[error("{0}")]
    PoolUnavailable(String),

    /// 故障转移次数用尽仍未拿到成功响应。
    #[error("Max retries exceeded")]
    MaxRetries,

    /// 缓冲模式下上游超时。不计入重试，也不动 Key 状态。
    #[error("Request to upstream API timed out")]
    UpstreamTimeout,

    /// 传输层失败（连接被拒、DNS 等），合成错误信封返回。
    #[error("后端请求失败: {0}")]
    Backend(String),

    /// Transient 类上游错误：状态码和响应体原样透传给调用方。
    #[error("上游 API 错误 {status}")]
    Upstream { status: u16, body: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn pool_unavailable(message: impl Into<String>) -> Self {
        Self::PoolUnavailable(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // 透传类错误不走信封：保持上游的状态码与响应体。
        if let AppError::Upstream { status, body } = self {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            return (
                status,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response();
        }

        let (status, ty) = match &self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::PoolUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "pool_unavailable"),
            AppError::MaxRetries => (StatusCode::SERVICE_UNAVAILABLE, "max_retries"),
            AppError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::Backend(_) => (StatusCode::BAD_GATEWAY, "backend"),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io"),
            AppError::Upstream { .. } => unreachable!(),
            AppError::Anyhow(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            error_envelope(&self.to_string(), ty),
        )
            .into_response()
    }
}

/// OpenAI 风格的错误信封：{"error":{"message":...,"type":...}}
pub fn error_envelope(message: &str, ty: &str) -> String {
    let message = sonic_rs::to_string(message).unwrap_or_else(|_| "\"\"".to_string());
    let ty = sonic_rs::to_string(ty).unwrap_or_else(|_| "\"\"".to_string());
    format!("{{\"error\":{{\"message\":{message},\"type\":{ty}}}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_escapes_message() {
        let body = error_envelope("bad \"quote\"", "server_error");
        assert_eq!(
            body,
            r#"{"error":{"message":"bad \"quote\"","type":"server_error"}}"#
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::pool_unavailable("x").into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::MaxRetries.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::UpstreamTimeout.into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::Upstream {
                status: 418,
                body: "{}".to_string()
            }
            .into_response()
            .status(),
            StatusCode::IM_A_TEAPOT
        );
    }
}
