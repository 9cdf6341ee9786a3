//! 入站认证：Bearer 令牌对照统一管理密钥或访问令牌表。

use crate::error::AppError;
use crate::gateway::GatewayState;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

pub async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(token) = bearer_token(req.headers()) else {
        return Err(AppError::unauthorized(
            "Missing API key. Use Authorization: Bearer <your-key>",
        ));
    };

    if token == state.cfg.admin_key {
        return Ok(next.run(req).await);
    }

    let token = token.to_string();
    if state.store.verify_token(&token).await {
        return Ok(next.run(req).await);
    }

    Err(AppError::unauthorized("Invalid API key"))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(
            bearer_token(&headers_with("Bearer sk-abc")),
            Some("sk-abc")
        );
        assert_eq!(bearer_token(&headers_with("Bearer   ")), None);
        assert_eq!(bearer_token(&headers_with("Basic sk-abc")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
