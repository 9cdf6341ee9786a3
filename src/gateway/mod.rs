//! 入站网关：认证、OpenAI 兼容转发接口与管理接口。

pub mod admin;
pub mod auth;
pub mod openai;
pub mod stream;

use crate::config::Config;
use crate::credential::store::Store;
use crate::upstream::UpstreamClient;
use std::sync::Arc;

/// 所有路由共享的一份网关状态。
pub struct GatewayState {
    pub cfg: Config,
    pub store: Arc<Store>,
    pub upstream: UpstreamClient,
}
