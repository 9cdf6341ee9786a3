//! 上游服务访问：chat completions（缓冲/流式）、模型列表与账单查询。

pub mod client;

pub use client::{ApiError, KeyUsage, UpstreamClient, UsageError};
