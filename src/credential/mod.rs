//! 凭证层：Key / 计费规则 / 访问令牌的数据模型与持久化存储。

pub mod pricing;
pub mod store;
pub mod types;
