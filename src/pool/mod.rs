//! Key 池：选取、错误分类与余额同步。

pub mod classifier;
pub mod reconciler;
pub mod selector;
