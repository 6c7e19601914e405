//! 共享库
//!
//! 通知扇出服务共用的配置、错误处理、数据库连接、Redis、可观测性与重试等基础设施代码。

pub mod config;
pub mod database;
pub mod error;
pub mod kv;
pub mod observability;
pub mod retry;
