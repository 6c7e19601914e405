//! 通知工作者服务
//!
//! 监听业务库的通知写入，把每条通知映射为具体类型后推送到用户设备；
//! 另外轮询私信与群发生成推送，并按用户频率发送摘要邮件。
//! 单条通知的失败只影响它自己，可恢复的失败进入 Redis 重试队列。

pub mod badge;
pub mod cursor;
pub mod dm;
pub mod email;
pub mod error;
pub mod event;
pub mod hash_id;
pub mod listener;
pub mod mapping;
pub mod orchestrator;
pub mod processor;
pub mod remote_config;
pub mod retry_queue;
pub mod sender;
pub mod settings;
pub mod templates;
