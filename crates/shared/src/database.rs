//! PostgreSQL 连接池
//!
//! 工作进程同时连接业务库（通知、私信、群发）与身份库（设备、设置、角标、邮件记录），
//! 两者共用同一套建池逻辑，日志中以库名区分。

use crate::config::DatabaseConfig;
use crate::error::{FanoutError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// 具名连接池
#[derive(Clone)]
pub struct Database {
    name: String,
    pool: PgPool,
}

impl Database {
    /// 建池并立即做一次连通性检查
    #[instrument(skip(config), fields(database = name))]
    pub async fn connect(name: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        let db = Self {
            name: name.to_string(),
            pool,
        };
        db.health_check().await?;
        info!(
            max_connections = config.max_connections,
            "数据库连接池已建立"
        );
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行 `SELECT 1`，慢于一秒时告警
    pub async fn health_check(&self) -> Result<()> {
        let started = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(FanoutError::from)?;
        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(1) {
            warn!(database = %self.name, elapsed_ms = elapsed.as_millis() as u64, "数据库响应缓慢");
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!(database = %self.name, "数据库连接池已关闭");
    }
}
