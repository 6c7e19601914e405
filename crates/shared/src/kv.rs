//! Redis 键值存储模块
//!
//! 提供 Redis 连接管理，以及游标（字符串）和重试队列（列表）所需的原子操作封装。

use crate::config::RedisConfig;
use crate::error::{FanoutError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{info, instrument};

/// Redis 客户端
#[derive(Clone)]
pub struct KvStore {
    client: Client,
}

impl KvStore {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(FanoutError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(FanoutError::from)
    }

    /// 读取字符串值
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// 写入字符串值（无过期时间）
    #[instrument(skip(self, value))]
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    /// 删除值
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// 追加到列表尾部，返回追加后的长度
    #[instrument(skip(self, value))]
    pub async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let len: u64 = conn.rpush(key, value).await?;
        Ok(len)
    }

    /// 读取列表区间（闭区间，支持负下标）
    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    /// 裁剪列表，仅保留 [start, stop] 区间
    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    /// 列表长度
    pub async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }
}
