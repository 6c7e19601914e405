//! 用户 id 的不透明编码
//!
//! 聊天表里的会话 id 由双方编码后的 id 拼成，群发通知自行构造会话 id 时必须使用同一套盐和长度。

use std::sync::Arc;

use harsh::Harsh;

use crate::error::{NotificationError, Result};

#[derive(Clone)]
pub struct HashIds {
    inner: Arc<Harsh>,
}

impl std::fmt::Debug for HashIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIds").finish_non_exhaustive()
    }
}

impl HashIds {
    pub fn new(salt: &str, min_length: usize) -> Result<Self> {
        let inner = Harsh::builder()
            .salt(salt)
            .length(min_length)
            .build()
            .map_err(|e| NotificationError::mapping("hash_id", e.to_string()))?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// 负数不会出现在用户表中，原样输出
    pub fn encode(&self, id: i64) -> String {
        match u64::try_from(id) {
            Ok(value) => self.inner.encode(&[value]),
            Err(_) => id.to_string(),
        }
    }

    pub fn decode(&self, encoded: &str) -> Option<i64> {
        match self.inner.decode(encoded).ok()?.as_slice() {
            [value] => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    /// 两个用户之间的会话 id
    pub fn chat_id(&self, a: i64, b: i64) -> String {
        crate::mapping::chat_id(&self.encode(a), &self.encode(b))
    }
}
