//! 已读信号监听：载荷为 `{"user_id": <id>}`

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

use super::SignalHandler;
use crate::badge::BadgeCounter;

#[derive(Deserialize)]
struct SeenPayload {
    user_id: i64,
}

pub struct SeenListener {
    badges: Arc<dyn BadgeCounter>,
}

impl SeenListener {
    pub fn new(badges: Arc<dyn BadgeCounter>) -> Self {
        Self { badges }
    }
}

#[async_trait]
impl SignalHandler for SeenListener {
    async fn handle_signal(&self, payload: &str) {
        let seen: SeenPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(payload, error = %e, "已读信号无法解析，忽略");
                return;
            }
        };

        match self.badges.reset(seen.user_id).await {
            Ok(()) => debug!(user_id = seen.user_id, "角标已清零"),
            Err(e) => error!(user_id = seen.user_id, error = %e, "清零角标失败"),
        }
    }
}
