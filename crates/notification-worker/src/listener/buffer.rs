//! 待处理缓冲区
//!
//! 只有一个写入者（变更订阅回调）和一个读取者（主循环）。
//! 读取时在同一临界区内换出整个 Vec，追加与取出之间不会丢失或重复事件。

use parking_lot::Mutex;

use crate::event::NotificationEvent;

#[derive(Default)]
pub struct PendingBuffer {
    inner: Mutex<Vec<NotificationEvent>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: NotificationEvent) {
        self.inner.lock().push(event);
    }

    /// 取出全部待处理事件；缓冲区为空时返回 `None`
    pub fn take_pending(&self) -> Option<Vec<NotificationEvent>> {
        let mut guard = self.inner.lock();
        if guard.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *guard))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
