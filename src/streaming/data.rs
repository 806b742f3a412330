//! 旁路数据队列
//!
//! 与主文本/工具事件独立的有序、只追加的 JSON 值通道。
//! 响应包装器在输出下一行事件之前把新到达的值作为一行 `2:` 部件刷出，
//! 主序列结束后关闭队列。调用方也可以提前关闭（例如在完成回调里），
//! 关闭前追加的值照常刷出。

use crate::streaming::error::StreamError;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct DataQueueState {
    pending: Vec<Value>,
    appended: usize,
    closed: bool,
}

/// 旁路数据队列
///
/// 克隆得到的句柄共享同一个队列。
#[derive(Debug, Clone, Default)]
pub struct StreamDataQueue {
    state: Arc<Mutex<DataQueueState>>,
}

impl StreamDataQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个值
    ///
    /// 队列关闭后返回 [`StreamError::DataQueueClosed`]。
    pub fn append(&self, value: Value) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::DataQueueClosed);
        }
        state.pending.push(value);
        state.appended += 1;
        Ok(())
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 尚未刷出的值数量
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 累计追加的值数量
    pub fn appended_count(&self) -> usize {
        self.state.lock().appended
    }

    /// 取出所有尚未刷出的值
    pub(crate) fn take_pending(&self) -> Vec<Value> {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// 关闭队列，幂等
    ///
    /// 首次关闭时返回 `true`。已追加但未刷出的值保留，仍可取出。
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        debug!(appended = state.appended, "旁路数据队列已关闭");
        true
    }
}
