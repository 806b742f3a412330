//! 生命周期回调
//!
//! 透传阶段：按事件发出的顺序同步调用回调，不消费也不修改事件。
//!
//! - `on_start`：第一次拉取时
//! - `on_token`：每个文本增量
//! - `on_tool_call`：每个完整的工具调用
//! - `on_error`：每个错误事件（包括非终止错误）
//! - `on_completion`：流结束（`Finish` 或终止性错误）时，参数为累积的全部文本
//! - `on_final`：只在流自然结束（`Finish`）时调用，在 `on_completion` 之后
//!
//! 流被取消（没有结束事件就终止）时，`on_completion` 和 `on_final` 都不会被调用。

use crate::streaming::error::StreamError;
use crate::streaming::event::{EventStream, StreamEvent, ToolCall};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

type StartHook = Box<dyn FnMut() + Send>;
type TextHook = Box<dyn FnMut(&str) + Send>;
type ToolCallHook = Box<dyn FnMut(&ToolCall) + Send>;
type ErrorHook = Box<dyn FnMut(&StreamError) + Send>;

/// 回调集合
#[derive(Default)]
pub struct StreamCallbacks {
    on_start: Option<StartHook>,
    on_token: Option<TextHook>,
    on_tool_call: Option<ToolCallHook>,
    on_error: Option<ErrorHook>,
    on_completion: Option<TextHook>,
    on_final: Option<TextHook>,
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_token", &self.on_token.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_completion", &self.on_completion.is_some())
            .field("on_final", &self.on_final.is_some())
            .finish()
    }
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_token<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_token = Some(Box::new(f));
        self
    }

    pub fn on_tool_call<F>(mut self, f: F) -> Self
    where
        F: FnMut(&ToolCall) + Send + 'static,
    {
        self.on_tool_call = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(&StreamError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_completion<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_completion = Some(Box::new(f));
        self
    }

    pub fn on_final<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_final = Some(Box::new(f));
        self
    }

    /// 是否没有注册任何回调
    pub fn is_empty(&self) -> bool {
        self.on_start.is_none()
            && self.on_token.is_none()
            && self.on_tool_call.is_none()
            && self.on_error.is_none()
            && self.on_completion.is_none()
            && self.on_final.is_none()
    }
}

/// 带回调的事件流
pub struct CallbackStream {
    inner: EventStream,
    callbacks: StreamCallbacks,
    /// 累积的全部文本
    text: String,
    started: bool,
    finished: bool,
}

impl CallbackStream {
    pub fn new(inner: EventStream, callbacks: StreamCallbacks) -> Self {
        Self {
            inner,
            callbacks,
            text: String::new(),
            started: false,
            finished: false,
        }
    }

    /// 目前累积的文本
    pub fn text(&self) -> &str {
        &self.text
    }

    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => {
                self.text.push_str(text);
                if let Some(hook) = self.callbacks.on_token.as_mut() {
                    hook(text);
                }
            }
            StreamEvent::ToolCall(call) => {
                if let Some(hook) = self.callbacks.on_tool_call.as_mut() {
                    hook(call);
                }
            }
            StreamEvent::Error { cause } => {
                if let Some(hook) = self.callbacks.on_error.as_mut() {
                    hook(cause);
                }
                if cause.is_terminal() {
                    self.complete(false);
                }
            }
            StreamEvent::Finish { .. } => self.complete(true),
            StreamEvent::ToolCallDelta(_) => {}
        }
    }

    fn complete(&mut self, natural: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(hook) = self.callbacks.on_completion.as_mut() {
            hook(&self.text);
        }
        if natural {
            if let Some(hook) = self.callbacks.on_final.as_mut() {
                hook(&self.text);
            }
        }
        debug!(text_len = self.text.len(), natural, "回调阶段结束");
    }
}

impl Stream for CallbackStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            if let Some(hook) = this.callbacks.on_start.as_mut() {
                hook();
            }
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(event)) => {
                this.observe(&event);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

/// 为事件流挂上回调，没有回调时原样返回
pub fn with_callbacks(events: EventStream, callbacks: StreamCallbacks) -> EventStream {
    if callbacks.is_empty() {
        return events;
    }
    Box::pin(CallbackStream::new(events, callbacks))
}

// ============================================================================
// 测试模块
// ============================================================================
