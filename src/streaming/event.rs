//! 归一化事件词汇
//!
//! 所有 Provider 的增量输出都被转换为 [`StreamEvent`]，后续各阶段只认识这一种事件。

use crate::streaming::error::StreamError;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// 归一化事件流
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// 结束原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// 正常结束
    Stop,
    /// 达到最大长度
    Length,
    /// 被内容过滤
    ContentFilter,
    /// 以工具调用结束
    ToolCalls,
    /// 上游报告错误
    Error,
    /// 未识别的 Provider 原因
    Other(String),
    /// 未知
    Unknown,
}

impl FinishReason {
    /// 将 Provider 的结束原因字符串映射为统一枚举
    pub fn from_provider(reason: &str) -> Self {
        match reason.to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" | "complete" | "eos_token" | "eos" => {
                FinishReason::Stop
            }
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" | "safety" | "recitation" | "blocklist" | "prohibited_content"
            | "spii" => FinishReason::ContentFilter,
            "tool_calls" | "function_call" | "tool_use" => FinishReason::ToolCalls,
            "error" | "error_toxic" | "error_limit" => FinishReason::Error,
            "" | "finish_reason_unspecified" => FinishReason::Unknown,
            _ => FinishReason::Other(reason.to_string()),
        }
    }

    /// 获取结束原因字符串
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
            FinishReason::Other(reason) => reason,
            FinishReason::Unknown => "unknown",
        }
    }
}

/// Token 使用量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt_tokens: Option<u64>, completion_tokens: Option<u64>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// 合并后到的使用量，后到的非空字段覆盖之前的值
    pub fn merge(&mut self, other: Usage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none()
    }
}

/// 工具调用参数增量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Provider 提供的调用 ID（尚未提供时为空）
    pub call_id: Option<String>,
    /// 工具名称（已知时）
    pub tool_name: Option<String>,
    /// 本次新增的参数文本
    pub args_fragment: String,
    /// 分片索引
    pub index: u32,
}

/// 完整的工具调用
///
/// `args` 是可解析的 JSON 文本。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub args: String,
}

/// 归一化后的流事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 文本增量
    TextDelta { text: String },
    /// 工具调用参数增量
    ToolCallDelta(ToolCallDelta),
    /// 完整的工具调用
    ToolCall(ToolCall),
    /// 错误
    Error { cause: StreamError },
    /// 流结束
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta { text: text.into() }
    }

    pub fn error(cause: StreamError) -> Self {
        StreamEvent::Error { cause }
    }

    /// 是否为流的最后一个事件
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Finish { .. } => true,
            StreamEvent::Error { cause } => cause.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(FinishReason::from_provider("tool_use"), FinishReason::ToolCalls);
        assert_eq!(
            FinishReason::from_provider("SAFETY"),
            FinishReason::ContentFilter
        );
        assert_eq!(
            FinishReason::from_provider("weird"),
            FinishReason::Other("weird".to_string())
        );
        assert_eq!(FinishReason::from_provider(""), FinishReason::Unknown);
    }

    #[test]
    fn test_usage_merge() {
        let mut usage = Usage::new(Some(10), None);
        usage.merge(Usage::new(None, Some(5)));
        assert_eq!(usage, Usage::new(Some(10), Some(5)));

        usage.merge(Usage::new(None, Some(7)));
        assert_eq!(usage.completion_tokens, Some(7));
        assert!(!usage.is_empty());
        assert!(Usage::default().is_empty());
    }

    #[test]
    fn test_event_is_terminal() {
        assert!(StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: None
        }
        .is_terminal());
        assert!(StreamEvent::error(StreamError::Timeout).is_terminal());
        assert!(!StreamEvent::error(StreamError::decode("bad")).is_terminal());
        assert!(!StreamEvent::text("hi").is_terminal());
    }
}
