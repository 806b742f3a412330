//! 流式传输错误类型
//!
//! 定义归一化管道中可能发生的各种错误类型。
//!
//! 错误分为两类：
//! - 终止性错误：网络、超时、Provider、取消、缓冲区溢出等，流在此结束
//! - 隔离性错误：单个 chunk 解码失败、工具调用校验失败，只影响当前 chunk

use crate::streaming::tools::ToolError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 流式传输错误类型
///
/// 涵盖流式传输过程中可能发生的所有错误情况。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[serde(tag = "type", content = "details")]
pub enum StreamError {
    /// 网络错误
    ///
    /// 当网络连接失败、DNS 解析失败或连接被重置时发生。
    #[error("网络错误: {0}")]
    Network(String),

    /// 超时错误
    ///
    /// 整体超时或两个 chunk 之间的间隔超时。
    #[error("流式响应超时")]
    Timeout,

    /// 解码错误
    ///
    /// 单个 chunk 的 UTF-8 或 JSON 解码失败，只影响该 chunk。
    #[error("解码错误: {0}")]
    Decode(String),

    /// Provider 错误
    ///
    /// 当上游 Provider 返回非 2xx 响应时发生。
    #[error("Provider 错误 ({status}): {message}")]
    Provider {
        /// HTTP 状态码
        status: u16,
        /// 错误消息
        message: String,
    },

    /// 上游在流中报告的错误事件
    #[error("上游错误: {0}")]
    Upstream(String),

    /// 流被调用方取消
    #[error("流已取消")]
    Cancelled,

    /// 缓冲区溢出
    ///
    /// 当未分隔的数据超过配置的缓冲区大小时发生。
    #[error("缓冲区溢出")]
    BufferOverflow,

    /// 数据队列已关闭，无法继续追加
    #[error("数据队列已关闭")]
    DataQueueClosed,

    /// 工具调用校验或处理失败
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

// ============================================================================
// From trait 实现 - 用于错误转换
// ============================================================================

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Network(err.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else if err.is_connect() {
            StreamError::Network(format!("连接失败: {}", err))
        } else if err.is_decode() {
            StreamError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            StreamError::provider_error(status.as_u16(), err.to_string())
        } else {
            StreamError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for StreamError {
    fn from(err: base64::DecodeError) -> Self {
        StreamError::Decode(format!("base64 解码失败: {}", err))
    }
}

impl From<String> for StreamError {
    fn from(msg: String) -> Self {
        StreamError::Internal(msg)
    }
}

impl From<&str> for StreamError {
    fn from(msg: &str) -> Self {
        StreamError::Internal(msg.to_string())
    }
}

// ============================================================================
// 辅助方法
// ============================================================================

impl StreamError {
    /// 创建网络错误
    pub fn network(msg: impl Into<String>) -> Self {
        StreamError::Network(msg.into())
    }

    /// 创建解码错误
    pub fn decode(msg: impl Into<String>) -> Self {
        StreamError::Decode(msg.into())
    }

    /// 创建 Provider 错误
    pub fn provider_error(status: u16, message: impl Into<String>) -> Self {
        StreamError::Provider {
            status,
            message: message.into(),
        }
    }

    /// 创建上游错误
    pub fn upstream(msg: impl Into<String>) -> Self {
        StreamError::Upstream(msg.into())
    }

    /// 创建内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        StreamError::Internal(msg.into())
    }

    /// 判断错误是否终止整个流
    ///
    /// 解码错误和工具错误只影响单个 chunk / 单个调用，其余错误都会结束流。
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamError::Decode(_) | StreamError::Tool(_))
    }

    /// 判断错误是否可重试
    ///
    /// 重试由外层包装整个调用完成，本层只给出判断。
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Network(_) => true,
            StreamError::Timeout => true,
            StreamError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// 获取 HTTP 状态码（如果适用）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::Provider { status, .. } => Some(*status),
            StreamError::Timeout => Some(504),
            StreamError::Network(_) => Some(502),
            _ => None,
        }
    }

    /// 获取错误类型字符串
    pub fn error_type(&self) -> &'static str {
        match self {
            StreamError::Network(_) => "network_error",
            StreamError::Timeout => "timeout",
            StreamError::Decode(_) => "decode_error",
            StreamError::Provider { .. } => "provider_error",
            StreamError::Upstream(_) => "upstream_error",
            StreamError::Cancelled => "cancelled",
            StreamError::BufferOverflow => "buffer_overflow",
            StreamError::DataQueueClosed => "data_queue_closed",
            StreamError::Tool(_) => "tool_error",
            StreamError::Internal(_) => "internal_error",
        }
    }

    /// 转换为写入数据通道的错误对象
    pub fn to_data_value(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        })
    }
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "网络错误: connection refused");

        let err = StreamError::Timeout;
        assert_eq!(err.to_string(), "流式响应超时");

        let err = StreamError::provider_error(429, "rate limited");
        assert_eq!(err.to_string(), "Provider 错误 (429): rate limited");
    }

    #[test]
    fn test_stream_error_is_terminal() {
        assert!(StreamError::Network("reset".to_string()).is_terminal());
        assert!(StreamError::Timeout.is_terminal());
        assert!(StreamError::upstream("overloaded").is_terminal());
        assert!(StreamError::BufferOverflow.is_terminal());
        assert!(!StreamError::decode("bad json").is_terminal());

        let tool_err = ToolError::NoSuchTool {
            tool_name: "missing".to_string(),
            available: vec![],
        };
        assert!(!StreamError::from(tool_err).is_terminal());
    }

    #[test]
    fn test_stream_error_is_retryable() {
        assert!(StreamError::Network("test".to_string()).is_retryable());
        assert!(StreamError::Timeout.is_retryable());
        assert!(StreamError::provider_error(429, "rate limited").is_retryable());
        assert!(StreamError::provider_error(500, "server error").is_retryable());
        assert!(!StreamError::provider_error(400, "bad request").is_retryable());
        assert!(!StreamError::decode("invalid json").is_retryable());
        assert!(!StreamError::Cancelled.is_retryable());
    }

    #[test]
    fn test_stream_error_status_code() {
        assert_eq!(StreamError::Timeout.status_code(), Some(504));
        assert_eq!(
            StreamError::Network("test".to_string()).status_code(),
            Some(502)
        );
        assert_eq!(
            StreamError::provider_error(429, "test").status_code(),
            Some(429)
        );
        assert_eq!(StreamError::Cancelled.status_code(), None);
    }

    #[test]
    fn test_stream_error_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let stream_err: StreamError = json_err.into();
        assert!(matches!(stream_err, StreamError::Decode(_)));
        assert!(!stream_err.is_terminal());
    }

    #[test]
    fn test_stream_error_serialization() {
        let err = StreamError::provider_error(500, "internal server error");
        let json = serde_json::to_string(&err).unwrap();
        let deserialized: StreamError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, deserialized);
    }

    #[test]
    fn test_stream_error_to_data_value() {
        let value = StreamError::Timeout.to_data_value();
        assert_eq!(value["error"]["type"], "timeout");
        assert_eq!(value["error"]["message"], "流式响应超时");
    }
}
