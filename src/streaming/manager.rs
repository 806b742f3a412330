//! 流式管理器
//!
//! 持有流式配置，为每个请求打开一条归一化管道。

use crate::streaming::error::StreamError;
use crate::streaming::iterator::{reqwest_stream_to_byte_stream, ProviderTransport};
use crate::streaming::pipeline::StreamPipeline;
use crate::streaming::provider::ProviderFormat;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// 配置
// ============================================================================

/// 流式配置
///
/// 控制流式传输的行为参数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 缓冲区大小（字节）
    ///
    /// 任何行/帧缓冲区中未分隔数据的上限，防止内存耗尽。
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// 超时时间（毫秒）
    ///
    /// 整个流的最长持续时间。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// chunk 超时时间（毫秒）
    ///
    /// 两个 chunk 之间的最大等待时间。
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,

    /// SSE 流结束标记
    #[serde(default = "default_sse_sentinel")]
    pub sse_sentinel: String,

    /// 是否按工具注册表校验完整的工具调用
    #[serde(default = "default_validate_tool_calls")]
    pub validate_tool_calls: bool,
}

fn default_buffer_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_timeout_ms() -> u64 {
    300_000 // 5 分钟
}

fn default_chunk_timeout_ms() -> u64 {
    30_000 // 30 秒
}

fn default_sse_sentinel() -> String {
    "[DONE]".to_string()
}

fn default_validate_tool_calls() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            timeout_ms: default_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            sse_sentinel: default_sse_sentinel(),
            validate_tool_calls: default_validate_tool_calls(),
        }
    }
}

impl StreamConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置缓冲区大小
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// 设置超时时间
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// 设置 chunk 超时时间
    pub fn with_chunk_timeout_ms(mut self, chunk_timeout_ms: u64) -> Self {
        self.chunk_timeout_ms = chunk_timeout_ms;
        self
    }

    /// 设置 SSE 结束标记
    pub fn with_sse_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sse_sentinel = sentinel.into();
        self
    }

    /// 设置是否校验工具调用
    pub fn with_validate_tool_calls(mut self, validate: bool) -> Self {
        self.validate_tool_calls = validate;
        self
    }

    /// 获取超时 Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 获取 chunk 超时 Duration
    pub fn chunk_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

// ============================================================================
// 流式管理器
// ============================================================================

/// 流式管理器
#[derive(Debug, Clone, Default)]
pub struct StreamManager {
    /// 配置
    config: StreamConfig,
}

impl StreamManager {
    /// 创建新的流式管理器
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// 获取配置
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 更新配置
    pub fn set_config(&mut self, config: StreamConfig) {
        self.config = config;
    }

    /// 为一个 Provider 传输打开管道
    pub fn open(&self, format: ProviderFormat, transport: ProviderTransport) -> StreamPipeline {
        debug!(provider = ?format, transport = ?transport.kind(), "打开流式管道");
        StreamPipeline::new(format, transport).with_config(self.config.clone())
    }

    /// 以 Provider 的默认传输方式打开 HTTP 响应
    pub fn open_response(&self, format: ProviderFormat, response: reqwest::Response) -> StreamPipeline {
        let bytes = reqwest_stream_to_byte_stream(response);
        let transport = ProviderTransport::from_bytes(format.default_transport(), bytes);
        self.open(format, transport)
    }
}

/// 从线路字节流中收集所有内容
///
/// 用于测试和调试。
pub async fn collect_stream_content<S>(mut stream: S) -> Result<String, StreamError>
where
    S: Stream<Item = Result<Bytes, StreamError>> + Unpin,
{
    let mut content = Vec::new();

    while let Some(result) = stream.next().await {
        match result {
            Ok(chunk) => content.extend_from_slice(&chunk),
            Err(e) => return Err(e),
        }
    }

    String::from_utf8(content).map_err(|e| StreamError::decode(e.to_string()))
}

// ============================================================================
// 测试模块
// ============================================================================
