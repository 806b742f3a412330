//! 二进制帧解码
//!
//! 两种输入：
//! - 已分帧的负载（每项一个 JSON 文档，例如 SDK 解出的 Bedrock chunk）
//! - 原始 AWS Event Stream 字节流，二进制头部之间夹着 JSON 信封，
//!   通过括号匹配定位，支持增量解析和错误恢复
//!
//! Bedrock 的信封形如 `{"bytes":"<base64>"}`，base64 解码后才是 Provider 的 JSON。

use crate::streaming::error::StreamError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

/// 解码单个帧负载
///
/// 负载是 `{"bytes": "<base64>"}` 信封时先做 base64 解码；
/// 只有 `message` 字段的信封是上游异常，返回终止性错误。
pub fn decode_frame_payload(payload: &[u8]) -> Result<Value, StreamError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| StreamError::decode(format!("帧负载不是有效的 UTF-8: {}", e)))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| StreamError::decode(format!("JSON 解析错误: {}", e)))?;
    unwrap_envelope(value)
}

fn unwrap_envelope(value: Value) -> Result<Value, StreamError> {
    let object = match value.as_object() {
        Some(object) => object,
        None => return Ok(value),
    };

    if let Some(encoded) = object.get("bytes").and_then(Value::as_str) {
        let raw = STANDARD.decode(encoded)?;
        let text = String::from_utf8(raw)
            .map_err(|e| StreamError::decode(format!("帧负载不是有效的 UTF-8: {}", e)))?;
        return serde_json::from_str(&text)
            .map_err(|e| StreamError::decode(format!("JSON 解析错误: {}", e)));
    }

    if object.len() == 1 {
        if let Some(message) = object.get("message").and_then(Value::as_str) {
            return Err(StreamError::upstream(message));
        }
    }

    Ok(value)
}

/// AWS Event Stream 增量解码器
#[derive(Debug)]
pub struct EventStreamDecoder {
    /// 缓冲区（用于处理部分 chunk）
    buffer: Vec<u8>,
    /// 解析错误计数
    parse_error_count: u32,
    /// 最大缓冲区大小（防止内存耗尽）
    max_buffer_size: usize,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    /// 默认最大缓冲区大小 (1MB)
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::with_max_buffer_size(Self::DEFAULT_MAX_BUFFER_SIZE)
    }

    /// 创建带自定义缓冲区大小的解码器
    pub fn with_max_buffer_size(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            parse_error_count: 0,
            max_buffer_size: max_size,
        }
    }

    /// 获取解析错误计数
    pub fn parse_error_count(&self) -> u32 {
        self.parse_error_count
    }

    /// 获取缓冲区大小
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// 处理接收到的字节
    ///
    /// 返回本次完整解析出的负载。单个信封的解码失败是隔离错误，
    /// 之后的信封照常解析。
    pub fn process(&mut self, bytes: &[u8]) -> Vec<Result<Value, StreamError>> {
        if bytes.is_empty() {
            return Vec::new();
        }

        if self.buffer.len() + bytes.len() > self.max_buffer_size {
            self.buffer.clear();
            return vec![Err(StreamError::BufferOverflow)];
        }

        self.buffer.extend_from_slice(bytes);
        self.parse_buffer()
    }

    /// 完成解析
    ///
    /// 尾部不完整的信封直接丢弃。
    pub fn finish(&mut self) -> Vec<Result<Value, StreamError>> {
        let results = self.parse_buffer();
        self.buffer.clear();
        results
    }

    fn parse_buffer(&mut self) -> Vec<Result<Value, StreamError>> {
        let mut results = Vec::new();
        let mut pos = 0;

        while pos < self.buffer.len() {
            let start = match self.find_json_start(pos) {
                Some(s) => s,
                None => {
                    // 剩下的都是二进制头部/尾部
                    pos = self.buffer.len();
                    break;
                }
            };

            let end = match self.find_json_end(start) {
                Some(end) => end,
                None => {
                    // JSON 对象不完整，等待更多数据
                    pos = start;
                    break;
                }
            };

            let result = decode_frame_payload(&self.buffer[start..end]);
            if result.is_err() {
                self.parse_error_count += 1;
            }
            results.push(result);
            pos = end;
        }

        if pos > 0 {
            self.buffer.drain(..pos);
        }

        results
    }

    /// 查找 JSON 对象的开始位置
    fn find_json_start(&self, from: usize) -> Option<usize> {
        self.buffer[from..]
            .iter()
            .position(|&b| b == b'{')
            .map(|p| from + p)
    }

    /// 括号匹配，返回完整 JSON 对象的结束位置（不含）
    fn find_json_end(&self, start: usize) -> Option<usize> {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escape_next = false;

        for (i, &b) in self.buffer[start..].iter().enumerate() {
            if escape_next {
                escape_next = false;
                continue;
            }

            match b {
                b'\\' if in_string => escape_next = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(start + i + 1);
                    }
                }
                _ => {}
            }
        }

        None
    }
}

// ============================================================================
// 测试模块
// ============================================================================
