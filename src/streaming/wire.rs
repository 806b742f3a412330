//! 线路协议编解码
//!
//! 每行一个部件：`<code>:<json>\n`
//!
//! | code | 负载 | 含义 |
//! |---|---|---|
//! | `0` | JSON 字符串 | 文本增量 |
//! | `1` | `{"function_call":{"name","arguments"}}` | 完整的函数调用 |
//! | `2` | JSON 数组 | 旁路数据 |
//!
//! 编码顺序就是管道的发出顺序。解码遇到第一个非法行即失败，不做部分恢复。

use crate::streaming::error::StreamError;
use crate::streaming::event::{StreamEvent, ToolCall};
use crate::streaming::iterator::ByteStream;
use crate::streaming::lines::LineBuffer;
use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// 响应的内容类型
pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// 声明响应携带旁路数据的头部
pub const STREAM_DATA_HEADER: &str = "x-experimental-stream-data";

/// 部件流类型别名
pub type WirePartStream = Pin<Box<dyn Stream<Item = Result<WirePart, WireError>> + Send>>;

// ============================================================================
// 错误
// ============================================================================

/// 线路解码错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("缺少 ':' 分隔符: {line}")]
    MissingSeparator { line: String },

    #[error("未知的部件代码: {code}")]
    InvalidCode { code: String },

    #[error("部件 {code} 的负载不是合法 JSON: {message}")]
    InvalidJson { code: String, message: String },

    #[error("部件 {code} 的负载形状不符，期望 {expected}")]
    InvalidShape { code: String, expected: &'static str },

    #[error("无效的 UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("输入在行中间结束: {line}")]
    IncompleteLine { line: String },

    #[error("传输错误: {0}")]
    Transport(StreamError),
}

// ============================================================================
// 部件
// ============================================================================

/// 部件代码注册表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPartCode {
    Text,
    FunctionCall,
    Data,
}

impl StreamPartCode {
    pub const ALL: [StreamPartCode; 3] = [
        StreamPartCode::Text,
        StreamPartCode::FunctionCall,
        StreamPartCode::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamPartCode::Text => "0",
            StreamPartCode::FunctionCall => "1",
            StreamPartCode::Data => "2",
        }
    }

    pub fn parse(code: &str) -> Result<Self, WireError> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == code)
            .ok_or_else(|| WireError::InvalidCode {
                code: code.to_string(),
            })
    }
}

impl fmt::Display for StreamPartCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 函数调用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCall> for FunctionCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            name: call.tool_name.clone(),
            arguments: call.args.clone(),
        }
    }
}

impl fmt::Display for FunctionCall {
    /// 序列化为 `{"function_call":{"name":..,"arguments":..}}`，键顺序固定
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"function_call\":{{\"name\":{},\"arguments\":{}}}}}",
            Value::from(self.name.as_str()),
            Value::from(self.arguments.as_str())
        )
    }
}

#[derive(Deserialize)]
struct FunctionCallPayload {
    function_call: FunctionCall,
}

/// 一行线路部件
#[derive(Debug, Clone, PartialEq)]
pub enum WirePart {
    Text(String),
    FunctionCall(FunctionCall),
    Data(Vec<Value>),
}

impl WirePart {
    pub fn code(&self) -> StreamPartCode {
        match self {
            WirePart::Text(_) => StreamPartCode::Text,
            WirePart::FunctionCall(_) => StreamPartCode::FunctionCall,
            WirePart::Data(_) => StreamPartCode::Data,
        }
    }

    /// 从归一化事件编码，没有线路表示的事件返回 `None`
    pub fn from_event(event: &StreamEvent) -> Option<WirePart> {
        match event {
            StreamEvent::TextDelta { text } if !text.is_empty() => {
                Some(WirePart::Text(text.clone()))
            }
            StreamEvent::ToolCall(call) => Some(WirePart::FunctionCall(call.into())),
            _ => None,
        }
    }
}

/// 格式化一个部件，含行尾换行符
pub fn format_stream_part(part: &WirePart) -> String {
    let payload = match part {
        WirePart::Text(text) => Value::from(text.as_str()).to_string(),
        WirePart::FunctionCall(call) => call.to_string(),
        WirePart::Data(values) => Value::Array(values.clone()).to_string(),
    };
    format!("{}:{}\n", part.code(), payload)
}

/// 解析一行（可带行尾换行符）
pub fn parse_stream_part(line: &str) -> Result<WirePart, WireError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let (code, payload) = line
        .split_once(':')
        .ok_or_else(|| WireError::MissingSeparator {
            line: line.to_string(),
        })?;

    let code = StreamPartCode::parse(code)?;
    let value: Value = serde_json::from_str(payload).map_err(|e| WireError::InvalidJson {
        code: code.to_string(),
        message: e.to_string(),
    })?;

    let invalid_shape = |expected| WireError::InvalidShape {
        code: code.to_string(),
        expected,
    };

    match code {
        StreamPartCode::Text => match value {
            Value::String(text) => Ok(WirePart::Text(text)),
            _ => Err(invalid_shape("字符串")),
        },
        StreamPartCode::FunctionCall => serde_json::from_value::<FunctionCallPayload>(value)
            .map(|p| WirePart::FunctionCall(p.function_call))
            .map_err(|_| invalid_shape("{\"function_call\":{\"name\",\"arguments\"}}")),
        StreamPartCode::Data => match value {
            Value::Array(values) => Ok(WirePart::Data(values)),
            _ => Err(invalid_shape("数组")),
        },
    }
}

// ============================================================================
// 输出协议
// ============================================================================

/// 响应体的输出协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// `code:json\n` 分帧，支持旁路数据
    #[default]
    Data,
    /// 原始文本，不分帧
    Text,
}

impl WireProtocol {
    /// 编码一个事件，没有输出表示的事件返回 `None`
    pub fn encode_event(&self, event: &StreamEvent) -> Option<String> {
        match self {
            WireProtocol::Data => WirePart::from_event(event).map(|p| format_stream_part(&p)),
            WireProtocol::Text => match event {
                StreamEvent::TextDelta { text } if !text.is_empty() => Some(text.clone()),
                StreamEvent::ToolCall(call) => Some(FunctionCall::from(call).to_string()),
                _ => None,
            },
        }
    }

    pub fn supports_stream_data(&self) -> bool {
        matches!(self, WireProtocol::Data)
    }
}

// ============================================================================
// 客户端解码
// ============================================================================

/// 增量线路解码器
///
/// 跨 chunk 缓冲不完整的行，遇到第一个非法行即失败；失败后不再接受输入。
#[derive(Debug)]
pub struct WireDecoder {
    lines: LineBuffer,
    failed: Option<WireError>,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl WireDecoder {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::unbounded(),
            failed: None,
        }
    }

    /// 追加字节，返回本次完整解析出的部件
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<WirePart>, WireError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let result = self
            .lines
            .push(bytes)
            .map_err(WireError::Transport)
            .and_then(|lines| {
                lines
                    .into_iter()
                    .filter(|line| !line.is_empty())
                    .map(parse_line)
                    .collect()
            });

        if let Err(err) = &result {
            self.failed = Some(err.clone());
        }
        result
    }

    /// 输入结束
    ///
    /// 缓冲区中剩余未以换行结尾的内容报告为 [`WireError::IncompleteLine`]。
    pub fn finish(&mut self) -> Result<(), WireError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        match self.lines.finish() {
            Some(rest) => Err(WireError::IncompleteLine {
                line: String::from_utf8_lossy(&rest).into_owned(),
            }),
            None => Ok(()),
        }
    }
}

fn parse_line(line: Vec<u8>) -> Result<WirePart, WireError> {
    let line = String::from_utf8(line).map_err(|e| WireError::InvalidUtf8(e.to_string()))?;
    parse_stream_part(&line)
}

/// 把线路字节流解码为部件流
///
/// 第一个错误之后流结束。
pub fn decode_wire_stream(mut bytes: ByteStream) -> WirePartStream {
    Box::pin(stream! {
        let mut decoder = WireDecoder::new();
        while let Some(chunk) = bytes.next().await {
            let parsed = match chunk {
                Ok(chunk) => decoder.push(&chunk),
                Err(err) => Err(WireError::Transport(err)),
            };
            match parsed {
                Ok(parts) => {
                    for part in parts {
                        yield Ok(part);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
        if let Err(err) = decoder.finish() {
            yield Err(err);
        }
    })
}

// ============================================================================
// 测试模块
// ============================================================================
