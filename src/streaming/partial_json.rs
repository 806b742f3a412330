//! 部分 JSON 重建
//!
//! 结构化输出模式下，模型逐步吐出 JSON 文本。每次追加后尽力解析当前缓冲区，
//! 用最少的合成闭合得到一个"深度部分"值：
//! - 未闭合的字符串保留已完整的内容（不完整的转义序列丢弃）
//! - 未闭合的数组/对象在最后一个完整元素处闭合
//! - 只有键没有值的成员省略
//! - 末尾不完整的字面量（`tru`、`nul`）视为未解析
//! - 末尾的数字去掉不完整的 `.` / `e` / `-` 后保留
//!
//! 遇到非法字符时，从该处截断，之前已解析的部分照常返回，永不报错。
//! 嵌套超过 [`MAX_DEPTH`] 层的容器视为未解析。

use crate::streaming::error::StreamError;
use crate::streaming::event::{EventStream, StreamEvent};
use async_stream::stream;
use futures::{Stream, StreamExt};
use serde_json::{Map, Number, Value};
use std::pin::Pin;
use tracing::debug;

/// 部分对象流类型别名
pub type PartialObjectStream = Pin<Box<dyn Stream<Item = Result<Value, StreamError>> + Send>>;

/// 容器的最大嵌套层数，与 serde_json 的递归上限一致
pub const MAX_DEPTH: usize = 128;

/// 尽力解析部分 JSON 文本
///
/// 空输入或尚无可解析值时返回 `None`。之后的多余内容被忽略。
pub fn parse_partial_json(text: &str) -> Option<Value> {
    let chars: Vec<char> = text.chars().collect();
    let mut parser = PartialParser {
        chars,
        pos: 0,
        depth: 0,
    };
    match parser.parse_value() {
        Parsed::Complete(value) | Parsed::Partial(value) => Some(value),
        Parsed::Nothing => None,
    }
}

/// 单个值的解析结果
enum Parsed {
    /// 值完整结束
    Complete(Value),
    /// 输入在值内部结束（或遇到非法字符），这是闭合后的结果
    Partial(Value),
    /// 没有可用的值
    Nothing,
}

struct PartialParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl PartialParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Parsed {
        self.skip_whitespace();
        match self.peek() {
            None => Parsed::Nothing,
            Some('{') => self.nested(Self::parse_object),
            Some('[') => self.nested(Self::parse_array),
            Some('"') => match self.parse_string() {
                Some((s, true)) => Parsed::Complete(Value::String(s)),
                Some((s, false)) => Parsed::Partial(Value::String(s)),
                None => Parsed::Nothing,
            },
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            Some('t') => self.parse_literal("true", Value::Bool(true)),
            Some('f') => self.parse_literal("false", Value::Bool(false)),
            Some('n') => self.parse_literal("null", Value::Null),
            Some(_) => Parsed::Nothing,
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Parsed) -> Parsed {
        if self.depth >= MAX_DEPTH {
            return Parsed::Nothing;
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_object(&mut self) -> Parsed {
        // 跳过 '{'
        self.pos += 1;
        let mut object = Map::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    return Parsed::Complete(Value::Object(object));
                }
                Some('"') => {}
                _ => return Parsed::Partial(Value::Object(object)),
            }

            let key = match self.parse_string() {
                Some((key, true)) => key,
                _ => return Parsed::Partial(Value::Object(object)),
            };

            self.skip_whitespace();
            if self.peek() != Some(':') {
                return Parsed::Partial(Value::Object(object));
            }
            self.pos += 1;

            match self.parse_value() {
                Parsed::Complete(value) => {
                    object.insert(key, value);
                }
                Parsed::Partial(value) => {
                    object.insert(key, value);
                    return Parsed::Partial(Value::Object(object));
                }
                Parsed::Nothing => return Parsed::Partial(Value::Object(object)),
            }

            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Parsed::Complete(Value::Object(object));
                }
                _ => return Parsed::Partial(Value::Object(object)),
            }
        }
    }

    fn parse_array(&mut self) -> Parsed {
        // 跳过 '['
        self.pos += 1;
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Parsed::Complete(Value::Array(items));
            }

            match self.parse_value() {
                Parsed::Complete(value) => items.push(value),
                Parsed::Partial(value) => {
                    items.push(value);
                    return Parsed::Partial(Value::Array(items));
                }
                Parsed::Nothing => return Parsed::Partial(Value::Array(items)),
            }

            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Parsed::Complete(Value::Array(items));
                }
                _ => return Parsed::Partial(Value::Array(items)),
            }
        }
    }

    /// 解析字符串，返回内容以及是否遇到了闭合引号
    ///
    /// 非法转义视为截断点。
    fn parse_string(&mut self) -> Option<(String, bool)> {
        if self.bump() != Some('"') {
            return None;
        }

        let mut out = String::new();
        loop {
            let c = match self.bump() {
                Some(c) => c,
                None => return Some((out, false)),
            };

            match c {
                '"' => return Some((out, true)),
                '\\' => match self.parse_escape() {
                    Some(decoded) => out.push(decoded),
                    None => return Some((out, false)),
                },
                c => out.push(c),
            }
        }
    }

    fn parse_escape(&mut self) -> Option<char> {
        let c = match self.bump()? {
            '"' => '"',
            '\\' => '\\',
            '/' => '/',
            'b' => '\u{0008}',
            'f' => '\u{000c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'u' => return self.parse_unicode_escape(),
            _ => return None,
        };
        Some(c)
    }

    fn parse_unicode_escape(&mut self) -> Option<char> {
        let high = self.parse_hex4()?;
        if !(0xD800..0xDC00).contains(&high) {
            return char::from_u32(high);
        }

        // 代理对的低位必须紧跟其后
        if self.bump()? != '\\' || self.bump()? != 'u' {
            return None;
        }
        let low = self.parse_hex4()?;
        if !(0xDC00..0xE000).contains(&low) {
            return None;
        }
        char::from_u32(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00))
    }

    fn parse_hex4(&mut self) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..4 {
            value = value * 16 + self.bump()?.to_digit(16)?;
        }
        Some(value)
    }

    fn parse_number(&mut self) -> Parsed {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')
        ) {
            self.pos += 1;
        }

        let at_end = self.peek().is_none();
        let raw: String = self.chars[start..self.pos].iter().collect();
        let text = if at_end {
            raw.trim_end_matches(['.', 'e', 'E', '-', '+'])
        } else {
            raw.as_str()
        };

        match serde_json::from_str::<Number>(text) {
            Ok(number) if at_end => Parsed::Partial(Value::Number(number)),
            Ok(number) => Parsed::Complete(Value::Number(number)),
            Err(_) => Parsed::Nothing,
        }
    }

    fn parse_literal(&mut self, literal: &str, value: Value) -> Parsed {
        let rest: String = self.chars[self.pos..]
            .iter()
            .take(literal.len())
            .collect();
        if rest == literal {
            self.pos += literal.len();
            Parsed::Complete(value)
        } else {
            Parsed::Nothing
        }
    }
}

// ============================================================================
// 快照去重
// ============================================================================

/// 部分对象重建器
///
/// 维护单调增长的文本缓冲区，只有当新快照与上一次发出的快照结构不等时才返回。
#[derive(Debug, Default)]
pub struct PartialObjectReconstructor {
    buffer: String,
    last: Option<Value>,
}

impl PartialObjectReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加文本，有新的快照时返回
    pub fn push(&mut self, text: &str) -> Option<Value> {
        self.buffer.push_str(text);
        let snapshot = parse_partial_json(&self.buffer)?;
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }

    /// 累积的全部文本
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// 上一次发出的快照
    pub fn snapshot(&self) -> Option<&Value> {
        self.last.as_ref()
    }
}

/// 部分对象的输入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectMode {
    /// 文本增量即 JSON 文本
    #[default]
    Json,
    /// 工具调用的参数分片即 JSON 文本（只跟踪第一个出现的调用索引）
    Tool,
}

/// 把事件流转换为部分对象快照流
///
/// 流中的 `Error` 事件作为 `Err` 抛给消费方，之后流结束。
pub fn partial_object_stream(mut events: EventStream, mode: ObjectMode) -> PartialObjectStream {
    Box::pin(stream! {
        let mut reconstructor = PartialObjectReconstructor::new();
        let mut tracked_index: Option<u32> = None;

        while let Some(event) = events.next().await {
            let fragment = match event {
                StreamEvent::TextDelta { text } if mode == ObjectMode::Json => text,
                StreamEvent::ToolCallDelta(delta) if mode == ObjectMode::Tool => {
                    let index = *tracked_index.get_or_insert(delta.index);
                    if index != delta.index {
                        continue;
                    }
                    delta.args_fragment
                }
                StreamEvent::Error { cause } => {
                    yield Err(cause);
                    return;
                }
                StreamEvent::Finish { .. } => break,
                _ => continue,
            };

            if let Some(snapshot) = reconstructor.push(&fragment) {
                yield Ok(snapshot);
            }
        }

        debug!(buffer_len = reconstructor.buffer().len(), "部分对象流结束");
    })
}

// ============================================================================
// 测试模块
// ============================================================================
