//! SSE 解码器
//!
//! 将 `text/event-stream` 字节流解码为事件。支持 `event` / `data` / `id` / `retry`
//! 字段、注释行、多行 data，以及在 chunk 中间被截断的行。

use crate::streaming::error::StreamError;
use crate::streaming::lines::{decode_line, LineBuffer};

/// 一个完整的 SSE 事件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` 字段
    pub event: Option<String>,
    /// 所有 `data:` 行以 `\n` 连接
    pub data: String,
    /// `id:` 字段
    pub id: Option<String>,
    /// `retry:` 字段（毫秒）
    pub retry: Option<u64>,
}

/// 增量 SSE 解码器
#[derive(Debug)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    /// 当前事件中有行解码失败，整个事件作废
    poisoned: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::with_max_buffer_size(LineBuffer::DEFAULT_MAX_BUFFER_SIZE)
    }

    pub fn with_max_buffer_size(max_size: usize) -> Self {
        Self {
            lines: LineBuffer::with_max_buffer_size(max_size),
            event: None,
            data: Vec::new(),
            id: None,
            retry: None,
            poisoned: false,
        }
    }

    /// 处理接收到的字节
    ///
    /// 返回本次完整解析出的事件。无效 UTF-8 的行产生一个隔离的解码错误；
    /// 缓冲区溢出产生终止性错误。
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<SseEvent, StreamError>> {
        match self.lines.push(bytes) {
            Ok(lines) => {
                let mut out = Vec::new();
                for line in lines {
                    self.process_line(line, &mut out);
                }
                out
            }
            Err(err) => vec![Err(err)],
        }
    }

    /// 输入结束
    ///
    /// 处理最后一个没有换行符的行，并分发尚未以空行结束的事件。
    pub fn finish(&mut self) -> Vec<Result<SseEvent, StreamError>> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.finish() {
            self.process_line(line, &mut out);
        }
        self.dispatch(&mut out);
        out
    }

    fn process_line(&mut self, line: Vec<u8>, out: &mut Vec<Result<SseEvent, StreamError>>) {
        let line = match decode_line(line) {
            Ok(line) => line,
            Err(err) => {
                self.poisoned = true;
                out.push(Err(err));
                return;
            }
        };

        if line.is_empty() {
            self.dispatch(out);
            return;
        }

        // 注释行
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => self.retry = value.trim().parse().ok(),
            _ => {}
        }
    }

    fn dispatch(&mut self, out: &mut Vec<Result<SseEvent, StreamError>>) {
        let poisoned = std::mem::take(&mut self.poisoned);
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        let id = self.id.take();
        let retry = self.retry.take();

        if poisoned || data.is_empty() {
            return;
        }

        out.push(Ok(SseEvent {
            event,
            data: data.join("\n"),
            id,
            retry,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(decoder: &mut SseDecoder, input: &[u8]) -> Vec<SseEvent> {
        let mut events: Vec<SseEvent> = decoder
            .push(input)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        events.extend(decoder.finish().into_iter().map(|r| r.unwrap()));
        events
    }

    #[test]
    fn test_basic_events() {
        let mut decoder = SseDecoder::new();
        let events = collect(
            &mut decoder,
            b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\ndata: [DONE]\n\n",
        );
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[2].data, "[DONE]");
    }

    #[test]
    fn test_event_name_and_id() {
        let mut decoder = SseDecoder::new();
        let events = collect(
            &mut decoder,
            b"event: completion\nid: 7\nretry: 3000\ndata: {\"completion\":\"Hi\"}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("completion"));
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].retry, Some(3000));
    }

    #[test]
    fn test_comments_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = collect(&mut decoder, b": keep-alive\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_crlf_and_no_space() {
        let mut decoder = SseDecoder::new();
        let events = collect(&mut decoder, b"data:x\r\n\r\n");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_trailing_event_without_blank_line() {
        let mut decoder = SseDecoder::new();
        let events = collect(&mut decoder, b"data: last");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "last");
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let mut decoder = SseDecoder::new();
        let events = collect(&mut decoder, b"event: ping\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_isolated() {
        let mut decoder = SseDecoder::new();
        let mut input = b"data: ".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b"\n\ndata: ok\n\n");

        let results = decoder.push(&input);
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0], Err(StreamError::Decode(_))));
        assert_eq!(results[1].as_ref().unwrap().data, "ok");
    }

    #[test]
    fn test_overflow_is_terminal() {
        let mut decoder = SseDecoder::with_max_buffer_size(4);
        let results = decoder.push(b"data: too long without newline");
        assert!(matches!(&results[0], Err(StreamError::BufferOverflow)));
        assert!(results[0].as_ref().unwrap_err().is_terminal());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// chunk 边界不影响解码结果
        #[test]
        fn prop_chunk_boundaries_are_transparent(
            payloads in prop::collection::vec("[a-zA-Z0-9 你好世界,.]{1,20}", 1..6),
            chunk_size in 1usize..16
        ) {
            let input: String = payloads
                .iter()
                .map(|p| format!("event: message\ndata: {}\n\n", p))
                .collect();

            let mut whole = SseDecoder::new();
            let expected = collect(&mut whole, input.as_bytes());

            let mut chunked = SseDecoder::new();
            let mut actual = Vec::new();
            for chunk in input.as_bytes().chunks(chunk_size) {
                actual.extend(chunked.push(chunk).into_iter().map(|r| r.unwrap()));
            }
            actual.extend(chunked.finish().into_iter().map(|r| r.unwrap()));

            prop_assert_eq!(&actual, &expected);
            let data: Vec<String> = actual.into_iter().map(|e| e.data).collect();
            prop_assert_eq!(data, payloads);
        }
    }
}
