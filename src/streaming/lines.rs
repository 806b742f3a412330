//! 增量行缓冲
//!
//! 把任意切分的字节 chunk 重新组合成完整的行。按字节上的 `\n` 切分，
//! 因此被 chunk 边界截断的多字节 UTF-8 字符会留在缓冲区，等后续字节到达后再整体解码。

use crate::streaming::error::StreamError;

/// 行缓冲区
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    /// 已扫描过、确认不含换行符的前缀长度
    scanned: usize,
    /// 最大未分隔字节数（防止内存耗尽）
    max_buffer_size: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    /// 默认最大缓冲区大小 (1MB)
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::with_max_buffer_size(Self::DEFAULT_MAX_BUFFER_SIZE)
    }

    /// 创建带自定义缓冲区大小的行缓冲
    pub fn with_max_buffer_size(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_buffer_size: max_size,
        }
    }

    /// 不限制缓冲区大小
    pub fn unbounded() -> Self {
        Self::with_max_buffer_size(usize::MAX)
    }

    /// 当前未分隔的字节数
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// 追加字节，返回所有已完整的行（不含行尾的 `\n` / `\r\n`）
    ///
    /// 剩余的未分隔数据超过上限时返回 [`StreamError::BufferOverflow`]。
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, StreamError> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut pos = self.scanned;

        while let Some(offset) = self.buffer[pos..].iter().position(|&b| b == b'\n') {
            let end = pos + offset;
            lines.push(trim_cr(&self.buffer[start..end]).to_vec());
            start = end + 1;
            pos = start;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_buffer_size {
            self.buffer.clear();
            self.scanned = 0;
            return Err(StreamError::BufferOverflow);
        }

        Ok(lines)
    }

    /// 输入结束，取出最后一个没有换行符的行（如果有）
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(trim_cr(&rest).to_vec())
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// 将一行解码为 UTF-8 字符串
pub fn decode_line(line: Vec<u8>) -> Result<String, StreamError> {
    String::from_utf8(line).map_err(|e| StreamError::decode(format!("无效的 UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_lines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"a\nb\r\nc").unwrap();
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(buffer.buffer_size(), 1);

        let lines = buffer.push(b"d\n").unwrap();
        assert_eq!(lines, vec![b"cd".to_vec()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_split_utf8_across_chunks() {
        let text = "你好\n";
        let bytes = text.as_bytes();
        let mut buffer = LineBuffer::new();

        assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
        let lines = buffer.push(&bytes[2..]).unwrap();
        assert_eq!(decode_line(lines[0].clone()).unwrap(), "你好");
    }

    #[test]
    fn test_finish_returns_trailing_line() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"tail\r").unwrap();
        assert_eq!(buffer.finish(), Some(b"tail".to_vec()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_buffer_overflow() {
        let mut buffer = LineBuffer::with_max_buffer_size(8);
        assert!(buffer.push(b"0123\n").is_ok());
        let result = buffer.push(b"0123456789");
        assert!(matches!(result, Err(StreamError::BufferOverflow)));
    }

    #[test]
    fn test_decode_line_invalid_utf8() {
        let result = decode_line(vec![0xff, 0xfe]);
        assert!(matches!(result, Err(StreamError::Decode(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// 任意切分方式得到的行与一次性输入相同
        #[test]
        fn prop_chunking_does_not_change_lines(
            lines in prop::collection::vec("[a-z0-9 你好]{0,12}", 0..8),
            chunk_size in 1usize..9
        ) {
            let input: String = lines.iter().map(|l| format!("{}\n", l)).collect();

            let mut buffer = LineBuffer::new();
            let mut collected = Vec::new();
            for chunk in input.as_bytes().chunks(chunk_size) {
                collected.extend(buffer.push(chunk).unwrap());
            }
            prop_assert_eq!(buffer.finish(), None);

            let decoded: Vec<String> = collected
                .into_iter()
                .map(|l| decode_line(l).unwrap())
                .collect();
            prop_assert_eq!(decoded, lines);
        }
    }
}
