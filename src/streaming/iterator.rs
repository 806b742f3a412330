//! 异步增量迭代器
//!
//! 把 Provider 的原生传输（SSE 字节流、JSON Lines、结构化对象序列、二进制帧）
//! 适配为统一的 [`RawChunk`] 异步序列。
//!
//! 所有适配器都是拉取驱动的：下游请求下一项时才读取上游，
//! 不会提前排空传输。每次拉取前检查取消信号，拉取过程中与取消信号竞争，
//! 并受整体超时和 chunk 间隔超时约束。

use crate::streaming::error::StreamError;
use crate::streaming::frames::{decode_frame_payload, EventStreamDecoder};
use crate::streaming::lines::{decode_line, LineBuffer};
use crate::streaming::manager::StreamConfig;
use crate::streaming::metrics::MetricsHandle;
use crate::streaming::provider::{RawChunk, TransportKind};
use crate::streaming::sse::SseDecoder;
use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 字节流类型别名
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// 结构化对象流类型别名
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Value, StreamError>> + Send>>;

/// 原始 chunk 流类型别名
pub type RawChunkStream = Pin<Box<dyn Stream<Item = Result<RawChunk, StreamError>> + Send>>;

/// Provider 的原生传输
pub enum ProviderTransport {
    /// `data: ...` 分帧的 SSE 字节流
    Sse(ByteStream),
    /// 换行分隔的 JSON 字节流
    JsonLines(ByteStream),
    /// 已解码的结构化对象序列
    Objects(ValueStream),
    /// 每项一个 JSON 负载的帧序列
    Frames(ByteStream),
    /// 原始 AWS Event Stream 字节流
    AwsEventStream(ByteStream),
}

impl std::fmt::Debug for ProviderTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProviderTransport").field(&self.kind()).finish()
    }
}

impl ProviderTransport {
    pub fn sse<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        ProviderTransport::Sse(Box::pin(stream))
    }

    pub fn json_lines<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        ProviderTransport::JsonLines(Box::pin(stream))
    }

    pub fn objects<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, StreamError>> + Send + 'static,
    {
        ProviderTransport::Objects(Box::pin(stream))
    }

    pub fn frames<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        ProviderTransport::Frames(Box::pin(stream))
    }

    pub fn aws_event_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        ProviderTransport::AwsEventStream(Box::pin(stream))
    }

    /// 按传输类型包装字节流
    ///
    /// `Objects` 不是字节传输，按 JSON Lines 处理。
    pub fn from_bytes(kind: TransportKind, stream: ByteStream) -> Self {
        match kind {
            TransportKind::Sse => ProviderTransport::Sse(stream),
            TransportKind::JsonLines | TransportKind::Objects => {
                ProviderTransport::JsonLines(stream)
            }
            TransportKind::Frames => ProviderTransport::Frames(stream),
            TransportKind::AwsEventStream => ProviderTransport::AwsEventStream(stream),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            ProviderTransport::Sse(_) => TransportKind::Sse,
            ProviderTransport::JsonLines(_) => TransportKind::JsonLines,
            ProviderTransport::Objects(_) => TransportKind::Objects,
            ProviderTransport::Frames(_) => TransportKind::Frames,
            ProviderTransport::AwsEventStream(_) => TransportKind::AwsEventStream,
        }
    }

    /// 转换为原始 chunk 流
    ///
    /// 单个 chunk 的解码失败产生隔离的 [`StreamError::Decode`]；
    /// 传输错误、超时和缓冲区溢出是终止性错误，之后流结束。
    /// 取消后流直接结束，不产生错误。
    pub fn into_raw_chunks(
        self,
        config: &StreamConfig,
        cancel: CancellationToken,
        metrics: MetricsHandle,
    ) -> RawChunkStream {
        match self {
            ProviderTransport::Sse(bytes) => {
                let bytes = guard(bytes, config, cancel);
                sse_chunks(bytes, config, metrics)
            }
            ProviderTransport::JsonLines(bytes) => {
                let bytes = guard(bytes, config, cancel);
                json_line_chunks(bytes, config, metrics)
            }
            ProviderTransport::Objects(values) => {
                let values = guard(values, config, cancel);
                object_chunks(values, metrics)
            }
            ProviderTransport::Frames(bytes) => {
                let bytes = guard(bytes, config, cancel);
                frame_chunks(bytes, metrics)
            }
            ProviderTransport::AwsEventStream(bytes) => {
                let bytes = guard(bytes, config, cancel);
                event_stream_chunks(bytes, config, metrics)
            }
        }
    }
}

/// 将 reqwest 响应转换为字节流
///
/// 非 2xx 响应产生一个携带状态码和响应体的 [`StreamError::Provider`]。
pub fn reqwest_stream_to_byte_stream(response: reqwest::Response) -> ByteStream {
    let status = response.status();
    if !status.is_success() {
        return Box::pin(stream! {
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| e.to_string());
            yield Err(StreamError::provider_error(status.as_u16(), message));
        });
    }

    Box::pin(
        response
            .bytes_stream()
            .map(|result| result.map_err(StreamError::from)),
    )
}

// ============================================================================
// 取消与超时
// ============================================================================

fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// 为上游拉取加上取消和超时保护
///
/// 终止性错误之后不再拉取上游。取消时以 [`StreamError::Cancelled`] 结束，
/// 适配器据此直接返回，不再冲刷解码器里半截的数据。
fn guard<T>(
    mut source: Pin<Box<dyn Stream<Item = Result<T, StreamError>> + Send>>,
    config: &StreamConfig,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = Result<T, StreamError>> + Send>>
where
    T: Send + 'static,
{
    let timeout = config.timeout_duration();
    let chunk_timeout = config.chunk_timeout_duration();

    Box::pin(stream! {
        let deadline = deadline_after(timeout);
        loop {
            if cancel.is_cancelled() {
                debug!("上游读取已取消");
                yield Err(StreamError::Cancelled);
                break;
            }

            let next_deadline = std::cmp::min(deadline, deadline_after(chunk_timeout));
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout_at(next_deadline, source.next()) => Some(result),
            };

            match next {
                None => {
                    debug!("上游读取已取消");
                    yield Err(StreamError::Cancelled);
                    break;
                }
                Some(Ok(Some(Ok(item)))) => yield Ok(item),
                Some(Ok(Some(Err(err)))) => {
                    let terminal = err.is_terminal();
                    yield Err(err);
                    if terminal {
                        break;
                    }
                }
                Some(Ok(None)) => break,
                Some(Err(_)) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        chunk_timeout_ms = chunk_timeout.as_millis() as u64,
                        "上游读取超时"
                    );
                    yield Err(StreamError::Timeout);
                    break;
                }
            }
        }
    })
}

// ============================================================================
// 各传输适配器
// ============================================================================

fn parse_json(text: &str) -> Result<Value, StreamError> {
    serde_json::from_str(text).map_err(|e| StreamError::decode(format!("JSON 解析错误: {}", e)))
}

fn sse_chunks(mut bytes: ByteStream, config: &StreamConfig, metrics: MetricsHandle) -> RawChunkStream {
    let sentinel = config.sse_sentinel.clone();
    let max_buffer_size = config.buffer_size;

    Box::pin(stream! {
        let mut decoder = SseDecoder::with_max_buffer_size(max_buffer_size);
        loop {
            let (frames, done) = match bytes.next().await {
                Some(Ok(chunk)) => {
                    metrics.lock().record_chunk(chunk.len());
                    (decoder.push(&chunk), false)
                }
                Some(Err(StreamError::Cancelled)) => return,
                Some(Err(err)) => (vec![Err(err)], true),
                None => (decoder.finish(), true),
            };

            for frame in frames {
                match frame {
                    Ok(event) => {
                        if event.data.trim() == sentinel {
                            debug!(sentinel = %sentinel, "收到流结束标记");
                            return;
                        }
                        let payload = parse_json(&event.data);
                        yield payload.map(|payload| RawChunk { event: event.event, payload });
                    }
                    Err(err) => {
                        let terminal = err.is_terminal();
                        yield Err(err);
                        if terminal {
                            return;
                        }
                    }
                }
            }

            if done {
                break;
            }
        }
    })
}

fn json_line_chunks(
    mut bytes: ByteStream,
    config: &StreamConfig,
    metrics: MetricsHandle,
) -> RawChunkStream {
    let max_buffer_size = config.buffer_size;

    Box::pin(stream! {
        let mut lines = LineBuffer::with_max_buffer_size(max_buffer_size);
        loop {
            let (batch, done) = match bytes.next().await {
                Some(Ok(chunk)) => {
                    metrics.lock().record_chunk(chunk.len());
                    match lines.push(&chunk) {
                        Ok(batch) => (batch, false),
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }
                Some(Err(StreamError::Cancelled)) => return,
                Some(Err(err)) => {
                    let terminal = err.is_terminal();
                    yield Err(err);
                    if terminal {
                        return;
                    }
                    continue;
                }
                None => (lines.finish().into_iter().collect(), true),
            };

            for line in batch {
                let parsed = decode_line(line).and_then(|text| {
                    let text = text.trim();
                    if text.is_empty() {
                        Ok(None)
                    } else {
                        parse_json(text).map(Some)
                    }
                });
                match parsed {
                    Ok(Some(payload)) => yield Ok(RawChunk::new(payload)),
                    Ok(None) => {}
                    Err(err) => yield Err(err),
                }
            }

            if done {
                break;
            }
        }
    })
}

fn object_chunks(mut values: ValueStream, metrics: MetricsHandle) -> RawChunkStream {
    Box::pin(stream! {
        while let Some(item) = values.next().await {
            if matches!(item, Err(StreamError::Cancelled)) {
                return;
            }
            if item.is_ok() {
                metrics.lock().record_chunk(0);
            }
            yield item.map(RawChunk::new);
        }
    })
}

fn frame_chunks(mut frames: ByteStream, metrics: MetricsHandle) -> RawChunkStream {
    Box::pin(stream! {
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    metrics.lock().record_chunk(frame.len());
                    let result = decode_frame_payload(&frame);
                    let terminal = matches!(&result, Err(err) if err.is_terminal());
                    yield result.map(RawChunk::new);
                    if terminal {
                        return;
                    }
                }
                Err(StreamError::Cancelled) => return,
                Err(err) => yield Err(err),
            }
        }
    })
}

fn event_stream_chunks(
    mut bytes: ByteStream,
    config: &StreamConfig,
    metrics: MetricsHandle,
) -> RawChunkStream {
    let max_buffer_size = config.buffer_size;

    Box::pin(stream! {
        let mut decoder = EventStreamDecoder::with_max_buffer_size(max_buffer_size);
        loop {
            let (results, done) = match bytes.next().await {
                Some(Ok(chunk)) => {
                    metrics.lock().record_chunk(chunk.len());
                    (decoder.process(&chunk), false)
                }
                Some(Err(StreamError::Cancelled)) => return,
                Some(Err(err)) => (vec![Err(err)], true),
                None => (decoder.finish(), true),
            };

            for result in results {
                let terminal = matches!(&result, Err(err) if err.is_terminal());
                yield result.map(RawChunk::new);
                if terminal {
                    return;
                }
            }

            if done {
                break;
            }
        }
    })
}

// ============================================================================
// 测试模块
// ============================================================================
