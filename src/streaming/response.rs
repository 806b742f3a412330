//! 流式 HTTP 响应
//!
//! 把事件流编码为线路字节流，并在其中复用旁路数据队列：
//! 新到达的数据在下一行事件之前以一行 `2:` 输出；主序列结束后关闭队列，
//! 再刷出剩余的数据。
//!
//! 终止性错误：有数据队列时把错误对象追加到最后一行 `2:` 中，然后结束；
//! 没有数据队列时响应体以错误结束（连接被中断）。
//! 被取消的流直接结束，不关闭队列，也不再刷出数据。

use crate::streaming::data::StreamDataQueue;
use crate::streaming::event::{EventStream, StreamEvent};
use crate::streaming::iterator::ByteStream;
use crate::streaming::metrics::MetricsHandle;
use crate::streaming::wire::{format_stream_part, WirePart, WireProtocol, CONTENT_TYPE, STREAM_DATA_HEADER};
use async_stream::stream;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 把待刷出的数据编码为一行 `2:`
fn flush_data(data: &StreamDataQueue, metrics: &MetricsHandle, out: &mut String) {
    let pending = data.take_pending();
    if pending.is_empty() {
        return;
    }
    metrics.lock().record_data_part();
    out.push_str(&format_stream_part(&WirePart::Data(pending)));
}

fn record_cancelled(metrics: &MetricsHandle) {
    let mut metrics = metrics.lock();
    if !metrics.is_closed() {
        metrics.record_cancelled();
        metrics.log_metrics(None);
    }
}

/// 把事件流编码为线路字节流
///
/// 每一项都由完整的行组成。文本协议下忽略数据队列。
pub fn wire_stream(
    mut events: EventStream,
    protocol: WireProtocol,
    data: Option<StreamDataQueue>,
    cancel: CancellationToken,
    metrics: MetricsHandle,
) -> ByteStream {
    let data = data.filter(|_| protocol.supports_stream_data());

    Box::pin(stream! {
        loop {
            if cancel.is_cancelled() {
                debug!("线路输出已取消");
                record_cancelled(&metrics);
                return;
            }
            let event = match events.next().await {
                Some(event) => event,
                None if cancel.is_cancelled() => {
                    debug!("线路输出已取消");
                    record_cancelled(&metrics);
                    return;
                }
                None => break,
            };
            if cancel.is_cancelled() {
                debug!("线路输出已取消");
                record_cancelled(&metrics);
                return;
            }

            let terminal_error = matches!(&event, StreamEvent::Error { cause } if cause.is_terminal());
            let mut out = String::new();
            if let Some(data) = data.as_ref().filter(|_| !terminal_error) {
                flush_data(data, &metrics, &mut out);
            }

            match &event {
                StreamEvent::Error { cause } if cause.is_terminal() => {
                    match &data {
                        Some(data) => {
                            data.close();
                            let mut pending = data.take_pending();
                            pending.push(cause.to_data_value());
                            metrics.lock().record_data_part();
                            out.push_str(&format_stream_part(&WirePart::Data(pending)));
                            yield Ok(Bytes::from(out));
                        }
                        None => {
                            if !out.is_empty() {
                                yield Ok(Bytes::from(out));
                            }
                            yield Err(cause.clone());
                        }
                    }
                    return;
                }
                StreamEvent::Error { cause } => {
                    warn!(error = %cause, "非终止错误不写入响应体");
                }
                StreamEvent::Finish { .. } => {
                    if !out.is_empty() {
                        yield Ok(Bytes::from(out));
                    }
                    break;
                }
                other => {
                    if let Some(line) = protocol.encode_event(other) {
                        out.push_str(&line);
                    }
                }
            }

            if !out.is_empty() {
                yield Ok(Bytes::from(out));
            }
        }

        if let Some(data) = &data {
            data.close();
            let mut out = String::new();
            flush_data(data, &metrics, &mut out);
            if !out.is_empty() {
                yield Ok(Bytes::from(out));
            }
        }
    })
}

/// 流式文本响应
///
/// 状态码 200，`Content-Type: text/plain; charset=utf-8`；
/// 数据协议额外带上 `X-Experimental-Stream-Data: true`。
pub struct StreamingTextResponse {
    body: ByteStream,
    status: StatusCode,
    headers: HeaderMap,
}

impl std::fmt::Debug for StreamingTextResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTextResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

impl StreamingTextResponse {
    pub fn new(body: ByteStream, protocol: WireProtocol) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if protocol.supports_stream_data() {
            headers.insert(
                HeaderName::from_static(STREAM_DATA_HEADER),
                HeaderValue::from_static("true"),
            );
        }
        Self {
            body,
            status: StatusCode::OK,
            headers,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// 追加或覆盖一个响应头
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// 取出响应体字节流
    pub fn into_body_stream(self) -> ByteStream {
        self.body
    }
}

impl IntoResponse for StreamingTextResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

// ============================================================================
// 测试模块
// ============================================================================
