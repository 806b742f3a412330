//! 归一化管道
//!
//! 阶段顺序（全部是拉取驱动的）：
//!
//! ```text
//! ProviderTransport → RawChunk → Delta → StreamEvent（组装工具调用）
//!     → 工具阶段 → 回调阶段 → 线路编码 / 部分对象
//! ```
//!
//! 每条流恰好以一个 `Finish` 或一个终止性 `Error` 结束；被取消的流两者都没有。

use crate::streaming::assembler::ToolCallAssembler;
use crate::streaming::callbacks::{with_callbacks, StreamCallbacks};
use crate::streaming::data::StreamDataQueue;
use crate::streaming::error::StreamError;
use crate::streaming::event::{EventStream, FinishReason, StreamEvent, Usage};
use crate::streaming::id::{default_id_generator, SharedIdGenerator};
use crate::streaming::iterator::{ByteStream, ProviderTransport, RawChunkStream};
use crate::streaming::manager::StreamConfig;
use crate::streaming::metrics::{new_metrics_handle, MetricsHandle, StreamMetrics};
use crate::streaming::partial_json::{partial_object_stream, ObjectMode, PartialObjectStream};
use crate::streaming::provider::{Delta, ProviderFormat};
use crate::streaming::response::{wire_stream, StreamingTextResponse};
use crate::streaming::tools::{ToolCallHandler, ToolRegistry, ToolStage};
use crate::streaming::wire::WireProtocol;
use async_stream::stream;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 流式管道构建器
pub struct StreamPipeline {
    format: ProviderFormat,
    transport: ProviderTransport,
    config: StreamConfig,
    callbacks: StreamCallbacks,
    id_generator: SharedIdGenerator,
    tool_registry: Option<Arc<ToolRegistry>>,
    tool_handler: Option<Arc<dyn ToolCallHandler>>,
    data: Option<StreamDataQueue>,
    protocol: WireProtocol,
    cancel: CancellationToken,
    metrics: MetricsHandle,
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("format", &self.format)
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("protocol", &self.protocol)
            .field("stream_data", &self.data.is_some())
            .finish()
    }
}

impl StreamPipeline {
    pub fn new(format: ProviderFormat, transport: ProviderTransport) -> Self {
        Self {
            format,
            transport,
            config: StreamConfig::default(),
            callbacks: StreamCallbacks::default(),
            id_generator: default_id_generator(),
            tool_registry: None,
            tool_handler: None,
            data: None,
            protocol: WireProtocol::default(),
            cancel: CancellationToken::new(),
            metrics: new_metrics_handle(),
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_callbacks(mut self, callbacks: StreamCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_id_generator(mut self, id_generator: SharedIdGenerator) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.tool_registry = Some(Arc::new(registry));
        self
    }

    pub fn with_tool_handler<H>(mut self, handler: H) -> Self
    where
        H: ToolCallHandler + 'static,
    {
        self.tool_handler = Some(Arc::new(handler));
        self
    }

    /// 挂接旁路数据队列
    pub fn with_stream_data(mut self, data: StreamDataQueue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_protocol(mut self, protocol: WireProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// 使用外部的取消令牌
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 取消令牌，取消后上游不再被拉取
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 共享的指标句柄
    pub fn metrics(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    /// 归一化事件流（经过工具阶段和回调阶段）
    pub fn into_events(self) -> EventStream {
        let (events, _, _, _, _) = self.into_parts();
        events
    }

    /// 线路字节流
    pub fn into_wire_stream(self) -> ByteStream {
        let (events, protocol, data, cancel, metrics) = self.into_parts();
        wire_stream(events, protocol, data, cancel, metrics)
    }

    /// HTTP 流式响应
    pub fn into_response(self) -> StreamingTextResponse {
        let protocol = self.protocol;
        StreamingTextResponse::new(self.into_wire_stream(), protocol)
    }

    /// 部分对象快照流
    pub fn into_partial_objects(self, mode: ObjectMode) -> PartialObjectStream {
        partial_object_stream(self.into_events(), mode)
    }

    fn into_parts(
        self,
    ) -> (
        EventStream,
        WireProtocol,
        Option<StreamDataQueue>,
        CancellationToken,
        MetricsHandle,
    ) {
        let chunks = self
            .transport
            .into_raw_chunks(&self.config, self.cancel.clone(), self.metrics.clone());
        let assembler = ToolCallAssembler::new(self.id_generator);
        let events = normalize(
            self.format,
            chunks,
            assembler,
            self.cancel.clone(),
            self.metrics.clone(),
        );

        let tool_stage = ToolStage {
            registry: self.tool_registry,
            handler: self.tool_handler,
            validate: self.config.validate_tool_calls,
        };
        let events = with_callbacks(tool_stage.apply(events), self.callbacks);

        (events, self.protocol, self.data, self.cancel, self.metrics)
    }
}

// ============================================================================
// 归一化
// ============================================================================

/// 把原始 chunk 流归一化为事件流
///
/// - 单个 chunk 的解码错误作为非终止 `Error` 事件透出，流继续
/// - 终止性错误之后流结束，没有 `Finish`
/// - 自然结束时关闭仍可完成的工具调用，丢弃其余的，最后发出一个 `Finish`
/// - 取消时直接结束
pub fn normalize(
    format: ProviderFormat,
    mut chunks: RawChunkStream,
    mut assembler: ToolCallAssembler,
    cancel: CancellationToken,
    metrics: MetricsHandle,
) -> EventStream {
    Box::pin(stream! {
        let mut reason: Option<FinishReason> = None;
        let mut usage: Option<Usage> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let item = match chunks.next().await {
                Some(item) => item,
                None => break,
            };

            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let terminal = err.is_terminal();
                    if terminal {
                        error!(provider = ?format, error = %err, "流式传输终止");
                        finish_metrics(&metrics, format, |m| m.record_error());
                    } else {
                        warn!(provider = ?format, error = %err, "跳过无法解码的 chunk");
                        metrics.lock().record_decode_error();
                    }
                    yield StreamEvent::error(err);
                    if terminal {
                        return;
                    }
                    continue;
                }
            };

            match format.extract_delta(&chunk) {
                None => {}
                Some(Delta::Text(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    metrics.lock().record_text_delta();
                    yield StreamEvent::text(text);
                }
                Some(Delta::ToolCallFragments(fragments)) => {
                    for fragment in fragments {
                        for event in assembler.push(fragment) {
                            if matches!(event, StreamEvent::ToolCall(_)) {
                                metrics.lock().record_tool_call();
                            }
                            yield event;
                        }
                    }
                }
                Some(Delta::CompleteToolCalls(calls)) => {
                    for call in calls {
                        for event in assembler.push_complete(call) {
                            if matches!(event, StreamEvent::ToolCall(_)) {
                                metrics.lock().record_tool_call();
                            }
                            yield event;
                        }
                    }
                }
                Some(Delta::Finish { reason: finish_reason, usage: finish_usage }) => {
                    if finish_reason.is_some() {
                        reason = finish_reason;
                    }
                    merge_usage(&mut usage, finish_usage);
                }
                Some(Delta::Usage(chunk_usage)) => merge_usage(&mut usage, Some(chunk_usage)),
                Some(Delta::Error(message)) => {
                    let err = StreamError::upstream(message);
                    error!(provider = ?format, error = %err, "Provider 报告错误");
                    finish_metrics(&metrics, format, |m| m.record_error());
                    yield StreamEvent::error(err);
                    return;
                }
            }
        }

        if cancel.is_cancelled() {
            debug!(provider = ?format, "流已取消");
            finish_metrics(&metrics, format, |m| m.record_cancelled());
            return;
        }

        let (events, incomplete) = assembler.finish();
        for event in events {
            if matches!(event, StreamEvent::ToolCall(_)) {
                metrics.lock().record_tool_call();
            }
            yield event;
        }

        if !incomplete.is_empty() {
            for call in &incomplete {
                warn!(
                    provider = ?format,
                    index = call.index,
                    call_id = ?call.call_id,
                    tool_name = ?call.tool_name,
                    args = %call.args,
                    "丢弃未完成的工具调用"
                );
            }
            metrics.lock().record_dropped_tool_calls(incomplete.len() as u32);
        }

        let reason = reason.unwrap_or(if assembler.closed_count() > 0 {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        debug!(provider = ?format, reason = reason.as_str(), "流式传输完成");
        finish_metrics(&metrics, format, |_| {});

        yield StreamEvent::Finish { reason, usage };
    })
}

fn merge_usage(total: &mut Option<Usage>, usage: Option<Usage>) {
    let Some(usage) = usage else {
        return;
    };
    match total {
        Some(total) => total.merge(usage),
        None => *total = Some(usage),
    }
}

fn finish_metrics<F>(metrics: &MetricsHandle, format: ProviderFormat, record: F)
where
    F: FnOnce(&mut StreamMetrics),
{
    let mut metrics = metrics.lock();
    record(&mut metrics);
    metrics.finish();
    metrics.log_metrics(Some(format));
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::event::ToolCall;
    use crate::streaming::id::SequentialIdGenerator;
    use crate::streaming::metrics::StreamOutcome;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::{json, Value};

    fn sse(payloads: &[Value]) -> ProviderTransport {
        let mut body: Vec<Result<Bytes, StreamError>> = payloads
            .iter()
            .map(|p| Ok(Bytes::from(format!("data: {}\n\n", p))))
            .collect();
        body.push(Ok(Bytes::from("data: [DONE]\n\n")));
        ProviderTransport::sse(stream::iter(body))
    }

    fn openai_text(text: &str) -> Value {
        json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
    }

    fn openai_tool(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> Value {
        let mut function = json!({"arguments": args});
        if let Some(name) = name {
            function["name"] = json!(name);
        }
        let mut call = json!({"index": index, "function": function});
        if let Some(id) = id {
            call["id"] = json!(id);
        }
        json!({"choices": [{"delta": {"tool_calls": [call]}, "finish_reason": null}]})
    }

    #[tokio::test]
    async fn test_text_stream_ends_with_finish() {
        let events: Vec<StreamEvent> = StreamPipeline::new(
            ProviderFormat::OpenAi,
            sse(&[
                openai_text("Hello"),
                openai_text(" world"),
                json!({"choices": [{"delta": {}, "finish_reason": "length"}]}),
            ]),
        )
        .into_events()
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::text("Hello"),
                StreamEvent::text(" world"),
                StreamEvent::Finish {
                    reason: FinishReason::Length,
                    usage: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_calls_assemble_and_default_reason() {
        let pipeline = StreamPipeline::new(
            ProviderFormat::OpenAi,
            sse(&[
                openai_tool(0, None, Some("get_weather"), ""),
                openai_tool(1, Some("call_b"), Some("lookup"), "{\"q\":"),
                openai_tool(0, None, None, "{\"city\":\"Paris\"}"),
                openai_tool(1, None, None, "\"x\"}"),
            ]),
        )
        .with_id_generator(Arc::new(SequentialIdGenerator::new("gen_")));
        let metrics = pipeline.metrics();
        let events: Vec<StreamEvent> = pipeline.into_events().collect().await;

        let calls: Vec<&ToolCall> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "gen_0");
        assert_eq!(calls[0].args, "{\"city\":\"Paris\"}");
        assert_eq!(calls[1].call_id, "call_b");

        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finish { reason: FinishReason::ToolCalls, .. })
        ));
        assert_eq!(metrics.lock().tool_call_count, 2);
    }

    #[tokio::test]
    async fn test_gemini_calls_in_separate_chunks() {
        let gemini_call = |name: &str| -> Result<Value, StreamError> {
            Ok(json!({"candidates": [{"content": {"parts": [
                {"functionCall": {"name": name, "args": {}}}
            ]}}]}))
        };
        let pipeline = StreamPipeline::new(
            ProviderFormat::Gemini,
            ProviderTransport::objects(stream::iter(vec![gemini_call("a"), gemini_call("b")])),
        )
        .with_id_generator(Arc::new(SequentialIdGenerator::new("gen_")));
        let events: Vec<StreamEvent> = pipeline.into_events().collect().await;

        let calls: Vec<(&str, &str)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall(call) => Some((call.tool_name.as_str(), call.call_id.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec![("a", "gen_0"), ("b", "gen_1")]);
    }

    #[tokio::test]
    async fn test_incomplete_tool_call_is_dropped() {
        let pipeline = StreamPipeline::new(
            ProviderFormat::OpenAi,
            sse(&[openai_tool(0, Some("c"), Some("f"), "{\"a\":")]),
        );
        let metrics = pipeline.metrics();
        let events: Vec<StreamEvent> = pipeline.into_events().collect().await;

        assert!(!events.iter().any(|e| matches!(e, StreamEvent::ToolCall(_))));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finish { reason: FinishReason::Stop, .. })
        ));
        assert_eq!(metrics.lock().dropped_tool_call_count, 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_isolated() {
        let body: Vec<Result<Bytes, StreamError>> = vec![
            Ok(Bytes::from("data: {oops\n\n")),
            Ok(Bytes::from(format!("data: {}\n\n", openai_text("ok")))),
        ];
        let events: Vec<StreamEvent> =
            StreamPipeline::new(ProviderFormat::OpenAi, ProviderTransport::sse(stream::iter(body)))
                .into_events()
                .collect()
                .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Error { cause: StreamError::Decode(_) }));
        assert_eq!(events[1], StreamEvent::text("ok"));
        assert!(matches!(&events[2], StreamEvent::Finish { .. }));
    }

    #[tokio::test]
    async fn test_provider_error_terminates() {
        let events: Vec<StreamEvent> = StreamPipeline::new(
            ProviderFormat::OpenAi,
            sse(&[
                openai_text("a"),
                json!({"error": {"message": "overloaded"}}),
                openai_text("b"),
            ]),
        )
        .into_events()
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::text("a"),
                StreamEvent::error(StreamError::upstream("overloaded")),
            ]
        );
    }

    #[tokio::test]
    async fn test_usage_is_merged_into_finish() {
        let events: Vec<StreamEvent> = StreamPipeline::new(
            ProviderFormat::OpenAi,
            sse(&[
                openai_text("hi"),
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
                json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 1}}),
            ]),
        )
        .into_events()
        .collect()
        .await;

        assert_eq!(
            events.last(),
            Some(&StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: Some(Usage::new(Some(3), Some(1))),
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_stream_has_no_finish() {
        let body = stream::iter(vec![Ok(Bytes::from(format!(
            "data: {}\n\n",
            openai_text("first")
        )))])
        .chain(stream::pending());
        let pipeline = StreamPipeline::new(ProviderFormat::OpenAi, ProviderTransport::sse(body));
        let cancel = pipeline.cancellation_token();
        let metrics = pipeline.metrics();
        let mut events = pipeline.into_events();

        assert_eq!(events.next().await, Some(StreamEvent::text("first")));
        cancel.cancel();
        assert_eq!(events.next().await, None);
        assert_eq!(metrics.lock().outcome, StreamOutcome::Cancelled);
    }
}
