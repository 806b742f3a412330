//! 流式归一化核心模块
//!
//! 把互不兼容的 LLM Provider 增量输出（各自的 chunk 编码、SSE 分帧、二进制事件格式）
//! 归一化为统一的事件流，再编码为一种按行分隔的线路协议。
//!
//! # 主要组件
//!
//! - `provider`: 各 Provider 的增量提取器
//! - `iterator`: 把原生传输适配为原始 chunk 序列（`sse` / `lines` / `frames` 负责解码）
//! - `assembler`: 工具调用分片组装
//! - `partial_json`: 部分 JSON 重建
//! - `tools`: 工具注册表与处理器
//! - `callbacks`: 生命周期回调
//! - `wire`: 线路协议编解码
//! - `data`: 旁路数据队列
//! - `response`: 流式 HTTP 响应
//! - `pipeline`: 把以上阶段串成管道
//! - `manager`: 流式配置与管理器

pub mod assembler;
pub mod callbacks;
pub mod data;
pub mod error;
pub mod event;
pub mod frames;
pub mod id;
pub mod iterator;
pub mod lines;
pub mod manager;
pub mod metrics;
pub mod partial_json;
pub mod pipeline;
pub mod provider;
pub mod response;
pub mod sse;
pub mod tee;
pub mod tools;
pub mod wire;

// 重新导出核心类型
pub use assembler::{IncompleteToolCall, ToolCallAssembler};
pub use callbacks::{with_callbacks, CallbackStream, StreamCallbacks};
pub use data::StreamDataQueue;
pub use error::StreamError;
pub use event::{EventStream, FinishReason, StreamEvent, ToolCall, ToolCallDelta, Usage};
pub use frames::{decode_frame_payload, EventStreamDecoder};
pub use id::{
    default_id_generator, IdGenerator, SequentialIdGenerator, SharedIdGenerator, UuidIdGenerator,
};
pub use iterator::{
    reqwest_stream_to_byte_stream, ByteStream, ProviderTransport, RawChunkStream, ValueStream,
};
pub use manager::{collect_stream_content, StreamConfig, StreamManager};
pub use metrics::{new_metrics_handle, MetricsHandle, StreamMetrics, StreamOutcome};
pub use partial_json::{
    parse_partial_json, partial_object_stream, ObjectMode, PartialObjectReconstructor,
    PartialObjectStream,
};
pub use pipeline::{normalize, StreamPipeline};
pub use provider::{Delta, ProviderFormat, RawChunk, ToolCallFragment, TransportKind};
pub use response::{wire_stream, StreamingTextResponse};
pub use sse::{SseDecoder, SseEvent};
pub use tee::{tee, TeeHalf};
pub use tools::{
    ParsedToolCall, ToolCallHandler, ToolDefinition, ToolError, ToolRegistry, ToolStage,
};
pub use wire::{
    decode_wire_stream, format_stream_part, parse_stream_part, FunctionCall, StreamPartCode,
    WireDecoder, WireError, WirePart, WireProtocol,
};
