//! Provider 增量提取器
//!
//! 每种 Provider 的 chunk 形状不同（`choices[0].delta.content`、
//! `candidates[0].content.parts[0].text`、扁平的 `completion` 字段……），
//! 这里把单个原始 chunk 映射为零个或一个 [`Delta`]。
//!
//! 提取器是纯函数：不做 I/O，不跨调用保留状态，所有累积都在后续阶段完成。

use crate::streaming::event::{FinishReason, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// 原始 chunk
///
/// 传输层解码后的单个 Provider 数据单元，提取完成后即被丢弃。
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    /// SSE 事件名（如 `event: completion`），其他传输为空
    pub event: Option<String>,
    /// 已解码的 JSON 负载
    pub payload: Value,
}

impl RawChunk {
    pub fn new(payload: Value) -> Self {
        Self {
            event: None,
            payload,
        }
    }

    pub fn with_event(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: Some(event.into()),
            payload,
        }
    }
}

/// 工具调用分片
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// 从单个 chunk 提取出的增量
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// 用户可见的文本
    Text(String),
    /// 工具调用分片（OpenAI 单个 chunk 可能携带多个）
    ToolCallFragments(Vec<ToolCallFragment>),
    /// 一次给出的完整工具调用，`index` 不可靠，由组装器重新分配
    CompleteToolCalls(Vec<ToolCallFragment>),
    /// 结束信号
    Finish {
        reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
    /// 仅包含使用量
    Usage(Usage),
    /// Provider 在流中报告的错误
    Error(String),
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// `data: ...` 分帧的 SSE 字节流
    Sse,
    /// 换行分隔的 JSON 字节流
    JsonLines,
    /// 已解码的结构化对象序列
    Objects,
    /// 每项一个 JSON 负载的帧序列
    Frames,
    /// AWS Event Stream 二进制字节流
    AwsEventStream,
}

/// Provider 格式
///
/// 封闭的适配器集合，按标签选择提取逻辑。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderFormat {
    /// OpenAI Chat Completions（Azure OpenAI、Mistral 同格式）
    OpenAi,
    /// Anthropic 旧版 Completions
    AnthropicCompletion,
    /// Anthropic Messages
    AnthropicMessages,
    /// Google Gemini
    Gemini,
    /// Cohere
    Cohere,
    /// Hugging Face Text Generation Inference
    HuggingFace,
    /// AWS Bedrock 上的 Anthropic
    BedrockAnthropic,
    /// AWS Bedrock 上的 Cohere
    BedrockCohere,
    /// AWS Bedrock 上的 Llama 2
    BedrockLlama2,
}

impl ProviderFormat {
    /// 所有支持的格式
    pub const ALL: [ProviderFormat; 9] = [
        ProviderFormat::OpenAi,
        ProviderFormat::AnthropicCompletion,
        ProviderFormat::AnthropicMessages,
        ProviderFormat::Gemini,
        ProviderFormat::Cohere,
        ProviderFormat::HuggingFace,
        ProviderFormat::BedrockAnthropic,
        ProviderFormat::BedrockCohere,
        ProviderFormat::BedrockLlama2,
    ];

    /// 获取格式的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderFormat::OpenAi => "OpenAI",
            ProviderFormat::AnthropicCompletion => "Anthropic Completion",
            ProviderFormat::AnthropicMessages => "Anthropic Messages",
            ProviderFormat::Gemini => "Gemini",
            ProviderFormat::Cohere => "Cohere",
            ProviderFormat::HuggingFace => "Hugging Face",
            ProviderFormat::BedrockAnthropic => "Bedrock Anthropic",
            ProviderFormat::BedrockCohere => "Bedrock Cohere",
            ProviderFormat::BedrockLlama2 => "Bedrock Llama 2",
        }
    }

    /// 该 Provider 原生 HTTP 接口使用的传输类型
    pub fn default_transport(&self) -> TransportKind {
        match self {
            ProviderFormat::OpenAi
            | ProviderFormat::AnthropicCompletion
            | ProviderFormat::AnthropicMessages
            | ProviderFormat::Gemini
            | ProviderFormat::HuggingFace => TransportKind::Sse,
            ProviderFormat::Cohere => TransportKind::JsonLines,
            ProviderFormat::BedrockAnthropic
            | ProviderFormat::BedrockCohere
            | ProviderFormat::BedrockLlama2 => TransportKind::AwsEventStream,
        }
    }

    /// 从原始 chunk 中提取增量
    ///
    /// 不携带用户可见内容的 chunk（如仅有 role 的 delta）返回 `None`。
    pub fn extract_delta(&self, chunk: &RawChunk) -> Option<Delta> {
        match self {
            ProviderFormat::OpenAi => extract_openai(&chunk.payload),
            ProviderFormat::AnthropicCompletion => {
                extract_anthropic_completion(chunk.event.as_deref(), &chunk.payload)
            }
            ProviderFormat::AnthropicMessages => {
                extract_anthropic_messages(chunk.event.as_deref(), &chunk.payload)
            }
            ProviderFormat::Gemini => extract_gemini(&chunk.payload),
            ProviderFormat::Cohere => extract_cohere(&chunk.payload),
            ProviderFormat::HuggingFace => extract_huggingface(&chunk.payload),
            ProviderFormat::BedrockAnthropic => {
                flat_text_delta(&chunk.payload, "completion", "stop_reason")
            }
            ProviderFormat::BedrockCohere => extract_bedrock_cohere(&chunk.payload),
            ProviderFormat::BedrockLlama2 => {
                flat_text_delta(&chunk.payload, "generation", "stop_reason")
            }
        }
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// 工具调用片段的索引
///
/// 缺省为 0；超出 `u32` 范围时返回 `None`，该片段被丢弃。
fn fragment_index(value: Option<&Value>) -> Option<u32> {
    match value.and_then(Value::as_u64) {
        Some(index) => u32::try_from(index).ok(),
        None => Some(0),
    }
}

fn owned_str(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn finish_delta(reason: Option<&str>, usage: Option<Usage>) -> Delta {
    Delta::Finish {
        reason: reason.map(FinishReason::from_provider),
        usage,
    }
}

/// 扁平文本字段的提取（Bedrock Anthropic / Llama 2）
fn flat_text_delta(payload: &Value, text_field: &str, stop_field: &str) -> Option<Delta> {
    if let Some(text) = non_empty_str(payload.get(text_field)) {
        return Some(Delta::Text(text.to_string()));
    }
    non_empty_str(payload.get(stop_field)).map(|reason| finish_delta(Some(reason), None))
}

// ============================================================================
// 各 Provider 提取器
// ============================================================================

fn openai_usage(payload: &Value) -> Option<Usage> {
    let usage = payload.get("usage").filter(|u| u.is_object())?;
    Some(Usage::new(
        usage.get("prompt_tokens").and_then(Value::as_u64),
        usage.get("completion_tokens").and_then(Value::as_u64),
    ))
}

fn extract_openai(payload: &Value) -> Option<Delta> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        return Some(Delta::Error(error_message(error)));
    }

    if let Some(choice) = payload.get("choices").and_then(|c| c.get(0)) {
        let delta = choice.get("delta");

        if let Some(text) = non_empty_str(delta.and_then(|d| d.get("content"))) {
            return Some(Delta::Text(text.to_string()));
        }

        if let Some(calls) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(Value::as_array)
        {
            let fragments: Vec<ToolCallFragment> = calls
                .iter()
                .filter_map(|call| {
                    let Some(index) = fragment_index(call.get("index")) else {
                        warn!(index = ?call.get("index"), "工具调用索引超出范围，丢弃片段");
                        return None;
                    };
                    let function = call.get("function");
                    Some(ToolCallFragment {
                        index,
                        id: owned_str(call.get("id")),
                        name: owned_str(function.and_then(|f| f.get("name"))),
                        arguments: owned_str(function.and_then(|f| f.get("arguments"))),
                    })
                })
                .collect();
            if !fragments.is_empty() {
                return Some(Delta::ToolCallFragments(fragments));
            }
        }

        // 旧版 function_call 只会有一个调用
        if let Some(function_call) = delta.and_then(|d| d.get("function_call")) {
            return Some(Delta::ToolCallFragments(vec![ToolCallFragment {
                index: 0,
                id: None,
                name: owned_str(function_call.get("name")),
                arguments: owned_str(function_call.get("arguments")),
            }]));
        }

        if let Some(reason) = non_empty_str(choice.get("finish_reason")) {
            return Some(finish_delta(Some(reason), openai_usage(payload)));
        }
    }

    openai_usage(payload).map(Delta::Usage)
}

fn extract_anthropic_completion(event: Option<&str>, payload: &Value) -> Option<Delta> {
    if event == Some("error") || payload.get("type").and_then(Value::as_str) == Some("error") {
        let error = payload.get("error").unwrap_or(payload);
        return Some(Delta::Error(error_message(error)));
    }
    flat_text_delta(payload, "completion", "stop_reason")
}

fn extract_anthropic_messages(event: Option<&str>, payload: &Value) -> Option<Delta> {
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .or(event)
        .unwrap_or("");
    let index = fragment_index(payload.get("index"));

    match event_type {
        "content_block_start" => {
            let block = payload.get("content_block")?;
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => Some(Delta::ToolCallFragments(vec![ToolCallFragment {
                    index: index?,
                    id: owned_str(block.get("id")),
                    name: owned_str(block.get("name")),
                    arguments: None,
                }])),
                Some("text") => {
                    non_empty_str(block.get("text")).map(|t| Delta::Text(t.to_string()))
                }
                _ => None,
            }
        }
        "content_block_delta" => {
            let delta = payload.get("delta")?;
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    non_empty_str(delta.get("text")).map(|t| Delta::Text(t.to_string()))
                }
                Some("input_json_delta") => {
                    Some(Delta::ToolCallFragments(vec![ToolCallFragment {
                        index: index?,
                        id: None,
                        name: None,
                        arguments: owned_str(delta.get("partial_json")),
                    }]))
                }
                _ => None,
            }
        }
        "message_start" => {
            let usage = payload.get("message").and_then(|m| m.get("usage"))?;
            Some(Delta::Usage(Usage::new(
                usage.get("input_tokens").and_then(Value::as_u64),
                usage.get("output_tokens").and_then(Value::as_u64),
            )))
        }
        "message_delta" => {
            let reason = payload
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str);
            let usage = payload.get("usage").map(|u| {
                Usage::new(None, u.get("output_tokens").and_then(Value::as_u64))
            });
            Some(finish_delta(reason, usage))
        }
        "error" => {
            let error = payload.get("error").unwrap_or(payload);
            Some(Delta::Error(error_message(error)))
        }
        _ => None,
    }
}

fn extract_gemini(payload: &Value) -> Option<Delta> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        return Some(Delta::Error(error_message(error)));
    }

    let candidate = payload.get("candidates").and_then(|c| c.get(0));
    let parts = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);

    if let Some(parts) = parts {
        if let Some(text) = parts.iter().find_map(|p| non_empty_str(p.get("text"))) {
            return Some(Delta::Text(text.to_string()));
        }

        // Gemini 一次给出完整的函数调用参数
        let fragments: Vec<ToolCallFragment> = parts
            .iter()
            .filter_map(|p| p.get("functionCall"))
            .map(|call| ToolCallFragment {
                index: 0,
                id: None,
                name: owned_str(call.get("name")),
                arguments: Some(
                    call.get("args")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                ),
            })
            .collect();
        if !fragments.is_empty() {
            return Some(Delta::CompleteToolCalls(fragments));
        }
    }

    let usage = payload.get("usageMetadata").map(|u| {
        Usage::new(
            u.get("promptTokenCount").and_then(Value::as_u64),
            u.get("candidatesTokenCount").and_then(Value::as_u64),
        )
    });

    if let Some(reason) = non_empty_str(candidate.and_then(|c| c.get("finishReason"))) {
        return Some(finish_delta(Some(reason), usage));
    }
    usage.map(Delta::Usage)
}

fn extract_cohere(payload: &Value) -> Option<Delta> {
    if payload.get("is_finished").and_then(Value::as_bool) == Some(true) {
        let reason = payload.get("finish_reason").and_then(Value::as_str);
        return Some(finish_delta(Some(reason.unwrap_or("COMPLETE")), None));
    }
    non_empty_str(payload.get("text")).map(|t| Delta::Text(t.to_string()))
}

fn extract_huggingface(payload: &Value) -> Option<Delta> {
    if let Some(error) = non_empty_str(payload.get("error")) {
        return Some(Delta::Error(error.to_string()));
    }

    let token = payload.get("token");
    let special = token
        .and_then(|t| t.get("special"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !special {
        if let Some(text) = non_empty_str(token.and_then(|t| t.get("text"))) {
            return Some(Delta::Text(text.to_string()));
        }
    }

    let details = payload.get("details").filter(|d| !d.is_null())?;
    let usage = details
        .get("generated_tokens")
        .and_then(Value::as_u64)
        .map(|n| Usage::new(None, Some(n)));
    Some(finish_delta(
        details.get("finish_reason").and_then(Value::as_str),
        usage,
    ))
}

fn extract_bedrock_cohere(payload: &Value) -> Option<Delta> {
    let generation = payload.get("generations").and_then(|g| g.get(0));
    if let Some(text) = non_empty_str(generation.and_then(|g| g.get("text"))) {
        return Some(Delta::Text(text.to_string()));
    }
    let reason = generation
        .and_then(|g| g.get("finish_reason"))
        .or_else(|| payload.get("finish_reason"));
    non_empty_str(reason).map(|r| finish_delta(Some(r), None))
}

// ============================================================================
// 测试模块
// ============================================================================
