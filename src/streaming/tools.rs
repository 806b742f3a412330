//! 工具注册表与工具调用处理
//!
//! 组装器只保证参数是合法 JSON。注册表在其之后校验：
//! - 工具必须已注册，否则报告 [`ToolError::NoSuchTool`]
//! - 参数必须是 JSON 对象，包含 `required` 中的所有键，
//!   且已声明属性的 JSON 类型一致，否则报告 [`ToolError::InvalidToolArguments`]
//!
//! 可选的 [`ToolCallHandler`] 可把完整的调用替换为文本输出。

use crate::streaming::error::StreamError;
use crate::streaming::event::{EventStream, StreamEvent, ToolCall};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// 工具错误
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[serde(tag = "type", content = "details")]
pub enum ToolError {
    /// 调用了未注册的工具
    #[error("调用了未知工具 '{tool_name}'，可用工具: [{}]", .available.join(", "))]
    NoSuchTool {
        tool_name: String,
        available: Vec<String>,
    },

    /// 参数不满足工具的参数定义
    #[error("工具 '{tool_name}' 的参数无效: {cause} (参数: {tool_args})")]
    InvalidToolArguments {
        tool_name: String,
        tool_args: String,
        cause: String,
    },

    /// 处理器执行失败
    #[error("工具 '{tool_name}' 执行失败: {message}")]
    Execution { tool_name: String, message: String },
}

impl ToolError {
    /// 出错的工具名称
    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::NoSuchTool { tool_name, .. }
            | ToolError::InvalidToolArguments { tool_name, .. }
            | ToolError::Execution { tool_name, .. } => tool_name,
        }
    }
}

/// 工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema 形式的参数定义
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// 校验参数对象
    fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        let required = self
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for key in required {
            if !args.contains_key(key) {
                return Err(format!("缺少必需参数 '{}'", key));
            }
        }

        let properties = match self.parameters.get("properties").and_then(Value::as_object) {
            Some(properties) => properties,
            None => return Ok(()),
        };

        for (key, value) in args {
            let Some(schema_type) = properties.get(key).and_then(|p| p.get("type")) else {
                continue;
            };
            if !type_matches(schema_type, value) {
                return Err(format!("参数 '{}' 的类型应为 {}", key, schema_type));
            }
        }
        Ok(())
    }
}

fn type_matches(schema_type: &Value, value: &Value) -> bool {
    match schema_type {
        Value::String(name) => json_type_is(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| json_type_is(name, value)),
        _ => true,
    }
}

fn json_type_is(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// 解析并校验后的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
}

impl ParsedToolCall {
    /// 不经注册表校验直接解析参数
    pub fn from_call(call: &ToolCall) -> Result<Self, ToolError> {
        let args = serde_json::from_str(&call.args).map_err(|e| ToolError::InvalidToolArguments {
            tool_name: call.tool_name.clone(),
            tool_args: call.args.clone(),
            cause: e.to_string(),
        })?;
        Ok(Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            args,
        })
    }
}

/// 工具注册表
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具，同名工具被替换
    pub fn register(&mut self, tool: ToolDefinition) {
        match self.tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按注册表校验一个完整的工具调用
    pub fn parse_tool_call(&self, call: &ToolCall) -> Result<ParsedToolCall, ToolError> {
        let tool = self.get(&call.tool_name).ok_or_else(|| ToolError::NoSuchTool {
            tool_name: call.tool_name.clone(),
            available: self.names(),
        })?;

        let parsed = ParsedToolCall::from_call(call)?;
        let invalid = |cause: String| ToolError::InvalidToolArguments {
            tool_name: call.tool_name.clone(),
            tool_args: call.args.clone(),
            cause,
        };

        let args = parsed
            .args
            .as_object()
            .ok_or_else(|| invalid("参数必须是 JSON 对象".to_string()))?;
        tool.validate(args).map_err(invalid)?;

        Ok(parsed)
    }
}

/// 工具调用处理器
///
/// 返回 `Some(text)` 时用文本替换该调用，返回 `None` 时原样输出调用。
#[async_trait]
pub trait ToolCallHandler: Send + Sync {
    async fn handle(&self, call: &ParsedToolCall) -> Result<Option<String>, ToolError>;
}

// ============================================================================
// 工具阶段
// ============================================================================

/// 工具阶段配置
#[derive(Clone, Default)]
pub struct ToolStage {
    pub registry: Option<Arc<ToolRegistry>>,
    pub handler: Option<Arc<dyn ToolCallHandler>>,
    /// 是否按注册表校验
    pub validate: bool,
}

impl std::fmt::Debug for ToolStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolStage")
            .field("registry", &self.registry)
            .field("handler", &self.handler.is_some())
            .field("validate", &self.validate)
            .finish()
    }
}

impl ToolStage {
    /// 没有注册表也没有处理器时，事件原样通过
    pub fn is_passthrough(&self) -> bool {
        self.handler.is_none() && (self.registry.is_none() || !self.validate)
    }

    async fn process(&self, call: ToolCall) -> StreamEvent {
        let parsed = match (&self.registry, self.validate) {
            (Some(registry), true) => registry.parse_tool_call(&call),
            _ => ParsedToolCall::from_call(&call),
        };

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(call_id = %call.call_id, tool_name = %call.tool_name, error = %err, "工具调用校验失败");
                return StreamEvent::error(StreamError::Tool(err));
            }
        };

        let Some(handler) = &self.handler else {
            return StreamEvent::ToolCall(call);
        };

        match handler.handle(&parsed).await {
            Ok(Some(text)) => {
                debug!(call_id = %call.call_id, tool_name = %call.tool_name, "工具调用已由处理器替换为文本");
                StreamEvent::text(text)
            }
            Ok(None) => StreamEvent::ToolCall(call),
            Err(err) => {
                warn!(call_id = %call.call_id, tool_name = %call.tool_name, error = %err, "工具调用处理失败");
                StreamEvent::error(StreamError::Tool(err))
            }
        }
    }

    /// 应用到事件流
    ///
    /// 校验失败的调用不再输出，替换为一个非终止的 `Error` 事件。
    pub fn apply(self, mut events: EventStream) -> EventStream {
        if self.is_passthrough() {
            return events;
        }

        Box::pin(stream! {
            while let Some(event) = events.next().await {
                let event = match event {
                    StreamEvent::ToolCall(call) => self.process(call).await,
                    other => other,
                };
                yield event;
            }
        })
    }
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    fn weather_registry() -> ToolRegistry {
        ToolRegistry::new().with_tool(
            ToolDefinition::new("get_weather")
                .with_description("查询天气")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "city": { "type": "string" },
                        "days": { "type": "integer" }
                    },
                    "required": ["city"]
                })),
        )
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall {
            call_id: "call_1".into(),
            tool_name: name.into(),
            args: args.into(),
        }
    }

    #[test]
    fn test_parse_valid_call() {
        let parsed = weather_registry()
            .parse_tool_call(&call("get_weather", "{\"city\":\"Paris\",\"days\":3}"))
            .unwrap();
        assert_eq!(parsed.args, json!({"city": "Paris", "days": 3}));
        assert_eq!(parsed.call_id, "call_1");
    }

    #[test]
    fn test_unknown_tool() {
        let err = weather_registry()
            .parse_tool_call(&call("search", "{}"))
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::NoSuchTool {
                tool_name: "search".into(),
                available: vec!["get_weather".into()],
            }
        );
        assert!(err.to_string().contains("search"));
    }

    #[test]
    fn test_invalid_arguments() {
        let registry = weather_registry();

        let err = registry
            .parse_tool_call(&call("get_weather", "{\"days\":1}"))
            .unwrap_err();
        assert!(matches!(
            &err,
            ToolError::InvalidToolArguments { tool_args, .. } if tool_args == "{\"days\":1}"
        ));

        let err = registry
            .parse_tool_call(&call("get_weather", "{\"city\":\"Paris\",\"days\":\"3\"}"))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidToolArguments { .. }));

        let err = registry
            .parse_tool_call(&call("get_weather", "[1]"))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidToolArguments { .. }));
        assert_eq!(err.tool_name(), "get_weather");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = weather_registry();
        registry.register(ToolDefinition::new("get_weather"));
        assert_eq!(registry.len(), 1);
        assert!(registry
            .parse_tool_call(&call("get_weather", "{}"))
            .is_ok());
    }

    struct EchoHandler;

    #[async_trait]
    impl ToolCallHandler for EchoHandler {
        async fn handle(&self, call: &ParsedToolCall) -> Result<Option<String>, ToolError> {
            match call.args.get("city").and_then(Value::as_str) {
                Some("Paris") => Ok(Some("晴".to_string())),
                Some(_) => Ok(None),
                None => Err(ToolError::Execution {
                    tool_name: call.tool_name.clone(),
                    message: "no city".into(),
                }),
            }
        }
    }

    async fn run(stage: ToolStage, input: Vec<StreamEvent>) -> Vec<StreamEvent> {
        stage.apply(Box::pin(stream::iter(input))).collect().await
    }

    #[tokio::test]
    async fn test_stage_reports_unknown_tool() {
        let stage = ToolStage {
            registry: Some(Arc::new(weather_registry())),
            handler: None,
            validate: true,
        };
        let events = run(
            stage,
            vec![
                StreamEvent::ToolCall(call("search", "{}")),
                StreamEvent::ToolCall(call("get_weather", "{\"city\":\"Oslo\"}")),
            ],
        )
        .await;

        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Error { cause } => {
                assert!(matches!(cause, StreamError::Tool(ToolError::NoSuchTool { .. })));
                assert!(!cause.is_terminal());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(&events[1], StreamEvent::ToolCall(c) if c.tool_name == "get_weather"));
    }

    #[tokio::test]
    async fn test_stage_handler_replaces_call() {
        let stage = ToolStage {
            registry: None,
            handler: Some(Arc::new(EchoHandler)),
            validate: true,
        };
        let events = run(
            stage,
            vec![
                StreamEvent::ToolCall(call("get_weather", "{\"city\":\"Paris\"}")),
                StreamEvent::ToolCall(call("get_weather", "{\"city\":\"Oslo\"}")),
                StreamEvent::ToolCall(call("get_weather", "{}")),
            ],
        )
        .await;

        assert_eq!(events[0], StreamEvent::text("晴"));
        assert!(matches!(&events[1], StreamEvent::ToolCall(_)));
        assert!(matches!(
            &events[2],
            StreamEvent::Error { cause: StreamError::Tool(ToolError::Execution { .. }) }
        ));
    }

    #[tokio::test]
    async fn test_passthrough_without_registry_or_handler() {
        let stage = ToolStage::default();
        assert!(stage.is_passthrough());
        let events = run(stage, vec![StreamEvent::ToolCall(call("anything", "{}"))]).await;
        assert!(matches!(&events[0], StreamEvent::ToolCall(_)));
    }
}
