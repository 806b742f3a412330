//! 工具调用增量组装器
//!
//! 按分片索引维护状态机 `absent → open → closed`：
//! - 首个分片创建条目，记录 id / name，发出 `ToolCallDelta`
//! - 后续分片追加参数文本，只发出本次新增的部分
//! - 每次追加后检查：名称已知且累积参数是合法 JSON 时关闭条目，发出唯一的 `ToolCall`
//!
//! 已关闭索引的后续分片被忽略。

use crate::streaming::event::{StreamEvent, ToolCall, ToolCallDelta};
use crate::streaming::id::{default_id_generator, SharedIdGenerator};
use crate::streaming::provider::ToolCallFragment;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 工具调用累积条目
#[derive(Debug, Clone, Default)]
struct ToolCallEntry {
    id: Option<String>,
    name: Option<String>,
    args: String,
    closed: bool,
}

/// 流结束时仍未完成的工具调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteToolCall {
    pub index: u32,
    pub call_id: Option<String>,
    pub tool_name: Option<String>,
    pub args: String,
}

/// 工具调用组装器
#[derive(Debug)]
pub struct ToolCallAssembler {
    entries: BTreeMap<u32, ToolCallEntry>,
    id_generator: SharedIdGenerator,
    closed_count: usize,
}

impl Default for ToolCallAssembler {
    fn default() -> Self {
        Self::new(default_id_generator())
    }
}

impl ToolCallAssembler {
    pub fn new(id_generator: SharedIdGenerator) -> Self {
        Self {
            entries: BTreeMap::new(),
            id_generator,
            closed_count: 0,
        }
    }

    /// 已关闭的调用数量
    pub fn closed_count(&self) -> usize {
        self.closed_count
    }

    /// 仍在累积的调用数量
    pub fn open_count(&self) -> usize {
        self.entries.values().filter(|e| !e.closed).count()
    }

    /// 处理一个分片
    pub fn push(&mut self, fragment: ToolCallFragment) -> Vec<StreamEvent> {
        let index = fragment.index;
        let fragment_args = fragment.arguments.unwrap_or_default();
        let is_new = !self.entries.contains_key(&index);
        let entry = self.entries.entry(index).or_default();

        if entry.closed {
            warn!(index, "忽略已完成工具调用的后续分片");
            return Vec::new();
        }

        if entry.id.is_none() {
            entry.id = fragment.id;
        }
        if entry.name.is_none() {
            entry.name = fragment.name.filter(|n| !n.is_empty());
        }
        entry.args.push_str(&fragment_args);

        let mut events = Vec::new();
        if is_new || !fragment_args.is_empty() {
            events.push(StreamEvent::ToolCallDelta(ToolCallDelta {
                call_id: entry.id.clone(),
                tool_name: entry.name.clone(),
                args_fragment: fragment_args,
                index,
            }));
        }

        if let Some(call) = self.try_close(index) {
            events.push(StreamEvent::ToolCall(call));
        }
        events
    }

    /// 处理一个完整给出的调用
    ///
    /// 分配一个尚未使用过的索引，不会落到已关闭的条目上。
    pub fn push_complete(&mut self, mut fragment: ToolCallFragment) -> Vec<StreamEvent> {
        fragment.index = self
            .entries
            .keys()
            .next_back()
            .map_or(0, |last| last.saturating_add(1));
        self.push(fragment)
    }

    /// 流结束
    ///
    /// 名称已知但从未收到参数的调用按空对象 `{}` 关闭；
    /// 其余未完成的调用被丢弃并返回，供调用方记录诊断。
    pub fn finish(&mut self) -> (Vec<StreamEvent>, Vec<IncompleteToolCall>) {
        let mut events = Vec::new();
        let mut incomplete = Vec::new();

        let open: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.closed)
            .map(|(index, _)| *index)
            .collect();

        for index in open {
            let Some(entry) = self.entries.get_mut(&index) else {
                continue;
            };

            if entry.name.is_some() && entry.args.trim().is_empty() {
                entry.args.push_str("{}");
                events.push(StreamEvent::ToolCallDelta(ToolCallDelta {
                    call_id: entry.id.clone(),
                    tool_name: entry.name.clone(),
                    args_fragment: "{}".to_string(),
                    index,
                }));
                if let Some(call) = self.try_close(index) {
                    events.push(StreamEvent::ToolCall(call));
                }
                continue;
            }

            incomplete.push(IncompleteToolCall {
                index,
                call_id: entry.id.clone(),
                tool_name: entry.name.clone(),
                args: entry.args.clone(),
            });
        }

        self.entries.clear();
        (events, incomplete)
    }

    fn try_close(&mut self, index: u32) -> Option<ToolCall> {
        let entry = self.entries.get_mut(&index)?;
        let name = entry.name.clone()?;
        if serde_json::from_str::<Value>(&entry.args).is_err() {
            return None;
        }

        let call_id = match &entry.id {
            Some(id) => id.clone(),
            None => {
                let id = self.id_generator.next_id();
                entry.id = Some(id.clone());
                id
            }
        };
        entry.closed = true;
        self.closed_count += 1;

        debug!(index, call_id = %call_id, tool_name = %name, "工具调用组装完成");

        Some(ToolCall {
            call_id,
            tool_name: name,
            args: entry.args.clone(),
        })
    }
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::id::SequentialIdGenerator;
    use std::sync::Arc;

    fn assembler() -> ToolCallAssembler {
        ToolCallAssembler::new(Arc::new(SequentialIdGenerator::new("call_")))
    }

    fn fragment(index: u32, name: Option<&str>, args: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            index,
            id: None,
            name: name.map(str::to_string),
            arguments: args.map(str::to_string),
        }
    }

    fn tool_calls(events: &[StreamEvent]) -> Vec<ToolCall> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_name_then_arguments() {
        let mut assembler = assembler();

        let events = assembler.push(fragment(0, Some("f"), None));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::ToolCallDelta(d) if d.tool_name.as_deref() == Some("f")));

        let events = assembler.push(fragment(0, None, Some("{}")));
        let calls = tool_calls(&events);
        assert_eq!(
            calls,
            vec![ToolCall {
                call_id: "call_0".to_string(),
                tool_name: "f".to_string(),
                args: "{}".to_string(),
            }]
        );
        assert_eq!(assembler.closed_count(), 1);
    }

    #[test]
    fn test_complete_in_first_fragment() {
        let mut assembler = assembler();
        let events = assembler.push(ToolCallFragment {
            index: 0,
            id: Some("toolu_1".to_string()),
            name: Some("lookup".to_string()),
            arguments: Some("{\"city\":\"Paris\"}".to_string()),
        });
        let calls = tool_calls(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "toolu_1");
    }

    #[test]
    fn test_incremental_deltas_only_carry_new_text() {
        let mut assembler = assembler();
        assembler.push(fragment(0, Some("f"), Some("{\"a\"")));
        let events = assembler.push(fragment(0, None, Some(":1")));
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallDelta(d) if d.args_fragment == ":1"
        ));
        assert!(tool_calls(&events).is_empty());

        let events = assembler.push(fragment(0, None, Some("}")));
        assert_eq!(tool_calls(&events)[0].args, "{\"a\":1}");
    }

    #[test]
    fn test_args_without_name_stay_open() {
        let mut assembler = assembler();
        let events = assembler.push(fragment(0, None, Some("{}")));
        assert!(tool_calls(&events).is_empty());

        let events = assembler.push(fragment(0, Some("late"), None));
        assert_eq!(tool_calls(&events)[0].tool_name, "late");
    }

    #[test]
    fn test_fragments_after_close_are_ignored() {
        let mut assembler = assembler();
        assembler.push(fragment(0, Some("f"), Some("{}")));
        let events = assembler.push(fragment(0, None, Some("extra")));
        assert!(events.is_empty());
        assert_eq!(assembler.closed_count(), 1);
    }

    #[test]
    fn test_complete_calls_get_fresh_indices() {
        let mut assembler = assembler();
        let first = assembler.push_complete(fragment(0, Some("a"), Some("{}")));
        let second = assembler.push_complete(fragment(0, Some("b"), Some("{\"k\":1}")));

        assert_eq!(tool_calls(&first)[0].tool_name, "a");
        assert_eq!(tool_calls(&second)[0].tool_name, "b");
        assert!(matches!(&second[0], StreamEvent::ToolCallDelta(d) if d.index == 1));
        assert_eq!(assembler.closed_count(), 2);
    }

    #[test]
    fn test_interleaved_indices_close_independently() {
        let mut assembler = assembler();
        assembler.push(fragment(0, Some("a"), Some("{\"x\":")));
        assembler.push(fragment(1, Some("b"), Some("{\"y\":")));
        assert_eq!(assembler.open_count(), 2);

        let events = assembler.push(fragment(1, None, Some("2}")));
        assert_eq!(tool_calls(&events)[0].tool_name, "b");
        let events = assembler.push(fragment(0, None, Some("1}")));
        assert_eq!(tool_calls(&events)[0].tool_name, "a");
        assert_eq!(assembler.open_count(), 0);
    }

    #[test]
    fn test_finish_drops_unresolvable_calls() {
        let mut assembler = assembler();
        assembler.push(fragment(0, Some("f"), Some("{\"a\":")));
        let (events, incomplete) = assembler.finish();
        assert!(events.is_empty());
        assert_eq!(
            incomplete,
            vec![IncompleteToolCall {
                index: 0,
                call_id: None,
                tool_name: Some("f".to_string()),
                args: "{\"a\":".to_string(),
            }]
        );
    }

    #[test]
    fn test_finish_closes_calls_without_arguments() {
        let mut assembler = assembler();
        assembler.push(fragment(0, Some("ping"), None));
        let (events, incomplete) = assembler.finish();
        assert!(incomplete.is_empty());
        let calls = tool_calls(&events);
        assert_eq!(calls[0].args, "{}");
    }
}

// ============================================================================
// 属性测试（Property-Based Testing）
// ============================================================================
