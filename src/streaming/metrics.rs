//! 流式指标
//!
//! 管道各阶段共享一个 [`MetricsHandle`]，分别记录传输层（chunk、字节、TTFB）、
//! 解码层（隔离的解码错误）和事件层（文本、工具调用、数据行）的计数。
//! 流到达终态时写入结束时间并输出一条汇总日志。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::streaming::provider::ProviderFormat;

/// 共享的指标句柄
pub type MetricsHandle = Arc<Mutex<StreamMetrics>>;

pub fn new_metrics_handle() -> MetricsHandle {
    Arc::new(Mutex::new(StreamMetrics::new()))
}

/// 流的终态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// 仍在传输
    #[default]
    Open,
    /// 以 `Finish` 结束
    Finished,
    /// 以终止性错误结束
    Errored,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub outcome: StreamOutcome,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// 首个传输层 chunk 的到达耗时（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,

    pub chunk_count: u32,
    pub total_bytes: usize,
    pub decode_error_count: u32,
    pub text_delta_count: u32,
    pub tool_call_count: u32,

    /// 流结束时参数仍不是合法 JSON 而被丢弃的工具调用
    pub dropped_tool_call_count: u32,

    pub data_part_count: u32,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self {
            outcome: StreamOutcome::Open,
            started_at: Utc::now(),
            ended_at: None,
            ttfb_ms: None,
            chunk_count: 0,
            total_bytes: 0,
            decode_error_count: 0,
            text_delta_count: 0,
            tool_call_count: 0,
            dropped_tool_call_count: 0,
            data_part_count: 0,
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个传输层 chunk，首个 chunk 同时确定 TTFB
    pub fn record_chunk(&mut self, bytes: usize) {
        if self.chunk_count == 0 {
            self.ttfb_ms = Some(elapsed_ms(self.started_at, Utc::now()));
        }
        self.chunk_count += 1;
        self.total_bytes += bytes;
    }

    pub fn record_decode_error(&mut self) {
        self.decode_error_count += 1;
    }

    pub fn record_text_delta(&mut self) {
        self.text_delta_count += 1;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_call_count += 1;
    }

    pub fn record_dropped_tool_calls(&mut self, count: u32) {
        self.dropped_tool_call_count += count;
    }

    pub fn record_data_part(&mut self) {
        self.data_part_count += 1;
    }

    pub fn record_error(&mut self) {
        self.close(StreamOutcome::Errored);
    }

    pub fn record_cancelled(&mut self) {
        self.close(StreamOutcome::Cancelled);
    }

    /// 正常结束
    ///
    /// 已经处于终态时不改变终态，只补上结束时间。
    pub fn finish(&mut self) {
        self.close(StreamOutcome::Finished);
    }

    fn close(&mut self, outcome: StreamOutcome) {
        if self.outcome == StreamOutcome::Open {
            self.outcome = outcome;
        }
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outcome != StreamOutcome::Open
    }

    /// 到结束时间（未结束时到现在）的耗时
    pub fn duration_ms(&self) -> u64 {
        elapsed_ms(self.started_at, self.ended_at.unwrap_or_else(Utc::now))
    }

    pub fn throughput_bytes_per_sec(&self) -> Option<f64> {
        match self.duration_ms() {
            0 => None,
            ms => Some(self.total_bytes as f64 * 1000.0 / ms as f64),
        }
    }

    /// 输出汇总日志
    pub fn log_metrics(&self, provider: Option<ProviderFormat>) {
        info!(
            provider = ?provider.map(|p| p.display_name()),
            outcome = ?self.outcome,
            duration_ms = self.duration_ms(),
            ttfb_ms = ?self.ttfb_ms,
            chunk_count = self.chunk_count,
            total_bytes = self.total_bytes,
            bytes_per_sec = ?self.throughput_bytes_per_sec().map(|t| t.round() as u64),
            text_delta_count = self.text_delta_count,
            tool_call_count = self.tool_call_count,
            dropped_tool_call_count = self.dropped_tool_call_count,
            data_part_count = self.data_part_count,
            decode_error_count = self.decode_error_count,
            "流式指标"
        );
    }
}

impl fmt::Display for StreamMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} in {}ms: {} chunks / {} bytes, {} text, {} tool calls ({} dropped), {} data, {} decode errors",
            self.outcome,
            self.duration_ms(),
            self.chunk_count,
            self.total_bytes,
            self.text_delta_count,
            self.tool_call_count,
            self.dropped_tool_call_count,
            self.data_part_count,
            self.decode_error_count
        )
    }
}

// ============================================================================
// 测试模块
// ============================================================================
