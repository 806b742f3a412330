//! 日志初始化
//!
//! 安装 `tracing-subscriber` 的 fmt 订阅器，级别和 target 显示来自配置。

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing::Level;

/// 日志初始化错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("无效的日志级别: {0}")]
    InvalidLevel(String),

    /// 全局订阅器已经安装
    #[error("日志已初始化: {0}")]
    AlreadyInitialized(String),
}

/// 解析日志级别
pub fn parse_level(level: &str) -> Result<Level, TelemetryError> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(level.to_string()))
}

/// 安装全局日志订阅器
///
/// 重复调用返回 [`TelemetryError::AlreadyInitialized`]。
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let level = parse_level(&config.level)?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;
    tracing::debug!(level = %level, "日志已初始化");
    Ok(())
}
