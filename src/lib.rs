//! streamcast
//!
//! 把多个互不兼容的 LLM Provider 的流式输出归一化为统一的事件流，
//! 并重新编码为按行分隔的线路协议，以流式 HTTP 响应体输出。
//!
//! ```ignore
//! use streamcast::streaming::{ProviderFormat, StreamManager};
//!
//! let manager = StreamManager::default();
//! let response = manager
//!     .open_response(ProviderFormat::OpenAi, upstream)
//!     .into_response();
//! ```

pub mod config;
pub mod streaming;
pub mod telemetry;

pub use config::{load_config, AppConfig, ConfigError, LoggingConfig};
pub use streaming::{
    ProviderFormat, ProviderTransport, StreamCallbacks, StreamConfig, StreamDataQueue,
    StreamError, StreamEvent, StreamManager, StreamPipeline, StreamingTextResponse,
};
pub use telemetry::{init_logging, TelemetryError};
