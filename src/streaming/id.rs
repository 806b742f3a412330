//! 工具调用 ID 生成
//!
//! Provider 没有给出调用 ID 时由组装器合成。生成器通过管道构建器注入，
//! 测试中可替换为确定性的实现。

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// ID 生成器
pub trait IdGenerator: Send + Sync + Debug {
    /// 生成一个进程内唯一的 ID
    fn next_id(&self) -> String;
}

/// 共享的 ID 生成器
pub type SharedIdGenerator = Arc<dyn IdGenerator>;

/// 基于 UUID v4 的生成器，格式为 `call_<32 位十六进制>`
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        format!("call_{}", Uuid::new_v4().simple())
    }
}

/// 前缀加自增计数的生成器
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}

/// 默认生成器
pub fn default_id_generator() -> SharedIdGenerator {
    Arc::new(UuidIdGenerator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_generator_format_and_uniqueness() {
        let generator = UuidIdGenerator;
        let ids: HashSet<String> = (0..100).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 100);
        for id in ids {
            assert!(id.starts_with("call_"));
            assert_eq!(id.len(), "call_".len() + 32);
        }
    }

    #[test]
    fn test_sequential_generator() {
        let generator = SequentialIdGenerator::new("tc_");
        assert_eq!(generator.next_id(), "tc_0");
        assert_eq!(generator.next_id(), "tc_1");
    }
}
