use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// 连接跟踪的运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerMode {
    /// 离线批处理: 连接保留到结束, 用启发式规则识别四元组复用
    Batch,
    /// 持续运行: 按空闲时间清扫, 关闭的连接最终被回收
    Continuous,
}

/// 流表满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    EvictLru,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub mode: TrackerMode,
    pub hash_buckets: usize,          // 哈希桶数量 (质数)
    pub max_flows: Option<usize>,     // 最大驻留流数量
    pub capacity_policy: CapacityPolicy,
    pub detect_reuse: bool,           // 批处理模式下检测四元组复用
    pub reuse_idle_secs: u64,         // 复用判定的空闲阈值（秒）
    pub snapshot_index: bool,         // 维护 AVL 快照索引
    pub track_rexmit: bool,
    pub track_rtt: bool,
    pub live_idle_secs: u64,          // 持续模式: 活跃流空闲超时（秒）
    pub closed_linger_secs: u64,      // 持续模式: 已关闭流保留时间（秒）
    pub max_closed: usize,            // 持续模式: 已关闭流列表容量
    pub sweep_interval_secs: u64,     // 持续模式: 清扫间隔（秒）
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            mode: TrackerMode::Batch,
            hash_buckets: 1021,
            max_flows: None,
            capacity_policy: CapacityPolicy::EvictLru,
            detect_reuse: true,
            reuse_idle_secs: 4 * 60,
            snapshot_index: false,
            track_rexmit: true,
            track_rtt: true,
            live_idle_secs: 300,
            closed_linger_secs: 60,
            max_closed: 4096,
            sweep_interval_secs: 5,
        }
    }
}

impl TrackerConfig {
    pub fn continuous() -> Self {
        Self {
            mode: TrackerMode::Continuous,
            snapshot_index: true,
            ..Default::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hash_buckets == 0 {
            return Err(TrackerError::InvalidConfig(
                "hash_buckets must be non-zero".to_string(),
            ));
        }
        if self.max_flows == Some(0) {
            return Err(TrackerError::InvalidConfig(
                "max_flows must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The AVL index is always kept in continuous mode.
    pub fn uses_snapshot_index(&self) -> bool {
        self.snapshot_index || self.mode == TrackerMode::Continuous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.mode, TrackerMode::Batch);
        assert_eq!(config.hash_buckets, 1021);
        assert_eq!(config.reuse_idle_secs, 240);
        assert!(!config.uses_snapshot_index());
        assert!(TrackerConfig::continuous().uses_snapshot_index());
    }

    #[test]
    fn test_partial_json() {
        let config = TrackerConfig::from_json_str(
            r#"{"mode": "continuous", "max_flows": 64, "capacity_policy": "fail"}"#,
        )
        .unwrap();
        assert_eq!(config.mode, TrackerMode::Continuous);
        assert_eq!(config.max_flows, Some(64));
        assert_eq!(config.capacity_policy, CapacityPolicy::Fail);
        assert_eq!(config.hash_buckets, 1021);
    }

    #[test]
    fn test_rejects_zero_buckets() {
        let result = TrackerConfig::from_json_str(r#"{"hash_buckets": 0}"#);
        assert!(result.is_err());
        let result = TrackerConfig::from_json_str("not json");
        assert!(matches!(result, Err(TrackerError::ConfigParse(_))));
    }
}
