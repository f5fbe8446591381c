//! 配置模块
//!
//! 定义锁表与模拟运行的配置选项，支持从 JSON 文件加载

use crate::transactions::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 锁表实现变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableVariant {
    /// 计数信号量模拟共享/排他锁
    Standard,
    /// 每行一个公平读写锁
    Optimized,
    /// 在 Standard 之上记录等待与更新耗时
    Instrumented,
}

impl Default for TableVariant {
    fn default() -> Self {
        Self::Standard
    }
}

impl fmt::Display for TableVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableVariant::Standard => write!(f, "standard"),
            TableVariant::Optimized => write!(f, "optimized"),
            TableVariant::Instrumented => write!(f, "instrumented"),
        }
    }
}

impl std::str::FromStr for TableVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(TableVariant::Standard),
            "optimized" => Ok(TableVariant::Optimized),
            "instrumented" => Ok(TableVariant::Instrumented),
            other => Err(format!("unknown table variant '{}'", other)),
        }
    }
}

/// 锁表配置（构造时一次性读取）
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// 行数
    pub num_tuples: usize,
    /// 最大并发任务数，也是每行信号量的容量
    pub num_tasks: usize,
    /// 隔离级别
    pub isolation_level: IsolationLevel,
    /// 冲突时是否偏向较老的事务
    pub favor_older: bool,
    /// 单次加锁尝试的超时
    pub lock_timeout: Duration,
    /// 每次更新附加的人工延迟
    pub write_cost: Duration,
    /// 随机值上界
    pub max_value: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            num_tuples: 10,
            num_tasks: 10,
            isolation_level: IsolationLevel::default(),
            favor_older: true,
            lock_timeout: Duration::from_secs(5),
            write_cost: Duration::from_millis(10),
            max_value: 50.0,
        }
    }
}

impl TableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tuples(mut self, num_tuples: usize) -> Self {
        self.num_tuples = num_tuples;
        self
    }

    pub fn with_tasks(mut self, num_tasks: usize) -> Self {
        self.num_tasks = num_tasks;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_favor_older(mut self, favor_older: bool) -> Self {
        self.favor_older = favor_older;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_write_cost(mut self, cost: Duration) -> Self {
        self.write_cost = cost;
        self
    }
}

/// 模拟运行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub num_tuples: usize,
    pub num_tasks: usize,
    pub isolation_level: IsolationLevel,
    pub favor_older: bool,
    pub lock_timeout_ms: u64,
    pub write_cost_ms: u64,
    /// 每个写事务更新的不同行数
    pub rows_per_writer: usize,
    /// 多点读取采样的行数
    pub rows_per_point_read: usize,
    pub max_value: f64,
    pub variant: TableVariant,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_tuples: 10_000,
            num_tasks: 10,
            isolation_level: IsolationLevel::RepeatableRead,
            favor_older: true,
            lock_timeout_ms: 5_000,
            write_cost_ms: 10,
            rows_per_writer: 100,
            rows_per_point_read: 2,
            max_value: 50.0,
            variant: TableVariant::Standard,
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 字符串加载（缺省字段取默认值）
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_tuples == 0 {
            return Err(ConfigError::Invalid("num_tuples must be positive".into()));
        }
        if self.num_tasks == 0 {
            return Err(ConfigError::Invalid("num_tasks must be positive".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid("lock_timeout_ms must be positive".into()));
        }
        if !(self.max_value > 0.0) {
            return Err(ConfigError::Invalid("max_value must be positive".into()));
        }
        Ok(())
    }

    pub fn with_tuples(mut self, num_tuples: usize) -> Self {
        self.num_tuples = num_tuples;
        self
    }

    pub fn with_tasks(mut self, num_tasks: usize) -> Self {
        self.num_tasks = num_tasks;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_favor_older(mut self, favor_older: bool) -> Self {
        self.favor_older = favor_older;
        self
    }

    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn with_write_cost_ms(mut self, ms: u64) -> Self {
        self.write_cost_ms = ms;
        self
    }

    pub fn with_rows_per_writer(mut self, rows: usize) -> Self {
        self.rows_per_writer = rows;
        self
    }

    pub fn with_variant(mut self, variant: TableVariant) -> Self {
        self.variant = variant;
        self
    }

    /// 写事务实际更新的行数（不超过表大小）
    pub fn effective_rows_per_writer(&self) -> usize {
        self.rows_per_writer.min(self.num_tuples)
    }

    /// 派生锁表配置
    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            num_tuples: self.num_tuples,
            num_tasks: self.num_tasks,
            isolation_level: self.isolation_level,
            favor_older: self.favor_older,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            write_cost: Duration::from_millis(self.write_cost_ms),
            max_value: self.max_value,
        }
    }
}
