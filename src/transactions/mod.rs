// 事务模块
//
// 提供行级锁表之上的事务协议，包括：
// - 事务身份、时间戳与类型
// - 读写锁原语
// - wound-wait 死锁避免
// - 读事务（四种隔离级别下的读取策略与异常检测）
// - 写事务（前镜像记录、提交与回滚）

pub mod transaction;
pub mod locks;
pub mod wound_wait;
pub mod reader;
pub mod writer;

pub use transaction::{
    Transaction, TransactionError, TransactionResult, Role, LockBook, RollbackSummary, next_timestamp,
};
pub use locks::{LockType, FairSemaphore, FairRwLock, RowLockPrimitive};
pub use wound_wait::{WoundWaitPolicy, HolderRegistry, ConflictOutcome, resolve_conflict};
pub use reader::{
    ReaderState, ReaderOutcome, ReadShape, ReadStrategy, Anomaly, AnomalyLog, DirtyRead, NonRepeatableRead,
};
pub use writer::{WriterState, WriteStrategy, WriterOutcome};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 多点读取的概率上界
pub const MULTI_POINT_THRESHOLD: f64 = 0.3;
/// 全表扫描的概率上界（超过即为写事务）
pub const FULL_SCAN_THRESHOLD: f64 = 0.7;

/// 事务隔离级别
///
/// 顺序即严格程度，可以直接比较（`level < RepeatableRead`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// 读未提交
    ReadUncommitted,
    /// 读已提交
    ReadCommitted,
    /// 可重复读
    RepeatableRead,
    /// 可串行化（表锁）
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::RepeatableRead
    }
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// 是否使用表级锁而不是行级锁
    pub fn uses_table_lock(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    /// 在该级别下脏读是否可以接受
    pub fn tolerates_dirty_reads(&self) -> bool {
        *self <= IsolationLevel::ReadUncommitted
    }

    /// 在该级别下不可重复读是否可以接受
    pub fn tolerates_non_repeatable_reads(&self) -> bool {
        *self < IsolationLevel::RepeatableRead
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ_UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ_COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE_READ"),
            IsolationLevel::Serializable => write!(f, "SERIAL"),
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "read_uncommitted" | "ru" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" | "rc" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" | "rr" => Ok(IsolationLevel::RepeatableRead),
            "serializable" | "serial" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

/// 事务类型，构造时抽取一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// 多点读取
    MultiPointRead,
    /// 全表扫描读取
    FullScanRead,
    /// 写入
    Write,
}

impl TransactionKind {
    /// 按概率 p ∈ [0, 1) 映射到类型
    pub fn from_probability(p: f64) -> Self {
        if p < MULTI_POINT_THRESHOLD {
            TransactionKind::MultiPointRead
        } else if p < FULL_SCAN_THRESHOLD {
            TransactionKind::FullScanRead
        } else {
            TransactionKind::Write
        }
    }

    /// 加权随机抽取：0.3 / 0.4 / 0.3
    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_probability(rng.gen::<f64>())
    }

    pub fn is_read(&self) -> bool {
        !matches!(self, TransactionKind::Write)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::MultiPointRead => write!(f, "MULTI_POINT_READ"),
            TransactionKind::FullScanRead => write!(f, "FULL_SCAN_READ"),
            TransactionKind::Write => write!(f, "WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_thresholds() {
        assert_eq!(TransactionKind::from_probability(0.0), TransactionKind::MultiPointRead);
        assert_eq!(TransactionKind::from_probability(0.29), TransactionKind::MultiPointRead);
        assert_eq!(TransactionKind::from_probability(0.3), TransactionKind::FullScanRead);
        assert_eq!(TransactionKind::from_probability(0.69), TransactionKind::FullScanRead);
        assert_eq!(TransactionKind::from_probability(0.7), TransactionKind::Write);
        assert_eq!(TransactionKind::from_probability(0.99), TransactionKind::Write);
    }

    #[test]
    fn test_isolation_ordering() {
        assert!(IsolationLevel::ReadUncommitted < IsolationLevel::ReadCommitted);
        assert!(IsolationLevel::RepeatableRead < IsolationLevel::Serializable);

        assert!(IsolationLevel::ReadUncommitted.tolerates_dirty_reads());
        assert!(!IsolationLevel::ReadCommitted.tolerates_dirty_reads());
        assert!(IsolationLevel::ReadCommitted.tolerates_non_repeatable_reads());
        assert!(!IsolationLevel::RepeatableRead.tolerates_non_repeatable_reads());
        assert!(IsolationLevel::Serializable.uses_table_lock());
    }

    #[test]
    fn test_isolation_parse() {
        assert_eq!("read-committed".parse::<IsolationLevel>().unwrap(), IsolationLevel::ReadCommitted);
        assert_eq!("RR".parse::<IsolationLevel>().unwrap(), IsolationLevel::RepeatableRead);
        assert_eq!("serial".parse::<IsolationLevel>().unwrap(), IsolationLevel::Serializable);
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }
}
