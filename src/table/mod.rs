// 锁表模块
//
// 持有行数据、行级锁状态、持有者登记表和表级排他锁。
// 读写行数据只能通过这里暴露的接口进行。
//
// 三种实现共享同一个 TableCore：
// - StandardLockingTable：计数信号量模拟读写锁
// - OptimizedLockingTable：每行公平读写锁
// - InstrumentedLockingTable：计时装饰器

pub mod metrics;
pub mod standard;
pub mod optimized;
pub mod instrumented;

pub use metrics::{MetricsSnapshot, TableMetrics};
pub use standard::StandardLockingTable;
pub use optimized::OptimizedLockingTable;
pub use instrumented::InstrumentedLockingTable;

use crate::config::TableConfig;
use crate::transactions::{
    FairSemaphore, HolderRegistry, IsolationLevel, LockType, Transaction, TransactionError,
    TransactionResult, WoundWaitPolicy,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 行标识（即行在表中的下标）
pub type TupleId = usize;

/// 写事务标识
pub type WriterId = u64;

/// 从未被修改过的行的 `modified_by`
pub const NOT_MODIFIED: Option<WriterId> = None;

/// 行：固定三字段
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: TupleId,
    pub value: f64,
    /// 最后一次写入该行的写事务
    pub modified_by: Option<WriterId>,
}

impl Row {
    pub fn new(id: TupleId, value: f64) -> Self {
        Self {
            id,
            value,
            modified_by: NOT_MODIFIED,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified_by.is_some()
    }
}

/// 各实现共享的表状态
pub struct TableCore {
    config: TableConfig,
    policy: WoundWaitPolicy,
    rows: Vec<Mutex<Row>>,
    holders: HolderRegistry,
    table_lock: FairSemaphore,
    writers: RwLock<HashMap<WriterId, Arc<Transaction>>>,
    metrics: TableMetrics,
}

impl TableCore {
    /// 创建表并以 [0, max_value) 的随机值初始化
    pub fn new(config: TableConfig) -> Self {
        let mut rng = rand::thread_rng();
        let max_value = config.max_value;
        Self::with_values(config, |_| rng.gen::<f64>() * max_value)
    }

    /// 按给定函数初始化每一行的值
    pub fn with_values(config: TableConfig, mut value_of: impl FnMut(TupleId) -> f64) -> Self {
        info!(
            isolation = %config.isolation_level,
            tuples = config.num_tuples,
            "creating table"
        );
        let rows = (0..config.num_tuples)
            .map(|id| Mutex::new(Row::new(id, value_of(id))))
            .collect();

        Self {
            policy: WoundWaitPolicy::from_favor_older(config.favor_older),
            rows,
            holders: HolderRegistry::new(),
            table_lock: FairSemaphore::new(1),
            writers: RwLock::new(HashMap::new()),
            metrics: TableMetrics::new(),
            config,
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn policy(&self) -> WoundWaitPolicy {
        self.policy
    }

    pub fn holders(&self) -> &HolderRegistry {
        &self.holders
    }

    pub fn metrics(&self) -> &TableMetrics {
        &self.metrics
    }

    pub fn num_tuples(&self) -> usize {
        self.rows.len()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }

    pub fn get_tuple(&self, row: TupleId) -> Row {
        *self.rows[row].lock()
    }

    /// 覆盖行值并返回覆盖前的前镜像，附带固定的人工写入延迟
    pub fn update(&self, row: TupleId, writer_id: WriterId, new_value: f64) -> Row {
        let before_image = {
            let mut tuple = self.rows[row].lock();
            let before = *tuple;
            tuple.modified_by = Some(writer_id);
            tuple.value = new_value;
            before
        };
        if !self.config.write_cost.is_zero() {
            std::thread::sleep(self.config.write_cost);
        }
        before_image
    }

    pub fn restore(&self, before_image: &Row, row: TupleId) {
        *self.rows[row].lock() = *before_image;
    }

    pub fn register_writer(&self, writer: &Arc<Transaction>) {
        self.writers.write().insert(writer.id(), Arc::clone(writer));
    }

    /// 清空写事务登记，在新一轮运行开始前调用
    pub fn clear_writers(&self) {
        self.writers.write().clear();
    }

    pub fn registered_writers(&self) -> usize {
        self.writers.read().len()
    }

    /// 写事务的提交标志；未登记的写事务返回 None
    pub fn writer_committed(&self, writer_id: WriterId) -> Option<bool> {
        self.writers
            .read()
            .get(&writer_id)
            .and_then(|tx| tx.as_writer().map(|w| w.is_committed()))
    }

    /// 授予成功后的登记：在事务的账本锁内同时写入锁账本和持有者登记表。
    /// 若事务在等待期间已被回滚，则立即归还原语并返回 Wounded
    pub(crate) fn finish_grant(
        &self,
        row: TupleId,
        requester: &Arc<Transaction>,
        lock_type: LockType,
        unlock: impl FnOnce(),
    ) -> TransactionResult<()> {
        let registered = requester.lock_granted(lock_type, row, || {
            self.holders.add_holder(row, Arc::clone(requester));
        });
        if !registered {
            unlock();
            return Err(TransactionError::Wounded {
                tx_id: requester.id(),
            });
        }
        Ok(())
    }
}

/// 锁表接口
///
/// `get_read_lock` / `get_write_lock` 阻塞直到授予；超时后按 wound-wait
/// 决定是否回滚当前持有者，然后继续重试。只有请求者自己被回滚时才返回错误。
pub trait LockingTable: Send + Sync {
    fn core(&self) -> &TableCore;

    fn get_read_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()>;

    fn get_write_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()>;

    /// 清除 `holder_id` 的持有者登记并归还一个读许可
    fn release_read_lock(&self, row: TupleId, holder_id: u64);

    /// 清除 `holder_id` 的持有者登记并归还全部许可
    fn release_write_lock(&self, row: TupleId, holder_id: u64);

    fn update(&self, row: TupleId, writer_id: WriterId, new_value: f64) -> Row {
        self.core().update(row, writer_id, new_value)
    }

    /// 获取表级排他锁（公平）
    fn get_table_lock(&self) {
        self.core().table_lock.acquire(1);
    }

    fn release_table_lock(&self) {
        self.core().table_lock.release(1);
    }

    /// 读取行内容；调用者需按隔离级别自行持有相应的锁
    fn get_tuple(&self, row: TupleId) -> Row {
        self.core().get_tuple(row)
    }

    fn restore(&self, before_image: &Row, row: TupleId) {
        self.core().restore(before_image, row);
    }

    fn register_writer(&self, writer: &Arc<Transaction>) {
        self.core().register_writer(writer);
    }

    fn writer_committed(&self, writer_id: WriterId) -> Option<bool> {
        self.core().writer_committed(writer_id)
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.core().config().isolation_level
    }

    fn num_tuples(&self) -> usize {
        self.core().num_tuples()
    }

    fn metrics(&self) -> &TableMetrics {
        self.core().metrics()
    }

    /// 持有者登记表中最近登记的持有者（可能已过期）
    fn holder(&self, row: TupleId) -> Option<Arc<Transaction>> {
        self.core().holders().holder(row)
    }

    fn holders(&self, row: TupleId) -> Vec<Arc<Transaction>> {
        self.core().holders().holders(row)
    }
}
