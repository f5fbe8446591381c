// 公平读写锁表
//
// 每行一个公平读写锁代替信号量模拟，读者数量不再受任务数限制。
// 对外契约与 StandardLockingTable 相同：每次 tryLock 失败后执行一次
// 死锁处理步骤（同样的 wound-wait 判定），然后再次尝试。

use crate::config::TableConfig;
use crate::table::{LockingTable, TableCore, TupleId};
use crate::transactions::wound_wait::{resolve_conflict, ConflictOutcome};
use crate::transactions::{FairRwLock, LockType, RowLockPrimitive, Transaction, TransactionResult};
use std::sync::Arc;

pub struct OptimizedLockingTable {
    core: TableCore,
    row_locks: Vec<FairRwLock>,
}

impl OptimizedLockingTable {
    pub fn new(config: TableConfig) -> Self {
        Self::from_core(TableCore::new(config))
    }

    pub fn with_values(config: TableConfig, value_of: impl FnMut(TupleId) -> f64) -> Self {
        Self::from_core(TableCore::with_values(config, value_of))
    }

    fn from_core(core: TableCore) -> Self {
        let row_locks = (0..core.num_tuples()).map(|_| FairRwLock::new()).collect();
        Self { core, row_locks }
    }

    pub fn reader_count(&self, row: TupleId) -> usize {
        self.row_locks[row].reader_count()
    }

    pub fn is_write_locked(&self, row: TupleId) -> bool {
        self.row_locks[row].is_write_locked()
    }

    fn handle_deadlock(&self, row: TupleId, requester: &Arc<Transaction>, lock_type: LockType) -> ConflictOutcome {
        self.core.metrics().record_failed_attempt();
        resolve_conflict(self, row, requester, lock_type)
    }

    fn acquire(&self, row: TupleId, requester: &Arc<Transaction>, lock_type: LockType) -> TransactionResult<()> {
        let lock = &self.row_locks[row];
        let timeout = self.core.lock_timeout();

        requester.ensure_active()?;
        while !lock.try_lock_for(lock_type, timeout) {
            self.handle_deadlock(row, requester, lock_type);
            requester.ensure_active()?;
        }
        self.core
            .finish_grant(row, requester, lock_type, || lock.unlock(lock_type))
    }
}

impl LockingTable for OptimizedLockingTable {
    fn core(&self) -> &TableCore {
        &self.core
    }

    fn get_read_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()> {
        self.acquire(row, requester, LockType::Read)
    }

    fn get_write_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()> {
        self.acquire(row, requester, LockType::Write)
    }

    fn release_read_lock(&self, row: TupleId, holder_id: u64) {
        self.core.holders().remove_holder(row, holder_id);
        self.row_locks[row].unlock_read();
    }

    fn release_write_lock(&self, row: TupleId, holder_id: u64) {
        self.core.holders().remove_holder(row, holder_id);
        self.row_locks[row].unlock_write();
    }
}
