// 计数信号量锁表
//
// 每行一个容量为最大任务数的公平信号量：读锁占 1 个许可，写锁占全部许可。
// 每次尝试都有固定超时，超时后执行 wound-wait 并继续重试，没有总的截止时间。

use crate::config::TableConfig;
use crate::table::{LockingTable, TableCore, TupleId};
use crate::transactions::wound_wait::resolve_conflict;
use crate::transactions::{FairSemaphore, LockType, RowLockPrimitive, Transaction, TransactionResult};
use std::sync::Arc;
use tracing::debug;

pub struct StandardLockingTable {
    core: TableCore,
    row_locks: Vec<FairSemaphore>,
}

impl StandardLockingTable {
    pub fn new(config: TableConfig) -> Self {
        Self::from_core(TableCore::new(config))
    }

    pub fn with_values(config: TableConfig, value_of: impl FnMut(TupleId) -> f64) -> Self {
        Self::from_core(TableCore::with_values(config, value_of))
    }

    fn from_core(core: TableCore) -> Self {
        let capacity = core.config().num_tasks.max(1);
        let row_locks = (0..core.num_tuples())
            .map(|_| FairSemaphore::new(capacity))
            .collect();
        Self { core, row_locks }
    }

    /// 某行当前可用的许可数
    pub fn available_permits(&self, row: TupleId) -> usize {
        self.row_locks[row].available_permits()
    }

    fn acquire(&self, row: TupleId, requester: &Arc<Transaction>, lock_type: LockType) -> TransactionResult<()> {
        let lock = &self.row_locks[row];
        let timeout = self.core.lock_timeout();
        loop {
            requester.ensure_active()?;
            if lock.try_lock_for(lock_type, timeout) {
                break;
            }
            self.core.metrics().record_failed_attempt();
            let outcome = resolve_conflict(self, row, requester, lock_type);
            debug!(tx = %requester, row, %lock_type, ?outcome, "retrying lock");
        }
        self.core
            .finish_grant(row, requester, lock_type, || lock.unlock(lock_type))
    }
}

impl LockingTable for StandardLockingTable {
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
        self.row_locks[row].unlock(LockType::Read);
    }

    fn release_write_lock(&self, row: TupleId, holder_id: u64) {
        self.core.holders().remove_holder(row, holder_id);
        self.row_locks[row].unlock(LockType::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::{TransactionError, TransactionKind};
    use std::thread;
    use std::time::Duration;

    fn table(tasks: usize, favor_older: bool) -> Arc<StandardLockingTable> {
        Arc::new(StandardLockingTable::with_values(
            TableConfig::default()
                .with_tuples(10)
                .with_tasks(tasks)
                .with_favor_older(favor_older)
                .with_lock_timeout(Duration::from_millis(25))
                .with_write_cost(Duration::ZERO),
            |id| id as f64,
        ))
    }

    #[test]
    fn test_read_locks_consume_one_permit() {
        let table = table(3, true);
        let a = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
        let b = Transaction::reader(2, TransactionKind::FullScanRead, Vec::new());

        table.get_read_lock(0, &a).unwrap();
        table.get_read_lock(0, &b).unwrap();
        assert_eq!(table.available_permits(0), 1);
        assert_eq!(a.read_locks(), vec![0]);
        assert_eq!(table.holder(0).map(|h| h.id()), Some(2));

        table.release_read_lock(0, 2);
        assert_eq!(table.available_permits(0), 2);
        assert_eq!(table.holder(0).map(|h| h.id()), Some(1));

        table.release_read_lock(0, 1);
        assert!(table.holder(0).is_none());
    }

    #[test]
    fn test_write_lock_takes_all_permits() {
        let table = table(4, true);
        let writer = Transaction::writer(1, TransactionKind::Write, vec![3]);
        table.get_write_lock(3, &writer).unwrap();
        assert_eq!(table.available_permits(3), 0);
        assert_eq!(writer.write_locks(), vec![3]);

        table.release_write_lock(3, 1);
        assert_eq!(table.available_permits(3), 4);
    }

    #[test]
    fn test_older_requester_wounds_younger_holder() {
        let table = table(2, true);
        let older = Transaction::writer(1, TransactionKind::Write, vec![4]);
        let younger = Transaction::writer(2, TransactionKind::Write, vec![4]);

        table.get_write_lock(4, &younger).unwrap();
        younger.record_update(table.as_ref(), 4, 40.0).unwrap();

        table.get_write_lock(4, &older).unwrap();
        assert!(younger.is_wounded());
        assert_eq!(table.get_tuple(4).value, 4.0);
        assert_eq!(table.holder(4).map(|h| h.id()), Some(1));
        assert_eq!(table.metrics().wounds(), 1);
    }

    #[test]
    fn test_younger_requester_waits_for_older_holder() {
        let table = table(2, true);
        let older = Transaction::writer(1, TransactionKind::Write, vec![4]);
        let younger = Transaction::writer(2, TransactionKind::Write, vec![4]);
        table.get_write_lock(4, &older).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let younger = Arc::clone(&younger);
            thread::spawn(move || table.get_write_lock(4, &younger))
        };

        // 等过几个超时周期，老事务不应被回滚
        thread::sleep(Duration::from_millis(120));
        assert!(!older.is_wounded());
        assert!(table.metrics().snapshot().failed_lock_attempts >= 1);

        table.release_write_lock(4, 1);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(younger.write_locks(), vec![4]);
    }

    #[test]
    fn test_waiting_requester_exits_when_wounded() {
        let table = table(2, true);
        let holder = Transaction::writer(1, TransactionKind::Write, vec![6]);
        let waiter_tx = Transaction::writer(2, TransactionKind::Write, vec![6]);
        table.get_write_lock(6, &holder).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let waiter_tx = Arc::clone(&waiter_tx);
            thread::spawn(move || table.get_write_lock(6, &waiter_tx))
        };

        thread::sleep(Duration::from_millis(40));
        waiter_tx.rollback(table.as_ref());
        assert_eq!(waiter.join().unwrap(), Err(TransactionError::Wounded { tx_id: 2 }));
        assert_eq!(table.available_permits(6), 0);
    }
}
