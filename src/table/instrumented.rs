//! 计时装饰器
//!
//! 包装任意锁表实现，记录加锁等待时间、加锁次数以及更新耗时。
//! 对外契约与被包装的实现完全相同。

use crate::table::{LockingTable, Row, TableCore, TupleId, WriterId};
use crate::transactions::{Transaction, TransactionResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::debug;

/// 单个线程的累计耗时
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadTimer {
    pub lock_attempts: u64,
    pub lock_wait: Duration,
    pub updates: u64,
    pub update_time: Duration,
}

pub struct InstrumentedLockingTable<T: LockingTable> {
    inner: T,
    timers: Mutex<HashMap<ThreadId, ThreadTimer>>,
}

impl<T: LockingTable> InstrumentedLockingTable<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// 当前线程的累计耗时
    pub fn current_thread_timer(&self) -> ThreadTimer {
        self.timers
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or_default()
    }

    /// 全部线程的累计耗时之和
    pub fn total(&self) -> ThreadTimer {
        self.timers
            .lock()
            .values()
            .fold(ThreadTimer::default(), |mut acc, t| {
                acc.lock_attempts += t.lock_attempts;
                acc.lock_wait += t.lock_wait;
                acc.updates += t.updates;
                acc.update_time += t.update_time;
                acc
            })
    }

    pub fn reset_timers(&self) {
        self.timers.lock().clear();
    }

    fn timed_lock(
        &self,
        row: TupleId,
        acquire: impl FnOnce(&T) -> TransactionResult<()>,
    ) -> TransactionResult<()> {
        let metrics = self.inner.metrics();
        metrics.record_lock_attempt();

        let start = Instant::now();
        let result = acquire(&self.inner);
        let waited = start.elapsed();

        metrics.add_lock_wait_ns(waited.as_nanos() as u64);
        {
            let mut timers = self.timers.lock();
            let timer = timers.entry(thread::current().id()).or_default();
            timer.lock_attempts += 1;
            timer.lock_wait += waited;
        }
        debug!(row, waited_us = waited.as_micros() as u64, "lock wait");
        result
    }
}

impl<T: LockingTable> LockingTable for InstrumentedLockingTable<T> {
    fn core(&self) -> &TableCore {
        self.inner.core()
    }

    fn get_read_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()> {
        self.timed_lock(row, |inner| inner.get_read_lock(row, requester))
    }

    fn get_write_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()> {
        self.timed_lock(row, |inner| inner.get_write_lock(row, requester))
    }

    fn release_read_lock(&self, row: TupleId, holder_id: u64) {
        self.inner.release_read_lock(row, holder_id);
    }

    fn release_write_lock(&self, row: TupleId, holder_id: u64) {
        self.inner.release_write_lock(row, holder_id);
    }

    fn update(&self, row: TupleId, writer_id: WriterId, new_value: f64) -> Row {
        let start = Instant::now();
        let before_image = self.inner.update(row, writer_id, new_value);
        let elapsed = start.elapsed();

        self.inner.metrics().add_update_ns(elapsed.as_nanos() as u64);
        let mut timers = self.timers.lock();
        let timer = timers.entry(thread::current().id()).or_default();
        timer.updates += 1;
        timer.update_time += elapsed;
        before_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::table::StandardLockingTable;
    use crate::transactions::TransactionKind;

    fn table() -> InstrumentedLockingTable<StandardLockingTable> {
        InstrumentedLockingTable::new(StandardLockingTable::with_values(
            TableConfig::default()
                .with_tuples(8)
                .with_tasks(2)
                .with_lock_timeout(Duration::from_millis(20))
                .with_write_cost(Duration::from_millis(2)),
            |id| id as f64,
        ))
    }

    #[test]
    fn test_lock_attempts_counted() {
        let table = table();
        let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
        table.get_read_lock(0, &reader).unwrap();
        table.get_read_lock(1, &reader).unwrap();

        assert_eq!(table.metrics().snapshot().lock_attempts, 2);
        assert_eq!(table.current_thread_timer().lock_attempts, 2);
        assert_eq!(reader.read_locks(), vec![0, 1]);
    }

    #[test]
    fn test_update_time_recorded() {
        let table = table();
        let writer = Transaction::writer(1, TransactionKind::Write, vec![3]);
        table.get_write_lock(3, &writer).unwrap();
        writer.record_update(&table, 3, 9.5).unwrap();

        let snapshot = table.metrics().snapshot();
        assert!(snapshot.update_ns >= Duration::from_millis(2).as_nanos() as u64);
        assert_eq!(table.total().updates, 1);
        assert_eq!(table.get_tuple(3).value, 9.5);
    }

    #[test]
    fn test_same_contract_as_inner() {
        let table = table();
        let writer = Transaction::writer(1, TransactionKind::Write, vec![5]);
        table.get_write_lock(5, &writer).unwrap();
        assert_eq!(table.inner().available_permits(5), 0);

        table.release_write_lock(5, 1);
        assert_eq!(table.inner().available_permits(5), 2);
        assert!(table.holder(5).is_none());

        table.reset_timers();
        assert_eq!(table.total(), ThreadTimer::default());
    }
}
