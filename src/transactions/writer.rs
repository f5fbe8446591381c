// 写事务
//
// 选取一组互不相同的行，按隔离级别更新：
// - 读未提交：不加锁直接更新，然后提交
// - 读已提交 / 可重复读：逐行加写锁并更新（记录前镜像），
//   全部更新完成后先置提交标志，再释放全部写锁
// - 可串行化：持有表锁完成全部更新并提交

use crate::table::{LockingTable, Row, TupleId};
use crate::transactions::{
    IsolationLevel, Role, Transaction, TransactionError, TransactionKind, TransactionResult,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// 写事务专有状态
#[derive(Debug)]
pub struct WriterState {
    targets: Vec<TupleId>,
    committed: AtomicBool,
}

impl WriterState {
    pub fn new(targets: Vec<TupleId>) -> Self {
        Self {
            targets,
            committed: AtomicBool::new(false),
        }
    }

    /// 拒绝采样，直到得到 `rows` 个不同的行（不超过表大小）
    pub fn sample_targets<R: Rng + ?Sized>(num_tuples: usize, rows: usize, rng: &mut R) -> Vec<TupleId> {
        let rows = rows.min(num_tuples);
        let mut targets = Vec::with_capacity(rows);
        while targets.len() < rows {
            let id = rng.gen_range(0..num_tuples);
            if !targets.contains(&id) {
                targets.push(id);
            }
        }
        targets
    }

    pub fn targets(&self) -> &[TupleId] {
        &self.targets
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    fn mark_committed(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }
}

/// 写入策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// 不加锁
    Unlocked,
    /// 行级写锁，提交后统一释放
    RowLocked,
    /// 表级排他锁
    TableLocked,
}

impl WriteStrategy {
    pub fn for_level(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadUncommitted => WriteStrategy::Unlocked,
            IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => WriteStrategy::RowLocked,
            IsolationLevel::Serializable => WriteStrategy::TableLocked,
        }
    }
}

/// 写事务结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterOutcome {
    Committed,
    /// 类型不是写入，未做任何更新
    Skipped,
    /// 被冲突方回滚
    Aborted,
}

fn random_value(table: &dyn LockingTable) -> f64 {
    rand::thread_rng().gen::<f64>() * table.core().config().max_value
}

impl Transaction {
    fn writer_state(&self) -> TransactionResult<&WriterState> {
        match self.role() {
            Role::Writer(state) => Ok(state),
            Role::Reader(_) => Err(TransactionError::ProtocolViolation(format!(
                "{} is not a writer",
                self
            ))),
        }
    }

    /// 更新刚刚获得写锁的行并记录前镜像。
    ///
    /// 该行必须是账本中下一个还没有前镜像的写锁，保证前镜像与写锁按位置一一对应
    pub fn record_update(&self, table: &dyn LockingTable, row: TupleId, new_value: f64) -> TransactionResult<Row> {
        let mut book = self.book();
        self.ensure_active()?;

        let next = book.before_images.len();
        if book.write_locks.get(next) != Some(&row) {
            return Err(TransactionError::ProtocolViolation(format!(
                "update of tuple {} without a matching write lock (locks {:?})",
                row, book.write_locks
            )));
        }

        let before_image = table.update(row, self.id(), new_value);
        book.before_images.push(before_image);
        Ok(before_image)
    }

    /// 置提交标志后释放全部写锁；两步都在账本锁内完成，回滚无法插入其间
    pub fn commit_and_release(&self, table: &dyn LockingTable) -> TransactionResult<()> {
        let state = self.writer_state()?;
        let mut book = self.book();
        self.ensure_active()?;

        state.mark_committed();
        for row in book.write_locks.drain(..) {
            table.release_write_lock(row, self.id());
        }
        book.before_images.clear();
        Ok(())
    }

    fn update_unlocked(&self, table: &dyn LockingTable, state: &WriterState) {
        for &row in state.targets() {
            table.update(row, self.id(), random_value(table));
        }
    }

    fn update_row_locked(self: &Arc<Self>, table: &dyn LockingTable, state: &WriterState) -> TransactionResult<()> {
        for &row in state.targets() {
            table.get_write_lock(row, self)?;
            self.record_update(table, row, random_value(table))?;
        }
        self.commit_and_release(table)
    }

    fn update_table_locked(&self, table: &dyn LockingTable, state: &WriterState) {
        table.get_table_lock();
        self.update_unlocked(table, state);
        state.mark_committed();
        table.release_table_lock();
    }

    /// 按表的隔离级别执行一次写入
    pub fn execute_write(self: &Arc<Self>, table: &dyn LockingTable) -> TransactionResult<()> {
        let state = self.writer_state()?;
        match WriteStrategy::for_level(table.isolation_level()) {
            WriteStrategy::Unlocked => {
                self.update_unlocked(table, state);
                state.mark_committed();
                Ok(())
            }
            WriteStrategy::RowLocked => self.update_row_locked(table, state),
            WriteStrategy::TableLocked => {
                self.update_table_locked(table, state);
                Ok(())
            }
        }
    }

    /// 写事务线程主体；无论结果如何都计入已结束的写事务
    pub fn run_writer(self: &Arc<Self>, table: &dyn LockingTable) -> WriterOutcome {
        table.register_writer(self);

        let outcome = if self.kind() != TransactionKind::Write {
            info!("Task {} is not a write transaction, skipping updates", self.id());
            WriterOutcome::Skipped
        } else {
            match self.execute_write(table) {
                Ok(()) => WriterOutcome::Committed,
                Err(TransactionError::Wounded { .. }) => {
                    info!("{} was rolled back by a conflicting transaction", self);
                    WriterOutcome::Aborted
                }
                Err(err) => {
                    error!(tx = %self, %err, "writer failed");
                    self.release_all(table);
                    WriterOutcome::Aborted
                }
            }
        };

        let finished = table.metrics().record_writer_finished();
        info!("Done task {}. I am finisher number {} ({:?})", self.id(), finished, outcome);
        outcome
    }
}
