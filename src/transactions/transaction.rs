// 事务定义
//
// 事务是一个带标签的变体（读事务 / 写事务），共享身份、时间戳、
// 类型以及锁账本。回滚由冲突的另一方通过 wound-wait 触发。

use crate::table::{LockingTable, Row, TupleId};
use crate::transactions::reader::ReaderState;
use crate::transactions::writer::WriterState;
use crate::transactions::{LockType, TransactionKind};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

static TIMESTAMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 分配下一个事务时间戳（严格递增，冲突裁决的唯一依据）
pub fn next_timestamp() -> u64 {
    TIMESTAMP_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// 事务错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// 事务已被冲突方回滚，必须停止
    #[error("transaction {tx_id} was wounded and rolled back")]
    Wounded { tx_id: u64 },
    /// 协议误用
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// 事务结果类型
pub type TransactionResult<T> = Result<T, TransactionError>;

/// 锁账本：当前持有的锁以及写事务的前镜像
///
/// `before_images[i]` 对应 `write_locks[i]`
#[derive(Debug, Default, Clone)]
pub struct LockBook {
    pub read_locks: Vec<TupleId>,
    pub write_locks: Vec<TupleId>,
    pub before_images: Vec<Row>,
}

impl LockBook {
    pub fn is_empty(&self) -> bool {
        self.read_locks.is_empty() && self.write_locks.is_empty()
    }
}

/// 一次回滚所做的工作
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackSummary {
    pub restored_rows: usize,
    pub released_read_locks: usize,
    pub released_write_locks: usize,
    pub missing_before_images: usize,
}

/// 事务角色
pub enum Role {
    Reader(ReaderState),
    Writer(WriterState),
}

/// 事务
pub struct Transaction {
    id: u64,
    timestamp: u64,
    kind: TransactionKind,
    role: Role,
    wounded: AtomicBool,
    book: Mutex<LockBook>,
}

impl Transaction {
    fn build(id: u64, kind: TransactionKind, role: Role) -> Arc<Self> {
        Arc::new(Self {
            id,
            timestamp: next_timestamp(),
            kind,
            role,
            wounded: AtomicBool::new(false),
            book: Mutex::new(LockBook::default()),
        })
    }

    /// 创建读事务，`targets` 为多点读取的行
    pub fn reader(id: u64, kind: TransactionKind, targets: Vec<TupleId>) -> Arc<Self> {
        Self::build(id, kind, Role::Reader(ReaderState::new(targets)))
    }

    /// 创建写事务，`targets` 必须互不相同
    pub fn writer(id: u64, kind: TransactionKind, targets: Vec<TupleId>) -> Arc<Self> {
        Self::build(id, kind, Role::Writer(WriterState::new(targets)))
    }

    /// 读事务：多点读取时均匀采样 `point_rows` 行（允许重复）
    pub fn random_reader<R: Rng + ?Sized>(
        id: u64,
        kind: TransactionKind,
        num_tuples: usize,
        point_rows: usize,
        rng: &mut R,
    ) -> Arc<Self> {
        let targets = if kind == TransactionKind::MultiPointRead {
            ReaderState::sample_targets(num_tuples, point_rows, rng)
        } else {
            Vec::new()
        };
        Self::reader(id, kind, targets)
    }

    /// 写事务：拒绝采样出 `rows` 个互不相同的行
    pub fn random_writer<R: Rng + ?Sized>(
        id: u64,
        kind: TransactionKind,
        num_tuples: usize,
        rows: usize,
        rng: &mut R,
    ) -> Arc<Self> {
        Self::writer(id, kind, WriterState::sample_targets(num_tuples, rows, rng))
    }

    /// 抽取类型并据此选择角色
    pub fn random<R: Rng + ?Sized>(
        id: u64,
        num_tuples: usize,
        point_rows: usize,
        writer_rows: usize,
        rng: &mut R,
    ) -> Arc<Self> {
        let kind = TransactionKind::draw(rng);
        if kind.is_read() {
            Self::random_reader(id, kind, num_tuples, point_rows, rng)
        } else {
            Self::random_writer(id, kind, num_tuples, writer_rows, rng)
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_reader(&self) -> bool {
        matches!(self.role, Role::Reader(_))
    }

    pub fn as_reader(&self) -> Option<&ReaderState> {
        match &self.role {
            Role::Reader(state) => Some(state),
            Role::Writer(_) => None,
        }
    }

    pub fn as_writer(&self) -> Option<&WriterState> {
        match &self.role {
            Role::Writer(state) => Some(state),
            Role::Reader(_) => None,
        }
    }

    pub fn is_wounded(&self) -> bool {
        self.wounded.load(Ordering::SeqCst)
    }

    /// 被回滚后返回 Wounded
    pub fn ensure_active(&self) -> TransactionResult<()> {
        if self.is_wounded() {
            Err(TransactionError::Wounded { tx_id: self.id })
        } else {
            Ok(())
        }
    }

    pub fn read_locks(&self) -> Vec<TupleId> {
        self.book.lock().read_locks.clone()
    }

    pub fn write_locks(&self) -> Vec<TupleId> {
        self.book.lock().write_locks.clone()
    }

    pub fn before_images(&self) -> Vec<Row> {
        self.book.lock().before_images.clone()
    }

    pub fn held_lock_count(&self) -> usize {
        let book = self.book.lock();
        book.read_locks.len() + book.write_locks.len()
    }

    pub(crate) fn book(&self) -> MutexGuard<'_, LockBook> {
        self.book.lock()
    }

    /// 把授予的锁记入账本，并在账本锁内执行 `register`；已被回滚则拒绝。
    ///
    /// 回滚同样持有账本锁，因此登记不会落在回滚之后
    pub(crate) fn lock_granted(&self, lock_type: LockType, row: TupleId, register: impl FnOnce()) -> bool {
        let mut book = self.book.lock();
        if self.is_wounded() {
            return false;
        }
        match lock_type {
            LockType::Read => book.read_locks.push(row),
            LockType::Write => book.write_locks.push(row),
        }
        register();
        true
    }

    /// 释放一个读锁；账本中没有该锁（已被回滚释放）时什么也不做
    pub fn release_read(&self, table: &dyn LockingTable, row: TupleId) -> bool {
        let mut book = self.book.lock();
        match book.read_locks.iter().position(|&r| r == row) {
            Some(pos) => {
                book.read_locks.remove(pos);
                table.release_read_lock(row, self.id);
                true
            }
            None => false,
        }
    }

    /// 释放账本中的全部读锁
    pub fn release_all_reads(&self, table: &dyn LockingTable) -> usize {
        let mut book = self.book.lock();
        let rows = std::mem::take(&mut book.read_locks);
        for &row in &rows {
            table.release_read_lock(row, self.id);
        }
        rows.len()
    }

    /// 不恢复数据，只归还账本中的全部锁
    pub fn release_all(&self, table: &dyn LockingTable) {
        let mut book = self.book.lock();
        for row in book.write_locks.drain(..) {
            table.release_write_lock(row, self.id);
        }
        book.before_images.clear();
        for row in book.read_locks.drain(..) {
            table.release_read_lock(row, self.id);
        }
    }

    /// 回滚：标记为已回滚，恢复前镜像并释放账本中的全部锁。
    ///
    /// 在账本锁内完成，因此与本事务自己的加锁、更新、提交互斥。
    /// 重复调用时账本已空，不做任何事
    pub fn rollback(&self, table: &dyn LockingTable) -> RollbackSummary {
        let mut book = self.book.lock();
        self.wounded.store(true, Ordering::SeqCst);

        let mut summary = RollbackSummary::default();
        match &self.role {
            Role::Reader(_) => {
                if !book.write_locks.is_empty() {
                    error!(tx = %self, locks = ?book.write_locks, "rollback(): readers should not hold write locks");
                    for row in book.write_locks.drain(..) {
                        table.release_write_lock(row, self.id);
                        summary.released_write_locks += 1;
                    }
                }
            }
            Role::Writer(_) => {
                let write_locks = std::mem::take(&mut book.write_locks);
                let before_images = std::mem::take(&mut book.before_images);
                for (i, &row) in write_locks.iter().enumerate() {
                    match before_images.get(i) {
                        Some(image) => {
                            table.restore(image, row);
                            summary.restored_rows += 1;
                        }
                        None => {
                            warn!(tx = %self, row, "missing before image during rollback");
                            summary.missing_before_images += 1;
                        }
                    }
                    table.release_write_lock(row, self.id);
                    summary.released_write_locks += 1;
                }
            }
        }

        for row in book.read_locks.drain(..) {
            table.release_read_lock(row, self.id);
            summary.released_read_locks += 1;
        }
        summary
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Role::Reader(_) => write!(f, "Reader {} (ts={}, {})", self.id, self.timestamp, self.kind),
            Role::Writer(state) => {
                let targets = state.targets();
                if targets.len() < 10 {
                    write!(f, "Task {} (ts={}) updating {:?}", self.id, self.timestamp, targets)
                } else {
                    write!(
                        f,
                        "Task {} (ts={}) updating [{}, {}, {}, ...]",
                        self.id, self.timestamp, targets[0], targets[1], targets[2]
                    )
                }
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("kind", &self.kind)
            .field("reader", &self.is_reader())
            .field("wounded", &self.is_wounded())
            .finish()
    }
}
