// 读事务
//
// 按 (读取形态, 隔离级别) 选择读取策略，每个目标行检查两次并检测：
// - 脏读：行的 modified_by 指向一个尚未提交的写事务
// - 不可重复读：第二遍读到的值与第一遍不同
//
// 读事务循环执行，直到所有提交的写事务都已结束，或自己被回滚

use crate::table::{LockingTable, Row, TupleId};
use crate::transactions::{IsolationLevel, Transaction, TransactionKind, TransactionResult};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// 读取形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadShape {
    MultiPoint,
    FullScan,
}

impl ReadShape {
    pub fn from_kind(kind: TransactionKind) -> Option<Self> {
        match kind {
            TransactionKind::MultiPointRead => Some(ReadShape::MultiPoint),
            TransactionKind::FullScanRead => Some(ReadShape::FullScan),
            TransactionKind::Write => None,
        }
    }
}

/// 读取策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// 不加锁的两遍读取
    Unlocked,
    /// 每次读取单独加读锁，读完即释放
    LockPerRead,
    /// 先锁住全部目标行，两遍读取后统一释放
    LockAllUpFront,
    /// 持有表级排他锁读取
    TableLocked,
}

impl ReadStrategy {
    /// 策略表：读未提交不加锁，读已提交逐行加锁，可重复读预先加锁，可串行化用表锁
    pub fn select(_shape: ReadShape, level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadUncommitted => ReadStrategy::Unlocked,
            IsolationLevel::ReadCommitted => ReadStrategy::LockPerRead,
            IsolationLevel::RepeatableRead => ReadStrategy::LockAllUpFront,
            IsolationLevel::Serializable => ReadStrategy::TableLocked,
        }
    }
}

/// 脏读记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirtyRead {
    pub execution: u64,
    pub row: TupleId,
    pub writer: u64,
}

/// 不可重复读记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonRepeatableRead {
    pub execution: u64,
    pub row: TupleId,
    pub first: f64,
    pub second: f64,
}

/// 检测到的异常
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Anomaly {
    DirtyRead(DirtyRead),
    NonRepeatableRead(NonRepeatableRead),
}

/// 异常日志
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyLog {
    pub dirty_reads: Vec<DirtyRead>,
    pub non_repeatable_reads: Vec<NonRepeatableRead>,
}

impl AnomalyLog {
    pub fn is_empty(&self) -> bool {
        self.dirty_reads.is_empty() && self.non_repeatable_reads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dirty_reads.len() + self.non_repeatable_reads.len()
    }

    fn push(&mut self, anomaly: Anomaly) {
        match anomaly {
            Anomaly::DirtyRead(a) => self.dirty_reads.push(a),
            Anomaly::NonRepeatableRead(a) => self.non_repeatable_reads.push(a),
        }
    }
}

/// 读事务专有状态
#[derive(Debug)]
pub struct ReaderState {
    targets: Vec<TupleId>,
    /// 第一遍读取的值，按行下标存放，大小与表相同
    first_pass: Mutex<Vec<f64>>,
    anomalies: Mutex<AnomalyLog>,
    executions: AtomicU64,
}

impl ReaderState {
    pub fn new(targets: Vec<TupleId>) -> Self {
        Self {
            targets,
            first_pass: Mutex::new(Vec::new()),
            anomalies: Mutex::new(AnomalyLog::default()),
            executions: AtomicU64::new(0),
        }
    }

    /// 均匀采样，允许重复
    pub fn sample_targets<R: Rng + ?Sized>(num_tuples: usize, count: usize, rng: &mut R) -> Vec<TupleId> {
        (0..count).map(|_| rng.gen_range(0..num_tuples)).collect()
    }

    pub fn targets(&self) -> &[TupleId] {
        &self.targets
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn anomalies(&self) -> AnomalyLog {
        self.anomalies.lock().clone()
    }
}

/// 读事务结束时的汇总
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOutcome {
    pub executions: u64,
    pub wounded: bool,
}

/// 一次执行的工作区：异常先记在这里，执行完整结束后才并入日志
struct Execution<'a> {
    tx: &'a Transaction,
    table: &'a dyn LockingTable,
    number: u64,
    first_pass: &'a mut Vec<f64>,
    found: Vec<Anomaly>,
    guarded: bool,
}

impl<'a> Execution<'a> {
    /// 读取一行；在加锁策略下，如果读取后发现自己已被回滚，则本次读取无效
    fn read(&self, row: TupleId) -> TransactionResult<Row> {
        let tuple = self.table.get_tuple(row);
        if self.guarded {
            self.tx.ensure_active()?;
        }
        Ok(tuple)
    }

    fn check_dirty(&mut self, tuple: &Row) {
        if let Some(writer) = tuple.modified_by {
            match self.table.writer_committed(writer) {
                Some(false) => self.found.push(Anomaly::DirtyRead(DirtyRead {
                    execution: self.number,
                    row: tuple.id,
                    writer,
                })),
                Some(true) => {}
                None => debug!(row = tuple.id, writer, "modified_by refers to an unknown writer"),
            }
        }
    }

    fn check_first(&mut self, row: TupleId) -> TransactionResult<()> {
        let tuple = self.read(row)?;
        self.first_pass[row] = tuple.value;
        self.check_dirty(&tuple);
        Ok(())
    }

    fn check_second(&mut self, row: TupleId) -> TransactionResult<()> {
        let tuple = self.read(row)?;
        let first = self.first_pass[row];
        if tuple.value != first {
            self.found.push(Anomaly::NonRepeatableRead(NonRepeatableRead {
                execution: self.number,
                row,
                first,
                second: tuple.value,
            }));
        }
        self.check_dirty(&tuple);
        Ok(())
    }

    fn check(&mut self, row: TupleId, pass: Pass) -> TransactionResult<()> {
        match pass {
            Pass::First => self.check_first(row),
            Pass::Second => self.check_second(row),
        }
    }

    fn check_all(&mut self, targets: &Targets<'_>) -> TransactionResult<()> {
        for (row, pass) in targets.visits() {
            self.check(row, pass)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Second,
}

enum Targets<'a> {
    All(usize),
    Rows(&'a [TupleId]),
}

impl<'a> Targets<'a> {
    /// 检查顺序：多点读取逐行连续检查两次，全表扫描先完整扫一遍再扫第二遍
    fn visits(&self) -> Box<dyn Iterator<Item = (TupleId, Pass)> + '_> {
        match self {
            Targets::All(n) => {
                let n = *n;
                Box::new((0..n).map(|row| (row, Pass::First)).chain((0..n).map(|row| (row, Pass::Second))))
            }
            Targets::Rows(rows) => Box::new(
                rows.iter()
                    .flat_map(|&row| [(row, Pass::First), (row, Pass::Second)]),
            ),
        }
    }

    /// 需要加锁的不同行
    fn distinct(&self) -> Box<dyn Iterator<Item = TupleId> + '_> {
        match self {
            Targets::All(n) => Box::new(0..*n),
            Targets::Rows(rows) => Box::new(rows.iter().copied().collect::<BTreeSet<_>>().into_iter()),
        }
    }
}

impl Transaction {
    fn reader_state(&self) -> Option<&ReaderState> {
        self.as_reader()
    }

    /// 执行一次读取（两遍），返回本次发现的异常数。
    ///
    /// 被回滚时返回 Wounded，本次发现的异常全部丢弃
    pub fn execute_read(self: &Arc<Self>, table: &dyn LockingTable) -> TransactionResult<usize> {
        let Some(state) = self.reader_state() else {
            return Ok(0);
        };
        let Some(shape) = ReadShape::from_kind(self.kind()) else {
            return Ok(0);
        };
        let targets = match shape {
            ReadShape::MultiPoint => Targets::Rows(state.targets()),
            ReadShape::FullScan => Targets::All(table.num_tuples()),
        };
        let level = table.isolation_level();
        let strategy = ReadStrategy::select(shape, level);

        let mut first_pass = state.first_pass.lock();
        if first_pass.len() != table.num_tuples() {
            first_pass.resize(table.num_tuples(), 0.0);
        }

        let mut exec = Execution {
            tx: self.as_ref(),
            table,
            number: state.executions(),
            first_pass: &mut first_pass,
            found: Vec::new(),
            guarded: matches!(strategy, ReadStrategy::LockPerRead | ReadStrategy::LockAllUpFront),
        };

        match strategy {
            ReadStrategy::Unlocked => exec.check_all(&targets)?,
            ReadStrategy::LockPerRead => {
                for (row, pass) in targets.visits() {
                    table.get_read_lock(row, self)?;
                    let checked = exec.check(row, pass);
                    self.release_read(table, row);
                    checked?;
                }
            }
            ReadStrategy::LockAllUpFront => {
                for row in targets.distinct() {
                    if let Err(err) = table.get_read_lock(row, self) {
                        self.release_all_reads(table);
                        return Err(err);
                    }
                }
                let checked = exec.check_all(&targets);
                self.release_all_reads(table);
                checked?;
            }
            ReadStrategy::TableLocked => {
                table.get_table_lock();
                let checked = exec.check_all(&targets);
                table.release_table_lock();
                checked?;
            }
        }

        let found = std::mem::take(&mut exec.found);
        drop(exec);
        drop(first_pass);
        Ok(self.record_anomalies(table, level, found))
    }

    fn record_anomalies(&self, table: &dyn LockingTable, level: IsolationLevel, found: Vec<Anomaly>) -> usize {
        let Some(state) = self.reader_state() else {
            return 0;
        };
        let number = state.executions.fetch_add(1, Ordering::Relaxed);
        table.metrics().record_reader_execution();

        let metrics = table.metrics();
        let mut dirty = 0;
        let mut non_repeatable = 0;
        let count = found.len();
        let mut log = state.anomalies.lock();
        for anomaly in found {
            match &anomaly {
                Anomaly::DirtyRead(_) => {
                    dirty += 1;
                    metrics.record_dirty_read();
                    if !level.tolerates_dirty_reads() {
                        metrics.record_violation();
                    }
                }
                Anomaly::NonRepeatableRead(_) => {
                    non_repeatable += 1;
                    metrics.record_non_repeatable_read();
                    if !level.tolerates_non_repeatable_reads() {
                        metrics.record_violation();
                    }
                }
            }
            log.push(anomaly);
        }

        if dirty > 0 {
            if level.tolerates_dirty_reads() {
                debug!("{} found uncommitted data {} [OK for this level]", self, dirty);
            } else {
                error!("{} found uncommitted data {} under {}", self, dirty, level);
            }
        }
        if non_repeatable > 0 {
            if level.tolerates_non_repeatable_reads() {
                debug!("{} found non-repeatable reads {} [OK for this level]", self, non_repeatable);
            } else {
                error!("{} found non-repeatable reads {} under {}", self, non_repeatable, level);
            }
        }
        debug!(tx = %self, execution = number, anomalies = count, "reader finished query");
        count
    }

    /// 读事务线程主体：在仍有写事务未结束时反复读取
    pub fn run_reader(self: &Arc<Self>, table: &dyn LockingTable) -> ReaderOutcome {
        let Some(state) = self.reader_state() else {
            return ReaderOutcome { executions: 0, wounded: false };
        };
        if ReadShape::from_kind(self.kind()).is_none() {
            debug!("{} has nothing to read", self);
            return ReaderOutcome { executions: 0, wounded: false };
        }

        let mut wounded = false;
        while table.metrics().writers_pending() {
            if let Err(err) = self.execute_read(table) {
                info!("{} stopped: {}", self, err);
                wounded = true;
                break;
            }
        }

        ReaderOutcome {
            executions: state.executions(),
            wounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::table::{StandardLockingTable, TableCore};
    use std::time::Duration;

    fn table(level: IsolationLevel) -> StandardLockingTable {
        StandardLockingTable::with_values(
            TableConfig::default()
                .with_tuples(8)
                .with_tasks(4)
                .with_isolation_level(level)
                .with_lock_timeout(Duration::from_millis(20))
                .with_write_cost(Duration::ZERO),
            |id| id as f64,
        )
    }

    fn no_hook(_: &StandardLockingTable, _: usize) {}

    /// 记录读取顺序，并在每次读取前执行 `before_read(表, 已读次数)`
    struct HookedTable<F> {
        inner: StandardLockingTable,
        reads: Mutex<Vec<TupleId>>,
        before_read: F,
    }

    impl<F: Fn(&StandardLockingTable, usize) + Send + Sync> HookedTable<F> {
        fn new(inner: StandardLockingTable, before_read: F) -> Self {
            Self {
                inner,
                reads: Mutex::new(Vec::new()),
                before_read,
            }
        }

        fn reads(&self) -> Vec<TupleId> {
            self.reads.lock().clone()
        }
    }

    impl<F: Fn(&StandardLockingTable, usize) + Send + Sync> LockingTable for HookedTable<F> {
        fn core(&self) -> &TableCore {
            self.inner.core()
        }

        fn get_read_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()> {
            self.inner.get_read_lock(row, requester)
        }

        fn get_write_lock(&self, row: TupleId, requester: &Arc<Transaction>) -> TransactionResult<()> {
            self.inner.get_write_lock(row, requester)
        }

        fn release_read_lock(&self, row: TupleId, holder_id: u64) {
            self.inner.release_read_lock(row, holder_id);
        }

        fn release_write_lock(&self, row: TupleId, holder_id: u64) {
            self.inner.release_write_lock(row, holder_id);
        }

        fn get_tuple(&self, row: TupleId) -> Row {
            let seen = {
                let mut reads = self.reads.lock();
                reads.push(row);
                reads.len() - 1
            };
            (self.before_read)(&self.inner, seen);
            self.inner.get_tuple(row)
        }
    }

    #[test]
    fn test_strategy_dispatch() {
        for shape in [ReadShape::MultiPoint, ReadShape::FullScan] {
            assert_eq!(ReadStrategy::select(shape, IsolationLevel::ReadUncommitted), ReadStrategy::Unlocked);
            assert_eq!(ReadStrategy::select(shape, IsolationLevel::ReadCommitted), ReadStrategy::LockPerRead);
            assert_eq!(ReadStrategy::select(shape, IsolationLevel::RepeatableRead), ReadStrategy::LockAllUpFront);
            assert_eq!(ReadStrategy::select(shape, IsolationLevel::Serializable), ReadStrategy::TableLocked);
        }
        assert_eq!(ReadShape::from_kind(TransactionKind::Write), None);
    }

    #[test]
    fn test_clean_read_all_levels() {
        for level in IsolationLevel::ALL {
            let table = table(level);
            let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
            assert_eq!(reader.execute_read(&table).unwrap(), 0);
            assert_eq!(reader.held_lock_count(), 0);
            assert_eq!(reader.as_reader().unwrap().executions(), 1);
        }
    }

    #[test]
    fn test_dirty_read_detected_under_read_uncommitted() {
        let table = table(IsolationLevel::ReadUncommitted);
        let writer = Transaction::writer(9, TransactionKind::Write, vec![3]);
        table.register_writer(&writer);
        table.update(3, 9, 99.0);

        let reader = Transaction::reader(1, TransactionKind::MultiPointRead, vec![3]);
        assert_eq!(reader.execute_read(&table).unwrap(), 2);

        let log = reader.as_reader().unwrap().anomalies();
        assert_eq!(log.dirty_reads.len(), 2);
        assert_eq!(log.dirty_reads[0].writer, 9);
        assert_eq!(table.metrics().snapshot().dirty_reads, 2);
        assert_eq!(table.metrics().violations(), 0);
    }

    #[test]
    fn test_point_read_checks_each_row_twice_in_a_row() {
        for level in IsolationLevel::ALL {
            let table = HookedTable::new(table(level), no_hook);
            let reader = Transaction::reader(1, TransactionKind::MultiPointRead, vec![3, 5]);
            assert_eq!(reader.execute_read(&table).unwrap(), 0);
            assert_eq!(table.reads(), vec![3, 3, 5, 5], "{}", level);
        }
    }

    #[test]
    fn test_full_scan_reads_two_separate_passes() {
        for level in IsolationLevel::ALL {
            let table = HookedTable::new(table(level), no_hook);
            let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
            assert_eq!(reader.execute_read(&table).unwrap(), 0);
            let expected: Vec<TupleId> = (0..8).chain(0..8).collect();
            assert_eq!(table.reads(), expected, "{}", level);
        }
    }

    #[test]
    fn test_non_repeatable_read_tolerated_under_read_uncommitted() {
        // 第一遍读过第 0 行之后改写它
        let table = HookedTable::new(
            table(IsolationLevel::ReadUncommitted),
            |inner: &StandardLockingTable, seen: usize| {
                if seen == 1 {
                    inner.restore(&Row::new(0, 77.0), 0);
                }
            },
        );
        let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
        assert_eq!(reader.execute_read(&table).unwrap(), 1);

        let log = reader.as_reader().unwrap().anomalies();
        assert!(log.dirty_reads.is_empty());
        assert_eq!(
            log.non_repeatable_reads,
            vec![NonRepeatableRead {
                execution: 0,
                row: 0,
                first: 0.0,
                second: 77.0,
            }]
        );
        let snapshot = table.metrics().snapshot();
        assert_eq!(snapshot.non_repeatable_reads, 1);
        assert_eq!(snapshot.violations, 0);
    }

    #[test]
    fn test_non_repeatable_read_is_violation_under_repeatable_read() {
        // 绕过读锁直接改写，模拟锁失效
        let table = HookedTable::new(
            table(IsolationLevel::RepeatableRead),
            |inner: &StandardLockingTable, seen: usize| {
                if seen == 3 {
                    inner.restore(&Row::new(2, -1.0), 2);
                }
            },
        );
        let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
        assert_eq!(reader.execute_read(&table).unwrap(), 1);

        let log = reader.as_reader().unwrap().anomalies();
        assert_eq!(log.non_repeatable_reads.len(), 1);
        assert_eq!(log.non_repeatable_reads[0].row, 2);
        assert_eq!(log.non_repeatable_reads[0].second, -1.0);
        assert_eq!(table.metrics().violations(), 1);
    }

    #[test]
    fn test_dirty_read_is_violation_under_read_committed() {
        let table = table(IsolationLevel::ReadCommitted);
        let writer = Transaction::writer(9, TransactionKind::Write, vec![4]);
        table.register_writer(&writer);
        // 未持有写锁的写入，读锁拦不住
        table.update(4, 9, 40.0);

        let reader = Transaction::reader(1, TransactionKind::MultiPointRead, vec![4]);
        assert_eq!(reader.execute_read(&table).unwrap(), 2);

        let log = reader.as_reader().unwrap().anomalies();
        assert_eq!(log.dirty_reads.len(), 2);
        assert!(log.dirty_reads.iter().all(|a| a.row == 4 && a.writer == 9));
        assert!(table.metrics().violations() > 0);
        assert_eq!(reader.held_lock_count(), 0);
    }

    #[test]
    fn test_anomalies_of_wounded_execution_discarded() {
        let inner = table(IsolationLevel::ReadCommitted);
        let writer = Transaction::writer(9, TransactionKind::Write, vec![3]);
        inner.register_writer(&writer);
        inner.update(3, 9, 30.0);

        let reader = Transaction::reader(1, TransactionKind::MultiPointRead, vec![3, 5]);
        let victim = Arc::clone(&reader);
        // 第一次检查已发现脏读，第二次检查前读事务被回滚
        let table = HookedTable::new(inner, move |inner: &StandardLockingTable, seen: usize| {
            if seen == 1 {
                victim.rollback(inner);
            }
        });

        assert_eq!(
            reader.execute_read(&table),
            Err(crate::transactions::TransactionError::Wounded { tx_id: 1 })
        );
        assert!(reader.as_reader().unwrap().anomalies().is_empty());
        assert_eq!(reader.as_reader().unwrap().executions(), 0);
        let snapshot = table.metrics().snapshot();
        assert_eq!(snapshot.dirty_reads, 0);
        assert_eq!(snapshot.violations, 0);
        assert_eq!(reader.held_lock_count(), 0);
        assert!(table.holders(3).is_empty());
    }

    #[test]
    fn test_duplicate_point_targets_locked_once() {
        let table = table(IsolationLevel::RepeatableRead);
        let reader = Transaction::reader(1, TransactionKind::MultiPointRead, vec![2, 2, 5]);
        assert_eq!(reader.execute_read(&table).unwrap(), 0);
        assert_eq!(reader.held_lock_count(), 0);
        assert_eq!(table.metrics().snapshot().reader_executions, 1);
    }

    #[test]
    fn test_reader_without_pending_writers_returns_immediately() {
        let table = table(IsolationLevel::ReadCommitted);
        let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
        let outcome = reader.run_reader(&table);
        assert_eq!(outcome, ReaderOutcome { executions: 0, wounded: false });
    }

    #[test]
    fn test_wounded_reader_stops() {
        let table = table(IsolationLevel::RepeatableRead);
        table.metrics().set_writers_submitted(1);
        let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());
        reader.rollback(&table);

        let outcome = reader.run_reader(&table);
        assert!(outcome.wounded);
        assert_eq!(outcome.executions, 0);
    }
}
