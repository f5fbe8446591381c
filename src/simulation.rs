//! 模拟驱动
//!
//! 构造锁表，生成一批随机类型的事务，每个事务一个工作线程，
//! 等待全部结束后汇总为 RunReport。

use crate::config::{ConfigError, SimulationConfig, TableVariant};
use crate::table::{
    InstrumentedLockingTable, LockingTable, MetricsSnapshot, OptimizedLockingTable,
    StandardLockingTable,
};
use crate::transactions::{IsolationLevel, ReaderOutcome, Transaction, WriterOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

/// 模拟运行错误
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),
}

/// 按配置构造锁表
pub fn build_table(config: &SimulationConfig) -> Arc<dyn LockingTable> {
    let table_config = config.table_config();
    match config.variant {
        TableVariant::Standard => Arc::new(StandardLockingTable::new(table_config)),
        TableVariant::Optimized => Arc::new(OptimizedLockingTable::new(table_config)),
        TableVariant::Instrumented => Arc::new(InstrumentedLockingTable::new(
            StandardLockingTable::new(table_config),
        )),
    }
}

enum TaskOutcome {
    Reader(ReaderOutcome),
    Writer(WriterOutcome),
}

/// 一次运行的汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub variant: TableVariant,
    pub isolation_level: IsolationLevel,
    pub num_tuples: usize,
    pub num_tasks: usize,
    pub elapsed_ms: u64,
    pub committed_writers: usize,
    pub aborted_writers: usize,
    pub skipped_writers: usize,
    pub wounded_readers: usize,
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    /// 没有出现当前隔离级别不允许的异常
    pub fn is_consistent(&self) -> bool {
        self.metrics.violations == 0
    }

    pub fn writers(&self) -> usize {
        self.committed_writers + self.aborted_writers + self.skipped_writers
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} table, {} ===", self.variant, self.isolation_level)?;
        writeln!(f, "Tuples: {}, tasks: {}", self.num_tuples, self.num_tasks)?;
        writeln!(f, "Elapsed: {}ms", self.elapsed_ms)?;
        writeln!(
            f,
            "Transactions: {} multi-point reads, {} full scans, {} writes",
            self.metrics.multi_point_reads, self.metrics.full_scan_reads, self.metrics.writes
        )?;
        writeln!(
            f,
            "Writers: {} committed, {} aborted, {} skipped",
            self.committed_writers, self.aborted_writers, self.skipped_writers
        )?;
        writeln!(
            f,
            "Readers: {} executions, {} wounded",
            self.metrics.reader_executions, self.wounded_readers
        )?;
        writeln!(
            f,
            "Anomalies: {} dirty reads, {} non-repeatable reads, {} violations",
            self.metrics.dirty_reads, self.metrics.non_repeatable_reads, self.metrics.violations
        )?;
        write!(f, "{}", self.metrics)
    }
}

/// 模拟器
pub struct Simulation {
    config: SimulationConfig,
    table: Arc<dyn LockingTable>,
    next_id: AtomicU64,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let table = build_table(&config);
        Ok(Self {
            config,
            table,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<dyn LockingTable> {
        &self.table
    }

    fn create_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut rng = rand::thread_rng();
        (0..self.config.num_tasks)
            .map(|_| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Transaction::random(
                    id,
                    self.config.num_tuples,
                    self.config.rows_per_point_read,
                    self.config.effective_rows_per_writer(),
                    &mut rng,
                )
            })
            .collect()
    }

    fn spawn_worker(&self, tx: Arc<Transaction>) -> std::io::Result<JoinHandle<TaskOutcome>> {
        let table = Arc::clone(&self.table);
        let name = format!("task-{}", tx.id());
        thread::Builder::new().name(name).spawn(move || {
            if tx.is_reader() {
                TaskOutcome::Reader(tx.run_reader(table.as_ref()))
            } else {
                TaskOutcome::Writer(tx.run_writer(table.as_ref()))
            }
        })
    }

    /// 运行一轮：所有事务并发执行，直到全部线程结束
    pub fn run(&self) -> Result<RunReport, SimulationError> {
        let metrics = self.table.metrics();
        metrics.reset();
        self.table.core().clear_writers();

        let transactions = self.create_transactions();
        let writers = transactions.iter().filter(|tx| !tx.is_reader()).count();
        for tx in &transactions {
            metrics.record_kind(tx.kind());
        }
        // 读事务以写事务全部结束为退出条件，必须在启动任何线程前发布
        metrics.set_writers_submitted(writers as u64);
        info!(
            variant = %self.config.variant,
            isolation = %self.config.isolation_level,
            tasks = transactions.len(),
            writers,
            "starting run"
        );

        let start = Instant::now();
        let mut handles = Vec::with_capacity(transactions.len());
        let mut spawn_error = None;
        for tx in transactions {
            if spawn_error.is_some() {
                // 未启动的写事务也要计为已结束，否则读事务不会退出
                if !tx.is_reader() {
                    metrics.record_writer_finished();
                }
                continue;
            }
            let is_writer = !tx.is_reader();
            let name = format!("task-{}", tx.id());
            match self.spawn_worker(tx) {
                Ok(handle) => handles.push((name, handle)),
                Err(err) => {
                    error!(%err, "failed to spawn {}", name);
                    if is_writer {
                        metrics.record_writer_finished();
                    }
                    spawn_error = Some(err);
                }
            }
        }

        let mut report = RunReport {
            variant: self.config.variant,
            isolation_level: self.config.isolation_level,
            num_tuples: self.config.num_tuples,
            num_tasks: self.config.num_tasks,
            elapsed_ms: 0,
            committed_writers: 0,
            aborted_writers: 0,
            skipped_writers: 0,
            wounded_readers: 0,
            metrics: MetricsSnapshot::default(),
        };
        let mut panicked = None;
        for (name, handle) in handles {
            match handle.join() {
                Ok(TaskOutcome::Writer(WriterOutcome::Committed)) => report.committed_writers += 1,
                Ok(TaskOutcome::Writer(WriterOutcome::Aborted)) => report.aborted_writers += 1,
                Ok(TaskOutcome::Writer(WriterOutcome::Skipped)) => report.skipped_writers += 1,
                Ok(TaskOutcome::Reader(outcome)) => {
                    if outcome.wounded {
                        report.wounded_readers += 1;
                    }
                }
                Err(_) => {
                    error!("worker {} panicked", name);
                    panicked.get_or_insert(name);
                }
            }
        }

        if let Some(err) = spawn_error {
            return Err(SimulationError::Spawn(err));
        }
        if let Some(name) = panicked {
            return Err(SimulationError::WorkerPanicked(name));
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        report.metrics = metrics.snapshot();
        info!(
            elapsed_ms = report.elapsed_ms,
            violations = report.metrics.violations,
            "run finished"
        );
        Ok(report)
    }
}

/// 不同并发负载下的对比运行（读已提交，计时锁表）
pub fn load_test(loads: &[usize], base: &SimulationConfig) -> Result<Vec<RunReport>, SimulationError> {
    let mut reports = Vec::with_capacity(loads.len());
    for &load in loads {
        info!("Testing with {} concurrent transactions", load);
        let config = base
            .clone()
            .with_tasks(load)
            .with_variant(TableVariant::Instrumented)
            .with_isolation_level(IsolationLevel::ReadCommitted);
        reports.push(Simulation::new(config)?.run()?);
    }
    Ok(reports)
}
