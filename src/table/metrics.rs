//! 锁表统计模块
//!
//! 提供加锁等待、更新耗时、事务完成数等计数器，运行开始时重置，结束后读取

use crate::transactions::TransactionKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 锁表统计信息
#[derive(Debug, Default)]
pub struct TableMetrics {
    lock_attempts: AtomicU64,
    failed_lock_attempts: AtomicU64,
    lock_wait_ns: AtomicU64,
    update_ns: AtomicU64,
    wounds: AtomicU64,
    multi_point_reads: AtomicU64,
    full_scan_reads: AtomicU64,
    writes: AtomicU64,
    writers_submitted: AtomicU64,
    finished_writers: AtomicU64,
    reader_executions: AtomicU64,
    dirty_reads: AtomicU64,
    non_repeatable_reads: AtomicU64,
    violations: AtomicU64,
}

impl TableMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重置全部计数器
    pub fn reset(&self) {
        for counter in [
            &self.lock_attempts,
            &self.failed_lock_attempts,
            &self.lock_wait_ns,
            &self.update_ns,
            &self.wounds,
            &self.multi_point_reads,
            &self.full_scan_reads,
            &self.writes,
            &self.writers_submitted,
            &self.finished_writers,
            &self.reader_executions,
            &self.dirty_reads,
            &self.non_repeatable_reads,
            &self.violations,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn record_lock_attempt(&self) {
        self.lock_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次超时未获得锁
    pub fn record_failed_attempt(&self) {
        self.failed_lock_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lock_wait_ns(&self, ns: u64) {
        self.lock_wait_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn add_update_ns(&self, ns: u64) {
        self.update_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn record_wound(&self) {
        self.wounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kind(&self, kind: TransactionKind) {
        let counter = match kind {
            TransactionKind::MultiPointRead => &self.multi_point_reads,
            TransactionKind::FullScanRead => &self.full_scan_reads,
            TransactionKind::Write => &self.writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_writers_submitted(&self, count: u64) {
        self.writers_submitted.store(count, Ordering::SeqCst);
    }

    pub fn writers_submitted(&self) -> u64 {
        self.writers_submitted.load(Ordering::SeqCst)
    }

    /// 记录一个写事务结束（提交、跳过或被回滚），返回结束的序号
    pub fn record_writer_finished(&self) -> u64 {
        self.finished_writers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn finished_writers(&self) -> u64 {
        self.finished_writers.load(Ordering::SeqCst)
    }

    /// 读事务的循环条件：仍有写事务未结束
    pub fn writers_pending(&self) -> bool {
        self.finished_writers() < self.writers_submitted()
    }

    pub fn record_reader_execution(&self) {
        self.reader_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dirty_read(&self) {
        self.dirty_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_non_repeatable_read(&self) {
        self.non_repeatable_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录违反当前隔离级别的异常
    pub fn record_violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    pub fn wounds(&self) -> u64 {
        self.wounds.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lock_attempts: self.lock_attempts.load(Ordering::Relaxed),
            failed_lock_attempts: self.failed_lock_attempts.load(Ordering::Relaxed),
            lock_wait_ns: self.lock_wait_ns.load(Ordering::Relaxed),
            update_ns: self.update_ns.load(Ordering::Relaxed),
            wounds: self.wounds.load(Ordering::Relaxed),
            multi_point_reads: self.multi_point_reads.load(Ordering::Relaxed),
            full_scan_reads: self.full_scan_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            writers_submitted: self.writers_submitted(),
            finished_writers: self.finished_writers(),
            reader_executions: self.reader_executions.load(Ordering::Relaxed),
            dirty_reads: self.dirty_reads.load(Ordering::Relaxed),
            non_repeatable_reads: self.non_repeatable_reads.load(Ordering::Relaxed),
            violations: self.violations(),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub lock_attempts: u64,
    pub failed_lock_attempts: u64,
    pub lock_wait_ns: u64,
    pub update_ns: u64,
    pub wounds: u64,
    pub multi_point_reads: u64,
    pub full_scan_reads: u64,
    pub writes: u64,
    pub writers_submitted: u64,
    pub finished_writers: u64,
    pub reader_executions: u64,
    pub dirty_reads: u64,
    pub non_repeatable_reads: u64,
    pub violations: u64,
}

impl MetricsSnapshot {
    /// 平均每次加锁的等待时间（毫秒）
    pub fn avg_lock_wait_ms(&self) -> f64 {
        if self.lock_attempts == 0 {
            0.0
        } else {
            self.lock_wait_ns as f64 / self.lock_attempts as f64 / 1_000_000.0
        }
    }

    /// 锁竞争率（百分比）
    pub fn contention_rate(&self) -> f64 {
        if self.lock_attempts == 0 {
            0.0
        } else {
            self.failed_lock_attempts as f64 * 100.0 / self.lock_attempts as f64
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total lock wait time: {}ms", self.lock_wait_ns / 1_000_000)?;
        writeln!(f, "Average lock wait time: {:.3}ms per attempt", self.avg_lock_wait_ms())?;
        writeln!(f, "Total update time: {}ms", self.update_ns / 1_000_000)?;
        writeln!(f, "Lock attempts: {}", self.lock_attempts)?;
        writeln!(f, "Failed lock attempts: {}", self.failed_lock_attempts)?;
        writeln!(f, "Lock contention rate: {:.2}%", self.contention_rate())?;
        write!(f, "Wounded transactions: {}", self.wounds)
    }
}
