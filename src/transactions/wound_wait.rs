// wound-wait 死锁避免模块
//
// 加锁超时后，查询持有者登记表，按时间戳决定是否回滚当前持有者：
// - 偏向老事务：较老（时间戳小）的请求者回滚较年轻的持有者
// - 偏向新事务：比较方向相反
// 请求者自己从不因比较失败而中止，只是继续等待。
//
// 持有者登记表是尽力而为的索引，只用于冲突判定，互斥由锁原语保证

use crate::table::{LockingTable, TupleId};
use crate::transactions::{LockType, Transaction};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 冲突裁决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WoundWaitPolicy {
    /// 老事务获胜
    FavorOlder,
    /// 新事务获胜
    FavorYounger,
}

impl WoundWaitPolicy {
    pub fn from_favor_older(favor_older: bool) -> Self {
        if favor_older {
            WoundWaitPolicy::FavorOlder
        } else {
            WoundWaitPolicy::FavorYounger
        }
    }

    pub fn favors_older(&self) -> bool {
        matches!(self, WoundWaitPolicy::FavorOlder)
    }

    /// 请求者是否胜出（即持有者应被回滚）
    pub fn should_wound(&self, requester_ts: u64, holder_ts: u64) -> bool {
        match self {
            WoundWaitPolicy::FavorOlder => requester_ts < holder_ts,
            WoundWaitPolicy::FavorYounger => requester_ts > holder_ts,
        }
    }

    /// 两个冲突事务中的失败者时间戳；时间戳相同则没有失败者
    pub fn loser(&self, a_ts: u64, b_ts: u64) -> Option<u64> {
        if self.should_wound(a_ts, b_ts) {
            Some(b_ts)
        } else if self.should_wound(b_ts, a_ts) {
            Some(a_ts)
        } else {
            None
        }
    }

    /// 被回滚一方的描述，用于日志
    fn victim_label(&self) -> &'static str {
        match self {
            WoundWaitPolicy::FavorOlder => "younger",
            WoundWaitPolicy::FavorYounger => "older",
        }
    }
}

/// 持有者登记表：行 → 按授予顺序登记的持有事务
///
/// 共享读锁可以有多个持有者，释放时只移除释放者自己的登记
#[derive(Default)]
pub struct HolderRegistry {
    holders: RwLock<HashMap<TupleId, Vec<Arc<Transaction>>>>,
}

impl HolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_holder(&self, row: TupleId, tx: Arc<Transaction>) {
        self.holders.write().entry(row).or_default().push(tx);
    }

    /// 最近登记的持有者；返回克隆的句柄，调用者不持有登记表的锁
    pub fn holder(&self, row: TupleId) -> Option<Arc<Transaction>> {
        self.holders.read().get(&row).and_then(|h| h.last().cloned())
    }

    /// 该行全部登记的持有者
    pub fn holders(&self, row: TupleId) -> Vec<Arc<Transaction>> {
        self.holders.read().get(&row).cloned().unwrap_or_default()
    }

    /// 移除 `tx_id` 在该行的一条登记
    pub fn remove_holder(&self, row: TupleId, tx_id: u64) {
        let mut holders = self.holders.write();
        if let Some(list) = holders.get_mut(&row) {
            if let Some(pos) = list.iter().position(|h| h.id() == tx_id) {
                list.remove(pos);
            }
            if list.is_empty() {
                holders.remove(&row);
            }
        }
    }

    /// 有登记持有者的行数
    pub fn len(&self) -> usize {
        self.holders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.read().is_empty()
    }
}

/// 一次冲突处理的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// 登记表中没有存活的持有者（释放与登记之间的竞争），继续重试
    NoHolder,
    /// 除已回滚的事务外，登记的持有者只有请求者自己
    SelfHeld,
    /// 请求者比较失败，继续等待
    Wait { holder_id: u64 },
    /// 这些持有者已被回滚
    Wounded { holder_ids: Vec<u64> },
}

/// 加锁超时后的冲突处理：回滚所有比较失败的持有者
pub fn resolve_conflict(
    table: &dyn LockingTable,
    row: TupleId,
    requester: &Arc<Transaction>,
    lock_type: LockType,
) -> ConflictOutcome {
    let holders = table.holders(row);
    if holders.is_empty() {
        debug!(tx = %requester, row, %lock_type, "lock wait timed out without a registered holder");
        return ConflictOutcome::NoHolder;
    }

    // 已被回滚的持有者正在归还锁，不再参与裁决
    let others: Vec<&Arc<Transaction>> = holders
        .iter()
        .filter(|h| !Arc::ptr_eq(*h, requester) && !h.is_wounded())
        .collect();
    if others.is_empty() {
        if holders.iter().any(|h| Arc::ptr_eq(h, requester)) {
            return ConflictOutcome::SelfHeld;
        }
        debug!(tx = %requester, row, %lock_type, "only wounded holders remain registered");
        return ConflictOutcome::NoHolder;
    }

    let policy = table.core().policy();
    let mut wounded = Vec::new();
    let mut blocker = None;
    for holder in others {
        if policy.should_wound(requester.timestamp(), holder.timestamp()) {
            info!(
                "Aborting {} transaction {} for {} on tuple {}",
                policy.victim_label(),
                holder,
                requester,
                row
            );
            table.metrics().record_wound();
            holder.rollback(table);
            wounded.push(holder.id());
        } else {
            blocker.get_or_insert(holder);
        }
    }

    if !wounded.is_empty() {
        return ConflictOutcome::Wounded { holder_ids: wounded };
    }
    match blocker {
        Some(holder) => {
            debug!("{} waiting for {} lock of tuple {} held by {}. Deadlock?", requester, lock_type, row, holder);
            ConflictOutcome::Wait {
                holder_id: holder.id(),
            }
        }
        None => ConflictOutcome::SelfHeld,
    }
}
