// 锁原语模块
//
// 提供两种行级锁原语，均为公平（FIFO）且支持超时：
// - FairSemaphore：计数信号量，读锁占 1 个许可，写锁占全部许可
// - FairRwLock：公平读写锁，读者数量不受容量限制
//
// 原语本身不记录持有者，释放可以发生在任意线程（回滚由冲突方执行）

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::error;

/// 锁类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// 读锁（共享锁）
    Read,
    /// 写锁（排他锁）
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "READ"),
            LockType::Write => write!(f, "WRITE"),
        }
    }
}

/// 行级锁原语
///
/// `try_lock_for` 在超时内获取成功返回 true；`unlock` 归还一次成功获取
pub trait RowLockPrimitive: Send + Sync {
    fn try_lock_for(&self, lock_type: LockType, timeout: Duration) -> bool;
    fn unlock(&self, lock_type: LockType);
}

/// 等待队列：按到达顺序发放票号，只有队首可以被授予
#[derive(Debug, Default)]
struct WaitQueue {
    tickets: VecDeque<u64>,
    next_ticket: u64,
}

impl WaitQueue {
    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.tickets.push_back(ticket);
        ticket
    }

    fn is_head(&self, ticket: u64) -> bool {
        self.tickets.front() == Some(&ticket)
    }

    fn remove(&mut self, ticket: u64) {
        self.tickets.retain(|&t| t != ticket);
    }

    fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    fn len(&self) -> usize {
        self.tickets.len()
    }
}

#[derive(Debug)]
struct SemaphoreState {
    permits: usize,
    queue: WaitQueue,
}

/// 公平计数信号量
#[derive(Debug)]
pub struct FairSemaphore {
    capacity: usize,
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

impl FairSemaphore {
    /// 创建容量为 `capacity` 的信号量（全部许可可用）
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(SemaphoreState {
                permits: capacity,
                queue: WaitQueue::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前可用许可数
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// 正在排队的请求数
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 在超时内获取 n 个许可
    pub fn try_acquire_for(&self, n: usize, timeout: Duration) -> bool {
        self.acquire_until(n, Some(Instant::now() + timeout))
    }

    /// 阻塞直到获取 n 个许可
    pub fn acquire(&self, n: usize) {
        self.acquire_until(n, None);
    }

    fn acquire_until(&self, n: usize, deadline: Option<Instant>) -> bool {
        if n > self.capacity {
            return false;
        }

        let mut state = self.state.lock();
        if state.queue.is_empty() && state.permits >= n {
            state.permits -= n;
            return true;
        }

        let ticket = state.queue.enqueue();
        loop {
            if state.queue.is_head(ticket) && state.permits >= n {
                state.queue.remove(ticket);
                state.permits -= n;
                // 后续排队者可能也能被满足（例如连续的读者）
                self.cond.notify_all();
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        if state.queue.is_head(ticket) && state.permits >= n {
                            state.queue.remove(ticket);
                            state.permits -= n;
                            self.cond.notify_all();
                            return true;
                        }
                        state.queue.remove(ticket);
                        self.cond.notify_all();
                        return false;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// 归还 n 个许可
    pub fn release(&self, n: usize) {
        let mut state = self.state.lock();
        state.permits += n;
        if state.permits > self.capacity {
            error!(
                permits = state.permits,
                capacity = self.capacity,
                "semaphore released more permits than it owns"
            );
            state.permits = self.capacity;
        }
        self.cond.notify_all();
    }
}

impl RowLockPrimitive for FairSemaphore {
    fn try_lock_for(&self, lock_type: LockType, timeout: Duration) -> bool {
        match lock_type {
            LockType::Read => self.try_acquire_for(1, timeout),
            LockType::Write => self.try_acquire_for(self.capacity, timeout),
        }
    }

    fn unlock(&self, lock_type: LockType) {
        match lock_type {
            LockType::Read => self.release(1),
            LockType::Write => self.release(self.capacity),
        }
    }
}

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
    queue: WaitQueue,
}

impl RwState {
    fn grantable(&self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Read => !self.writer,
            LockType::Write => !self.writer && self.readers == 0,
        }
    }

    fn grant(&mut self, lock_type: LockType) {
        match lock_type {
            LockType::Read => self.readers += 1,
            LockType::Write => self.writer = true,
        }
    }
}

/// 公平读写锁
///
/// 排队中的写者会挡住后到的读者，因此写者不会饿死
#[derive(Debug, Default)]
pub struct FairRwLock {
    state: Mutex<RwState>,
    cond: Condvar,
}

impl FairRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_read_for(&self, timeout: Duration) -> bool {
        self.acquire_until(LockType::Read, Instant::now() + timeout)
    }

    pub fn try_write_for(&self, timeout: Duration) -> bool {
        self.acquire_until(LockType::Write, Instant::now() + timeout)
    }

    pub fn unlock_read(&self) {
        let mut state = self.state.lock();
        if state.readers == 0 {
            error!("read unlock on a lock without readers");
            return;
        }
        state.readers -= 1;
        self.cond.notify_all();
    }

    pub fn unlock_write(&self) {
        let mut state = self.state.lock();
        if !state.writer {
            error!("write unlock on a lock that is not write-locked");
            return;
        }
        state.writer = false;
        self.cond.notify_all();
    }

    /// 当前读者数
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    fn acquire_until(&self, lock_type: LockType, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if state.queue.is_empty() && state.grantable(lock_type) {
            state.grant(lock_type);
            return true;
        }

        let ticket = state.queue.enqueue();
        loop {
            if state.queue.is_head(ticket) && state.grantable(lock_type) {
                state.queue.remove(ticket);
                state.grant(lock_type);
                self.cond.notify_all();
                return true;
            }

            if self.cond.wait_until(&mut state, deadline).timed_out() {
                let granted = state.queue.is_head(ticket) && state.grantable(lock_type);
                state.queue.remove(ticket);
                if granted {
                    state.grant(lock_type);
                }
                self.cond.notify_all();
                return granted;
            }
        }
    }
}

impl RowLockPrimitive for FairRwLock {
    fn try_lock_for(&self, lock_type: LockType, timeout: Duration) -> bool {
        self.acquire_until(lock_type, Instant::now() + timeout)
    }

    fn unlock(&self, lock_type: LockType) {
        match lock_type {
            LockType::Read => self.unlock_read(),
            LockType::Write => self.unlock_write(),
        }
    }
}
