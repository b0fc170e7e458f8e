//! 唤醒信号
//!
//! select 需要同时等待多个对象，因此每次 select 创建一个 `Signal`，
//! 注册到所有参与的 Channel / DoneSignal 上，任何一方状态变化都会唤醒它。

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use parking_lot::{Condvar, Mutex};

/// Signal ID 计数器
static SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// 一次 select 的唤醒信号
pub(crate) struct Signal {
    id: u64,
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
            notified: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// 通知等待者
    pub(crate) fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_all();
    }

    /// 等待通知或截止时间
    ///
    /// 返回 true 表示被通知，false 表示超时。返回前清除通知标记。
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut notified, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut notified),
            }
        }
        std::mem::replace(&mut *notified, false)
    }
}

/// 注册在某个对象上的 select 信号集合
///
/// 总是在宿主对象自己的锁内访问
#[derive(Default)]
pub(crate) struct Watchers {
    list: Vec<Arc<Signal>>,
}

impl Watchers {
    pub(crate) fn add(&mut self, signal: &Arc<Signal>) {
        if !self.list.iter().any(|s| s.id() == signal.id()) {
            self.list.push(Arc::clone(signal));
        }
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.list.retain(|s| s.id() != id);
    }

    pub(crate) fn notify_all(&self) {
        for signal in &self.list {
            signal.notify();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }
}

struct LatchState {
    fired: bool,
    watchers: Watchers,
}

/// 一次性事件：只会触发一次，触发后永久保持
pub(crate) struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                fired: false,
                watchers: Watchers::default(),
            }),
            cond: Condvar::new(),
        }
    }

    /// 触发事件，只有第一次调用返回 true
    pub(crate) fn fire(&self) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            return false;
        }
        state.fired = true;
        self.cond.notify_all();
        state.watchers.notify_all();
        state.watchers = Watchers::default();
        true
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// 阻塞直到触发或截止时间，返回是否已触发
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while !state.fired {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.fired;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        true
    }

    /// 注册 select 信号；已触发时不注册并返回 true
    pub(crate) fn watch(&self, signal: &Arc<Signal>) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            return true;
        }
        state.watchers.add(signal);
        false
    }

    pub(crate) fn unwatch(&self, id: u64) {
        self.state.lock().watchers.remove(id);
    }
}

enum Claim {
    Open,
    /// select 自己正在完成（或已完成）某个分支
    Claimed,
    /// 对端发送方把值直接交给了某个接收分支
    Delivered(usize, Box<dyn Any + Send>),
}

/// 一次 select 的令牌：唤醒信号加上认领状态
///
/// 一次 select 只能完成一个分支。select 自己完成分支前先 `claim`，
/// 无缓冲 Channel 上的发送方则可以通过 `deliver` 认领它，把值直接交给接收分支。
pub(crate) struct Selector {
    signal: Arc<Signal>,
    claim: Mutex<Claim>,
}

impl Selector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            signal: Signal::new(),
            claim: Mutex::new(Claim::Open),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.signal.id()
    }

    #[inline]
    pub(crate) fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(*self.claim.lock(), Claim::Open)
    }

    /// Open -> Claimed；已有值送达时失败
    pub(crate) fn claim(&self) -> bool {
        let mut claim = self.claim.lock();
        if matches!(*claim, Claim::Open) {
            *claim = Claim::Claimed;
            true
        } else {
            false
        }
    }

    /// 认领后分支没能完成，重新开放
    pub(crate) fn release(&self) {
        let mut claim = self.claim.lock();
        if matches!(*claim, Claim::Claimed) {
            *claim = Claim::Open;
        }
    }

    /// 把值交给第 index 个分支；select 已被认领时原样返还
    pub(crate) fn deliver<T: Send + 'static>(&self, index: usize, value: T) -> Result<(), T> {
        let mut claim = self.claim.lock();
        if !matches!(*claim, Claim::Open) {
            return Err(value);
        }
        *claim = Claim::Delivered(index, Box::new(value));
        drop(claim);
        self.signal.notify();
        Ok(())
    }

    /// 取走送达的值
    pub(crate) fn take_delivery(&self) -> Option<(usize, Box<dyn Any + Send>)> {
        let mut claim = self.claim.lock();
        match std::mem::replace(&mut *claim, Claim::Claimed) {
            Claim::Delivered(index, value) => Some((index, value)),
            other => {
                *claim = other;
                None
            }
        }
    }
}
