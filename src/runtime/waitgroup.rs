//! WaitGroup
//!
//! 计数屏障：计数器归零时释放所有等待者

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

use crate::error::{GoError, Result};

struct State {
    counter: i64,
    /// 每次归零加一，等待者据此判断自己是否已被释放
    generation: u64,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// 计数屏障
///
/// 句柄可克隆，克隆共享同一个计数器
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    counter: 0,
                    generation: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// 计数器加 delta（可以为负）
    ///
    /// 结果为负时返回 `NegativeCounter`，计数器保持不变。
    /// 归零与唤醒在同一把锁内完成。
    pub fn add(&self, delta: i64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let next = state.counter + delta;
        if next < 0 {
            return Err(GoError::NegativeCounter {
                current: state.counter,
                delta,
            });
        }
        let released = state.counter > 0 && next == 0;
        state.counter = next;
        if released {
            state.generation += 1;
            self.inner.cond.notify_all();
        }
        Ok(())
    }

    /// 等价于 add(-1)
    pub fn done(&self) -> Result<()> {
        self.add(-1)
    }

    /// 当前计数
    pub fn count(&self) -> i64 {
        self.inner.state.lock().counter
    }

    /// 阻塞直到计数器归零
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        if state.counter == 0 {
            return;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.inner.cond.wait(&mut state);
        }
    }

    /// 等待至多 timeout，返回是否已归零
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        if state.counter == 0 {
            return true;
        }
        let generation = state.generation;
        while state.generation == generation {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.generation != generation;
            }
        }
        true
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_on_zero_returns() {
        let wg = WaitGroup::new();
        wg.wait();
        assert!(wg.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_negative_counter() {
        let wg = WaitGroup::new();
        assert_eq!(
            wg.add(-1),
            Err(GoError::NegativeCounter { current: 0, delta: -1 })
        );
        wg.add(1).unwrap();
        assert!(wg.add(-2).is_err());
        assert_eq!(wg.count(), 1);
        wg.done().unwrap();
        assert_eq!(wg.done(), Err(GoError::NegativeCounter { current: 0, delta: -1 }));
    }

    #[test]
    fn test_three_done_release_waiter() {
        let wg = WaitGroup::new();
        wg.add(3).unwrap();

        let waiter = {
            let wg = wg.clone();
            thread::spawn(move || wg.wait())
        };

        let workers: Vec<_> = (0..3)
            .map(|i| {
                let wg = wg.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * i));
                    wg.done().unwrap();
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        waiter.join().unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[test]
    fn test_all_waiters_released() {
        let wg = WaitGroup::new();
        wg.add(1).unwrap();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let wg = wg.clone();
                thread::spawn(move || wg.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        wg.done().unwrap();
        // 归零后立即再次加计数，已在等待的线程仍然必须被释放
        wg.add(1).unwrap();

        for w in waiters {
            w.join().unwrap();
        }
        wg.done().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let wg = WaitGroup::new();
        wg.add(1).unwrap();
        assert!(!wg.wait_timeout(Duration::from_millis(20)));
    }
}
