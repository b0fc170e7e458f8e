//! Once
//!
//! 动作至多执行一次；无论动作成功、返回错误还是 panic，Once 都进入完成状态

use std::sync::Arc;
use parking_lot::{Condvar, Mutex};

/// Once 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceState {
    NotStarted,
    Running,
    Done,
}

struct Inner {
    state: Mutex<OnceState>,
    cond: Condvar,
}

/// 一次性执行器
#[derive(Clone)]
pub struct Once {
    inner: Arc<Inner>,
}

/// 动作返回或展开时把状态置为 Done 并唤醒等待者
struct CompleteOnDrop<'a> {
    inner: &'a Inner,
}

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        *state = OnceState::Done;
        self.inner.cond.notify_all();
    }
}

impl Once {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(OnceState::NotStarted),
                cond: Condvar::new(),
            }),
        }
    }

    /// 第一个调用者执行 action 并拿到它的返回值（包括错误）；
    /// 其余调用者阻塞到 action 返回后得到 None，不会再次执行。
    pub fn call<F, R>(&self, action: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        {
            let mut state = self.inner.state.lock();
            loop {
                match *state {
                    OnceState::NotStarted => {
                        *state = OnceState::Running;
                        break;
                    }
                    OnceState::Running => self.inner.cond.wait(&mut state),
                    OnceState::Done => return None,
                }
            }
        }

        let _complete = CompleteOnDrop { inner: &self.inner };
        Some(action())
    }

    pub fn state(&self) -> OnceState {
        *self.inner.state.lock()
    }

    pub fn is_done(&self) -> bool {
        self.state() == OnceState::Done
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Once {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Once").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_runs_exactly_once_concurrently() {
        let once = Once::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let once = once.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    once.call(|| {
                        thread::sleep(Duration::from_millis(20));
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .is_some()
                })
            })
            .collect();

        let winners = callers
            .into_iter()
            .map(|c| c.join().unwrap())
            .filter(|ran| *ran)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(once.is_done());
    }

    #[test]
    fn test_waiters_observe_completion() {
        let once = Once::new();
        let value = Arc::new(AtomicUsize::new(0));

        let first = {
            let once = once.clone();
            let value = Arc::clone(&value);
            thread::spawn(move || {
                once.call(|| {
                    thread::sleep(Duration::from_millis(50));
                    value.store(7, Ordering::SeqCst);
                });
            })
        };
        thread::sleep(Duration::from_millis(10));

        // 非发起者返回时动作已经完成
        assert!(once.call(|| unreachable!()).is_none());
        assert_eq!(value.load(Ordering::SeqCst), 7);
        first.join().unwrap();
    }

    #[test]
    fn test_error_only_reaches_first_caller() {
        let once = Once::new();
        let first: Option<Result<(), String>> = once.call(|| Err("init failed".to_string()));
        assert_eq!(first, Some(Err("init failed".to_string())));

        // 出错后同样视为完成，不会重试
        let second: Option<Result<(), String>> = once.call(|| Ok(()));
        assert_eq!(second, None);
        assert!(once.is_done());
    }

    #[test]
    fn test_panic_marks_done() {
        let once = Once::new();
        let o = once.clone();
        let result = thread::spawn(move || {
            o.call(|| panic!("boom"));
        })
        .join();
        assert!(result.is_err());
        assert_eq!(once.state(), OnceState::Done);
        assert!(once.call(|| 1).is_none());
    }
}
