//! Future
//!
//! 协程调度时返回的结果句柄。状态只会从 Pending 转换一次到终态；
//! 本地等待超时不会改变状态，底层协程继续运行。

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::context::Context;
use super::GoId;
use crate::error::{GoError, Result};

/// Future 内部槽位
enum Slot<T> {
    Pending,
    Fulfilled(T),
    Failed(GoError),
    /// 值已被 `join` 取走
    Taken,
}

/// 完成端：执行器持有，用来写入终态
pub(crate) struct Completion<T> {
    id: GoId,
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    /// 写入终态，只有第一次写入生效
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = match result {
            Ok(value) => Slot::Fulfilled(value),
            Err(err) => Slot::Failed(err),
        };
        self.cond.notify_all();
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }
}

/// 类型擦除的完成端，管理器关闭时用它解决仍未完成的 Future
pub(crate) trait Abandon: Send + Sync {
    fn abandon(&self, err: GoError) -> bool;
}

impl<T: Send> Abandon for Completion<T> {
    fn abandon(&self, err: GoError) -> bool {
        self.complete(Err(err))
    }
}

/// 协程结果句柄
pub struct Future<T> {
    completion: Arc<Completion<T>>,
    /// 绑定的 Context，等待时用来检查其截止时间
    context: Option<Context>,
}

impl<T> Future<T> {
    pub(crate) fn pending(id: GoId, context: Option<Context>) -> (Self, Arc<Completion<T>>) {
        let completion = Arc::new(Completion {
            id,
            slot: Mutex::new(Slot::Pending),
            cond: Condvar::new(),
        });
        let future = Self {
            completion: Arc::clone(&completion),
            context,
        };
        (future, completion)
    }

    /// 已失败的 Future（例如管理器已关闭）
    pub(crate) fn failed(id: GoId, err: GoError) -> Self {
        let (future, completion) = Self::pending(id, None);
        completion.complete(Err(err));
        future
    }

    /// 协程 ID
    #[inline]
    pub fn id(&self) -> GoId {
        self.completion.id
    }

    /// 是否已进入终态（不阻塞）
    pub fn is_done(&self) -> bool {
        if let Some(ctx) = &self.context {
            // 触发惰性截止检查，取消钩子会写入终态
            ctx.is_done();
        }
        self.completion.is_done()
    }

    /// 等待结果
    ///
    /// 协程的返回值、错误或 panic 原样返回；绑定的 Context 先结束时返回
    /// `Cancelled` / `DeadlineExceeded`；`timeout` 到期时返回 `Timeout`，Future 本身不变。
    pub fn result(&self, timeout: Option<Duration>) -> Result<T>
    where
        T: Clone,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let slot = self.wait(deadline)?;
        match &*slot {
            Slot::Fulfilled(value) => Ok(value.clone()),
            Slot::Failed(err) => Err(err.clone()),
            Slot::Pending | Slot::Taken => unreachable!("future slot read before completion"),
        }
    }

    /// 阻塞等待并取走结果
    pub fn join(self) -> Result<T> {
        let mut slot = self.wait(None)?;
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Fulfilled(value) => Ok(value),
            Slot::Failed(err) => Err(err),
            Slot::Pending | Slot::Taken => unreachable!("future slot read before completion"),
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<MutexGuard<'_, Slot<T>>> {
        let ctx_deadline = self.context.as_ref().and_then(Context::deadline);

        loop {
            if let Some(ctx) = &self.context {
                ctx.is_done();
            }

            let mut slot = self.completion.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                return Ok(slot);
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(GoError::Timeout);
            }

            let wake_at = ctx_deadline
                .filter(|d| *d > now)
                .into_iter()
                .chain(deadline)
                .min();
            match wake_at {
                Some(at) => {
                    self.completion.cond.wait_until(&mut slot, at);
                }
                None => self.completion.cond.wait(&mut slot),
            }
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.id())
            .field("done", &self.completion.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fulfilled() {
        let (future, completion) = Future::pending(1, None);
        assert!(!future.is_done());
        assert!(completion.complete(Ok(5)));
        assert!(!completion.complete(Ok(6)));
        assert_eq!(future.result(None), Ok(5));
        assert_eq!(future.result(Some(Duration::ZERO)), Ok(5));
        assert_eq!(future.join(), Ok(5));
    }

    #[test]
    fn test_failed() {
        let future: Future<i32> = Future::failed(2, GoError::ShutDown);
        assert!(future.is_done());
        assert_eq!(future.result(None), Err(GoError::ShutDown));
    }

    #[test]
    fn test_timeout_keeps_state() {
        let (future, completion) = Future::<String>::pending(3, None);
        let start = Instant::now();
        assert_eq!(
            future.result(Some(Duration::from_millis(30))),
            Err(GoError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!future.is_done());

        completion.complete(Ok("late".to_string()));
        assert_eq!(future.result(None), Ok("late".to_string()));
    }

    #[test]
    fn test_completion_from_other_thread() {
        let (future, completion) = Future::pending(4, None);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.complete(Ok(vec![1, 2, 3]));
        });
        assert_eq!(future.join(), Ok(vec![1, 2, 3]));
        worker.join().unwrap();
    }

    #[test]
    fn test_abandon() {
        let (future, completion) = Future::<u8>::pending(5, None);
        let abandon: Arc<dyn Abandon> = completion;
        assert!(abandon.abandon(GoError::Cancelled));
        assert!(!abandon.abandon(GoError::ShutDown));
        assert_eq!(future.result(None), Err(GoError::Cancelled));
    }
}
