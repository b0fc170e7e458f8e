//! 取消上下文 (Context)
//!
//! Context 组成一棵树：取消一个节点会同步地取消它的所有后代。
//! 截止时间在被观察时惰性检查，不需要额外的定时线程。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use thiserror::Error;

use super::signal::{Latch, Signal};
use crate::error::GoError;

/// Context ID 计数器
static CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 取消钩子 ID 计数器
static HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Context 结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// 显式取消
    #[error("context canceled")]
    Cancelled,
    /// 截止时间已过
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for GoError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => GoError::Cancelled,
            ContextError::DeadlineExceeded => GoError::DeadlineExceeded,
        }
    }
}

type CancelHook = Box<dyn FnOnce(ContextError) + Send>;

struct NodeState {
    err: Option<ContextError>,
    children: Vec<Weak<Node>>,
    hooks: Vec<(u64, CancelHook)>,
}

struct Node {
    id: u64,
    /// 生效的截止时间（已与父节点取最小值）
    deadline: Option<Instant>,
    /// 子节点持有父节点，父节点只弱引用子节点
    parent: Option<Arc<Node>>,
    state: Mutex<NodeState>,
    done: Latch,
}

impl Node {
    fn new(parent: Option<&Arc<Node>>, deadline: Option<Instant>) -> Arc<Self> {
        let inherited = parent.and_then(|p| p.deadline);
        let deadline = match (inherited, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Arc::new(Self {
            id: CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            deadline,
            parent: parent.cloned(),
            state: Mutex::new(NodeState {
                err: None,
                children: Vec::new(),
                hooks: Vec::new(),
            }),
            done: Latch::new(),
        })
    }

    /// 检查是否结束，截止时间已到时就地触发取消
    fn poll(self: &Arc<Self>) -> Option<ContextError> {
        if let Some(err) = self.state.lock().err {
            return Some(err);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel_with(ContextError::DeadlineExceeded);
                self.state.lock().err
            }
            _ => None,
        }
    }

    fn cancel_with(self: &Arc<Self>, err: ContextError) {
        // 截止时间先到的话，以过期为原因
        let err = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => ContextError::DeadlineExceeded,
            _ => err,
        };
        let (children, hooks) = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err);
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.hooks),
            )
        };

        self.done.fire();

        // 返回前所有后代都已结束
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel_with(err);
            }
        }
        for (_, hook) in hooks {
            hook(err);
        }

        if let Some(parent) = &self.parent {
            let me = Arc::as_ptr(self);
            parent
                .state
                .lock()
                .children
                .retain(|w| w.strong_count() > 0 && w.as_ptr() != me);
        }
    }
}

/// 取消上下文
///
/// 句柄可克隆，克隆共享同一个节点。
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// 根 Context，只能被显式取消
    pub fn background() -> Self {
        Self {
            node: Node::new(None, None),
        }
    }

    /// 根 Context，在 now + timeout 时过期
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// 根 Context，在给定时刻过期
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            node: Node::new(None, Some(deadline)),
        }
    }

    /// 派生子 Context：父节点结束时随之结束，也可单独取消
    pub fn child(&self) -> Self {
        self.derive(None)
    }

    /// 派生带超时的子 Context，截止时间不会晚于父节点
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Some(Instant::now() + timeout))
    }

    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let node = Node::new(Some(&self.node), deadline);
        let parent_err = {
            let mut state = self.node.state.lock();
            if state.err.is_none() {
                state.children.retain(|w| w.strong_count() > 0);
                state.children.push(Arc::downgrade(&node));
            }
            state.err
        };
        if let Some(err) = parent_err {
            node.cancel_with(err);
        }
        Self { node }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.node.id
    }

    /// 显式取消；已结束时无效果
    pub fn cancel(&self) {
        self.node.cancel_with(ContextError::Cancelled);
    }

    /// 非阻塞检查是否已结束
    pub fn is_done(&self) -> bool {
        self.node.poll().is_some()
    }

    /// 结束原因；仍然活跃时返回 None
    pub fn err(&self) -> Option<ContextError> {
        self.node.poll()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    /// 可等待、可用于 select 的完成信号
    pub fn done_signal(&self) -> DoneSignal {
        DoneSignal {
            context: self.clone(),
        }
    }

    /// 阻塞直到结束，返回原因
    pub fn wait(&self) -> ContextError {
        loop {
            if let Some(err) = self.node.poll() {
                return err;
            }
            self.node.done.wait_until(self.node.deadline);
        }
    }

    /// 注册取消回调；已结束时立即在当前线程执行
    pub(crate) fn on_cancel<F>(&self, hook: F) -> Option<u64>
    where
        F: FnOnce(ContextError) + Send + 'static,
    {
        let id = HOOK_ID.fetch_add(1, Ordering::Relaxed);
        let err = match self.node.poll() {
            Some(err) => err,
            None => {
                let mut state = self.node.state.lock();
                match state.err {
                    Some(err) => err,
                    None => {
                        state.hooks.push((id, Box::new(hook)));
                        return Some(id);
                    }
                }
            }
        };
        hook(err);
        None
    }

    pub(crate) fn remove_hook(&self, id: u64) {
        self.node.state.lock().hooks.retain(|(h, _)| *h != id);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("deadline", &self.node.deadline)
            .field("err", &self.node.state.lock().err)
            .finish()
    }
}

/// Context 的完成信号
///
/// 可以直接阻塞等待，也可以作为 `Case::done` 参与 select
#[derive(Clone, Debug)]
pub struct DoneSignal {
    context: Context,
}

impl DoneSignal {
    /// 是否已触发（会检查截止时间）
    pub fn is_fired(&self) -> bool {
        self.context.is_done()
    }

    /// 阻塞直到触发
    pub fn wait(&self) {
        self.context.wait();
    }

    /// 等待至多 timeout，返回是否已触发
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let until = Instant::now() + timeout;
        let wake_at = match self.context.deadline() {
            Some(deadline) => deadline.min(until),
            None => until,
        };
        self.context.node.done.wait_until(Some(wake_at));
        self.is_fired()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.context.deadline()
    }

    pub(crate) fn watch(&self, signal: &Arc<Signal>) {
        self.context.node.done.watch(signal);
    }

    pub(crate) fn unwatch(&self, id: u64) {
        self.context.node.done.unwatch(id);
    }
}
