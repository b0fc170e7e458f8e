//! 线程执行器
//!
//! 有上限的弹性线程池：任务排队时按需创建工作线程，空闲超过 keep_alive 的线程退出。
//! 协程会阻塞在 Channel 上，因此线程数上限应明显大于 CPU 核心数。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// 线程池配置
#[derive(Debug, Clone)]
pub(crate) struct ThreadPoolConfig {
    pub max_threads: usize,
    pub keep_alive: Duration,
    pub name: String,
}

struct PoolShared {
    /// 存活的工作线程数
    live: Mutex<usize>,
    /// 最后一个线程退出时通知
    exited: Condvar,
    /// 阻塞在取任务上的线程数
    idle: AtomicUsize,
    next_worker_id: AtomicUsize,
}

/// 线程池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub live_threads: usize,
    pub idle_threads: usize,
    pub queued: usize,
}

pub(crate) struct ThreadPool {
    config: ThreadPoolConfig,
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub(crate) fn new(config: ThreadPoolConfig) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            shared: Arc::new(PoolShared {
                live: Mutex::new(0),
                exited: Condvar::new(),
                idle: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
            }),
        }
    }

    /// 提交任务；线程池已关闭时原样返还任务
    pub(crate) fn execute(&self, task: Task) -> Result<(), Task> {
        {
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else {
                return Err(task);
            };
            if let Err(err) = sender.send(task) {
                return Err(err.into_inner());
            }
        }

        let mut live = self.shared.live.lock();
        let idle = self.shared.idle.load(Ordering::Acquire);
        if self.receiver.len() > idle && *live < self.config.max_threads {
            if self.spawn_worker() {
                *live += 1;
            }
        }
        Ok(())
    }

    fn spawn_worker(&self) -> bool {
        let id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let shared = Arc::clone(&self.shared);
        let keep_alive = self.config.keep_alive;

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.config.name, id))
            .spawn(move || worker_loop(id, receiver, shared, keep_alive));

        match spawned {
            Ok(_) => {
                trace!(worker = id, "spawned worker thread");
                true
            }
            Err(err) => {
                warn!(worker = id, error = %err, "failed to spawn worker thread");
                false
            }
        }
    }

    /// 停止接收任务，等待队列排空、所有线程退出
    ///
    /// 返回是否在 timeout 内全部退出
    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        self.sender.lock().take();

        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live.lock();
        while *live > 0 {
            if self.shared.exited.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }

    pub(crate) fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            live_threads: *self.shared.live.lock(),
            idle_threads: self.shared.idle.load(Ordering::Relaxed),
            queued: self.receiver.len(),
        }
    }
}

fn worker_loop(id: usize, receiver: Receiver<Task>, shared: Arc<PoolShared>, keep_alive: Duration) {
    loop {
        shared.idle.fetch_add(1, Ordering::AcqRel);
        let next = receiver.recv_timeout(keep_alive);
        shared.idle.fetch_sub(1, Ordering::AcqRel);

        match next {
            Ok(task) => task(),
            Err(RecvTimeoutError::Timeout) => {
                // 与 execute 的扩容判断在同一把锁内，避免任务滞留
                let mut live = shared.live.lock();
                if receiver.is_empty() {
                    *live -= 1;
                    shared.exited.notify_all();
                    debug!(worker = id, "worker thread idle, exiting");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let mut live = shared.live.lock();
    *live -= 1;
    shared.exited.notify_all();
    debug!(worker = id, "worker thread exiting");
}
