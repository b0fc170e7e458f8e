//! 协程管理器
//!
//! 持有线程执行器与进程执行器，负责调度协程、绑定 Context、返回 Future，
//! 以及整个生命周期（启动、关闭、排空）。

use std::convert::Infallible;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::context::Context;
use super::future::{Abandon, Completion, Future};
use super::goroutine::{ExecutorKind, Goroutine, GoroutineStatus};
use super::process_pool::{self, ProcessPool};
use super::thread_pool::{Task, ThreadPool, ThreadPoolConfig, ThreadPoolStats};
use super::GoId;
use crate::config::ManagerConfig;
use crate::error::{GoError, Result};

/// 全局默认管理器
static DEFAULT_MANAGER: OnceLock<GoroutineManager> = OnceLock::new();

/// 获取全局默认管理器（首次使用时按环境变量配置创建）
pub fn default_manager() -> &'static GoroutineManager {
    DEFAULT_MANAGER.get_or_init(|| GoroutineManager::new(ManagerConfig::from_env()))
}

/// 管理器生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    NotStarted = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl From<u8> for ManagerState {
    fn from(v: u8) -> Self {
        match v {
            0 => ManagerState::NotStarted,
            1 => ManagerState::Running,
            2 => ManagerState::ShuttingDown,
            _ => ManagerState::Stopped,
        }
    }
}

/// 管理器统计信息
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub state: ManagerState,
    pub spawned: u64,
    pub completed: u64,
    /// 已提交但尚未结束的协程
    pub active: usize,
    /// 其中仍在排队的
    pub runnable: usize,
    /// 其中正在执行的
    pub running: usize,
    pub threads: ThreadPoolStats,
    pub process_supervisors: ThreadPoolStats,
    pub live_processes: usize,
}

/// shutdown 结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 线程协程是否在超时前全部结束
    pub drained: bool,
    /// 被强制终止的子进程数
    pub killed_processes: usize,
    /// 以 `ShutDown` 错误解决的未完成 Future 数
    pub abandoned: usize,
}

/// 已调度协程的跟踪项
struct Tracked {
    goroutine: Arc<Goroutine>,
    completion: Arc<dyn Abandon>,
}

struct Inner {
    config: ManagerConfig,
    state: AtomicU8,
    threads: ThreadPool,
    processes: ProcessPool,
    goroutines: DashMap<GoId, Tracked>,
    next_goid: AtomicU64,
    spawned: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,
    /// 第一次 shutdown 的结果；再次调用直接返回
    shutdown: Mutex<Option<ShutdownReport>>,
}

impl Inner {
    fn finish<T>(
        &self,
        goroutine: &Goroutine,
        completion: &Completion<T>,
        result: Result<T>,
        binding: Option<(Context, u64)>,
    ) {
        if let Err(err) = &result {
            debug!(goroutine = goroutine.id, error = %err, "goroutine failed");
        }
        completion.complete(result);
        goroutine.mark_dead();
        self.goroutines.remove(&goroutine.id);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Some((ctx, hook)) = binding {
            ctx.remove_hook(hook);
        }
    }
}

/// 协程管理器
///
/// 句柄可克隆。除全局默认实例外，也可以单独构造用于测试或隔离。
#[derive(Clone)]
pub struct GoroutineManager {
    inner: Arc<Inner>,
}

impl GoroutineManager {
    pub fn new(config: ManagerConfig) -> Self {
        let threads = ThreadPool::new(ThreadPoolConfig {
            max_threads: config.max_threads.max(1),
            keep_alive: config.thread_keep_alive,
            name: config.thread_name.clone(),
        });
        let processes = ProcessPool::new(config.max_processes, &config.thread_name);
        Self {
            inner: Arc::new(Inner {
                config,
                state: AtomicU8::new(ManagerState::NotStarted as u8),
                threads,
                processes,
                goroutines: DashMap::new(),
                next_goid: AtomicU64::new(1),
                spawned: CachePadded::new(AtomicU64::new(0)),
                completed: CachePadded::new(AtomicU64::new(0)),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from(self.inner.state.load(Ordering::Acquire))
    }

    /// 启动管理器；第一次调度协程时会自动调用
    ///
    /// 返回管理器是否处于运行状态
    pub fn start(&self) -> bool {
        match self.inner.state.compare_exchange(
            ManagerState::NotStarted as u8,
            ManagerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(
                    version = crate::config::VERSION,
                    max_threads = self.inner.config.max_threads,
                    max_processes = self.inner.config.max_processes,
                    "goroutine manager started"
                );
                true
            }
            Err(current) => ManagerState::from(current) == ManagerState::Running,
        }
    }

    /// 在线程执行器上运行 f
    pub fn go<F, T>(&self, f: F) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_go(move || Ok::<T, Infallible>(f()))
    }

    /// 在线程执行器上运行可失败的 f，错误以 `Worker` 形式出现在 Future 上
    pub fn try_go<F, T, E>(&self, f: F) -> Future<T>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display,
    {
        self.spawn_thread(None, move || f().map_err(|e| GoError::Worker(e.to_string())))
    }

    /// 在线程执行器上运行绑定 Context 的 f
    ///
    /// Context 先结束时 Future 立即以 `Cancelled` / `DeadlineExceeded` 解决；
    /// 线程不能被强制终止，f 需要自行轮询 Context 并尽早返回。
    pub fn go_ctx<F, T, E>(&self, ctx: &Context, f: F) -> Future<T>
    where
        F: FnOnce(Context) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display,
    {
        let body_ctx = ctx.clone();
        self.spawn_thread(Some(ctx.clone()), move || {
            f(body_ctx).map_err(|e| GoError::Worker(e.to_string()))
        })
    }

    /// 在进程执行器上运行 f(arg)
    ///
    /// 子进程由 fork 得到，只有调用线程被复制：f 不应获取锁、打印或写日志，
    /// 否则可能卡在 fork 时其他线程持有的锁上。`process_timeout` 可以给子进程设上限。
    pub fn go_process<A, R>(&self, f: fn(A) -> R, arg: A) -> Future<R>
    where
        A: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        self.spawn_process(None, f, arg)
    }

    /// 在进程执行器上运行绑定 Context 的 f(arg)；Context 结束时子进程被杀掉
    pub fn go_process_ctx<A, R>(&self, ctx: &Context, f: fn(A) -> R, arg: A) -> Future<R>
    where
        A: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        self.spawn_process(Some(ctx.clone()), f, arg)
    }

    fn admit<T: Send + 'static>(
        &self,
        kind: ExecutorKind,
        ctx: &Option<Context>,
    ) -> std::result::Result<(Arc<Goroutine>, Future<T>, Arc<Completion<T>>), Future<T>> {
        let id = self.inner.next_goid.fetch_add(1, Ordering::Relaxed);
        if !self.start() {
            debug!(goroutine = id, "rejecting goroutine after shutdown");
            return Err(Future::failed(id, GoError::ShutDown));
        }

        let goroutine = Arc::new(Goroutine::new(id, kind, ctx.as_ref().map(Context::id)));
        let (future, completion) = Future::pending(id, ctx.clone());
        self.inner.goroutines.insert(
            id,
            Tracked {
                goroutine: Arc::clone(&goroutine),
                completion: completion.clone(),
            },
        );
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        debug!(goroutine = id, ?kind, "goroutine scheduled");
        Ok((goroutine, future, completion))
    }

    /// 执行器拒绝任务（已关闭）时解决 Future
    fn reject(&self, goroutine: &Goroutine, completion: &dyn Abandon) {
        goroutine.mark_dead();
        self.inner.goroutines.remove(&goroutine.id);
        completion.abandon(GoError::ShutDown);
    }

    fn spawn_thread<B, T>(&self, ctx: Option<Context>, body: B) -> Future<T>
    where
        B: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (goroutine, future, completion) = match self.admit(ExecutorKind::Thread, &ctx) {
            Ok(admitted) => admitted,
            Err(rejected) => return rejected,
        };

        let binding = ctx.and_then(|ctx| {
            let completion = Arc::clone(&completion);
            ctx.on_cancel(move |err| {
                completion.complete(Err(err.into()));
            })
            .map(|hook| (ctx, hook))
        });

        let inner = Arc::clone(&self.inner);
        let g = Arc::clone(&goroutine);
        let c = Arc::clone(&completion);
        let task: Task = Box::new(move || {
            g.cas_status(GoroutineStatus::Runnable, GoroutineStatus::Running);
            let result = catch_unwind(AssertUnwindSafe(body))
                .unwrap_or_else(|payload| Err(GoError::from_panic(payload)));
            inner.finish(&g, &c, result, binding);
        });

        if self.inner.threads.execute(task).is_err() {
            self.reject(&goroutine, &*completion);
        }
        future
    }

    fn spawn_process<A, R>(&self, ctx: Option<Context>, f: fn(A) -> R, arg: A) -> Future<R>
    where
        A: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let (goroutine, future, completion) = match self.admit(ExecutorKind::Process, &ctx) {
            Ok(admitted) => admitted,
            Err(rejected) => return rejected,
        };
        let id = goroutine.id;
        let children = self.inner.processes.children();

        let binding = ctx.clone().and_then(|ctx| {
            let completion = Arc::clone(&completion);
            let children = Arc::clone(&children);
            ctx.on_cancel(move |err| {
                completion.complete(Err(err.into()));
                if let Some(pid) = children.pid(id) {
                    process_pool::kill_child(pid);
                }
            })
            .map(|hook| (ctx, hook))
        });

        let inner = Arc::clone(&self.inner);
        let g = Arc::clone(&goroutine);
        let c = Arc::clone(&completion);
        let limit = self.inner.config.process_timeout;
        let task: Task = Box::new(move || {
            g.cas_status(GoroutineStatus::Runnable, GoroutineStatus::Running);
            let result = if c.is_done() {
                // 排队期间已被取消，不再 fork
                Err(GoError::Cancelled)
            } else {
                process_pool::run_in_child(id, f, arg, ctx.as_ref(), limit, &children)
            };
            inner.finish(&g, &c, result, binding);
        });

        if self.inner.processes.execute(task).is_err() {
            self.reject(&goroutine, &*completion);
        }
        future
    }

    /// 关闭管理器
    ///
    /// 不再接受新协程；等待在途线程协程结束（至多 `shutdown_timeout`），
    /// 终止仍在运行的子进程，把剩余未完成的 Future 以 `ShutDown` 解决。
    /// 重复调用直接返回第一次的结果。
    pub fn shutdown(&self) -> ShutdownReport {
        let mut guard = self.inner.shutdown.lock();
        if let Some(report) = guard.as_ref() {
            return report.clone();
        }

        self.inner
            .state
            .store(ManagerState::ShuttingDown as u8, Ordering::Release);
        let active = self.inner.goroutines.len();
        info!(active, "goroutine manager shutting down");

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        let drained = self.inner.threads.shutdown(self.inner.config.shutdown_timeout);
        if !drained {
            warn!("thread goroutines still running after shutdown timeout");
        }
        let killed_processes = self
            .inner
            .processes
            .shutdown(deadline.saturating_duration_since(Instant::now()));

        let pending: Vec<GoId> = self.inner.goroutines.iter().map(|e| *e.key()).collect();
        let mut abandoned = 0;
        for id in pending {
            if let Some((_, tracked)) = self.inner.goroutines.remove(&id) {
                let g = &tracked.goroutine;
                if g.is_running() {
                    warn!(
                        goroutine = g.id,
                        kind = ?g.kind,
                        context = ?g.context_id,
                        running_for = ?g.spawned_at.elapsed(),
                        "abandoning goroutine still running at shutdown"
                    );
                }
                g.mark_dead();
                if tracked.completion.abandon(GoError::ShutDown) {
                    abandoned += 1;
                }
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "resolved pending futures at shutdown");
        }

        self.inner
            .state
            .store(ManagerState::Stopped as u8, Ordering::Release);
        let report = ShutdownReport {
            drained,
            killed_processes,
            abandoned,
        };
        info!(?report, "goroutine manager stopped");
        *guard = Some(report.clone());
        report
    }

    pub fn stats(&self) -> ManagerStats {
        let (mut active, mut runnable, mut running) = (0, 0, 0);
        for entry in self.inner.goroutines.iter() {
            active += 1;
            match entry.value().goroutine.status() {
                GoroutineStatus::Runnable => runnable += 1,
                GoroutineStatus::Running => running += 1,
                GoroutineStatus::Dead => {}
            }
        }
        ManagerStats {
            state: self.state(),
            spawned: self.inner.spawned.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            active,
            runnable,
            running,
            threads: self.inner.threads.stats(),
            process_supervisors: self.inner.processes.stats(),
            live_processes: self.inner.processes.live_children(),
        }
    }
}

impl Default for GoroutineManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl std::fmt::Debug for GoroutineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoroutineManager")
            .field("state", &self.state())
            .field("active", &self.inner.goroutines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel::Channel;
    use crate::runtime::waitgroup::WaitGroup;
    use std::time::Duration;

    fn manager() -> GoroutineManager {
        GoroutineManager::new(ManagerConfig {
            max_threads: 8,
            max_processes: 2,
            shutdown_timeout: Duration::from_secs(5),
            ..ManagerConfig::default()
        })
    }

    #[test]
    fn test_lifecycle() {
        let m = manager();
        assert_eq!(m.state(), ManagerState::NotStarted);
        assert_eq!(m.go(|| 1).result(None), Ok(1));
        assert_eq!(m.state(), ManagerState::Running);

        let report = m.shutdown();
        assert!(report.drained);
        assert_eq!(m.state(), ManagerState::Stopped);
        assert_eq!(m.shutdown(), report);
        assert!(!m.start());
    }

    #[test]
    fn test_go_after_shutdown_fails() {
        let m = manager();
        m.shutdown();
        let future = m.go(|| 1);
        assert!(future.is_done());
        assert_eq!(future.result(None), Err(GoError::ShutDown));
    }

    #[test]
    fn test_worker_error_and_panic() {
        let m = manager();
        let failing = m.try_go(|| Err::<u8, _>("disk full"));
        assert_eq!(
            failing.result(None),
            Err(GoError::Worker("disk full".to_string()))
        );

        let panicking = m.go(|| -> u8 { panic!("index out of range") });
        assert_eq!(
            panicking.join(),
            Err(GoError::Panicked("index out of range".to_string()))
        );
        m.shutdown();
    }

    #[test]
    fn test_producer_consumer_on_pool() {
        let m = manager();
        let ch = Channel::new();
        let producer = {
            let ch = ch.clone();
            m.try_go(move || {
                for i in 0..5 {
                    ch.send(format!("message {}", i))?;
                }
                ch.close()
            })
        };
        let consumer = {
            let ch = ch.clone();
            m.go(move || ch.iter().collect::<Vec<String>>())
        };

        assert_eq!(producer.result(None), Ok(()));
        assert_eq!(consumer.join().unwrap().len(), 5);
        m.shutdown();
    }

    #[test]
    fn test_waitgroup_with_goroutines() {
        let m = manager();
        let wg = WaitGroup::new();
        wg.add(3).unwrap();
        for _ in 0..3 {
            let wg = wg.clone();
            m.go(move || wg.done());
        }
        assert!(wg.wait_timeout(Duration::from_secs(5)));
        m.shutdown();
    }

    #[test]
    fn test_context_cancel_resolves_future() {
        let m = manager();
        let ctx = Context::background().child();
        let future = m.go_ctx(&ctx, |ctx| {
            while !ctx.is_done() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok::<_, GoError>("stopped")
        });

        std::thread::sleep(Duration::from_millis(20));
        ctx.cancel();
        assert_eq!(future.result(None), Err(GoError::Cancelled));
        m.shutdown();
    }

    #[test]
    fn test_context_deadline_resolves_future() {
        let m = manager();
        let ctx = Context::with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let future = m.go_ctx(&ctx, |_ctx| {
            // 不轮询 Context 的协程
            std::thread::sleep(Duration::from_millis(400));
            Ok::<_, GoError>(1)
        });

        assert_eq!(future.result(None), Err(GoError::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(100));
        m.shutdown();
    }

    #[test]
    fn test_result_timeout_does_not_cancel() {
        let m = manager();
        let future = m.go(|| {
            std::thread::sleep(Duration::from_millis(100));
            "done"
        });
        assert_eq!(future.result(Some(Duration::from_millis(10))), Err(GoError::Timeout));
        assert_eq!(future.result(None), Ok("done"));
        m.shutdown();
    }

    #[test]
    fn test_shutdown_abandons_stuck_goroutines() {
        let m = GoroutineManager::new(ManagerConfig {
            max_threads: 1,
            shutdown_timeout: Duration::from_millis(50),
            ..ManagerConfig::default()
        });
        let blocker: Channel<()> = Channel::new();
        let stuck = {
            let blocker = blocker.clone();
            m.go(move || blocker.receive())
        };
        // 线程数为 1，第二个协程只能排队
        let queued = m.go(|| 2);

        let report = m.shutdown();
        assert!(!report.drained);
        assert_eq!(report.abandoned, 2);
        assert_eq!(stuck.result(None), Err(GoError::ShutDown));
        assert_eq!(queued.result(None), Err(GoError::ShutDown));
        blocker.close().unwrap();
    }

    #[test]
    fn test_stats() {
        let m = manager();
        m.go(|| ()).join().unwrap();
        let stats = m.stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.state, ManagerState::Running);
        m.shutdown();
        assert_eq!(m.stats().active, 0);
    }

    #[test]
    fn test_stats_track_runnable_and_running() {
        let m = GoroutineManager::new(ManagerConfig {
            max_threads: 1,
            shutdown_timeout: Duration::from_secs(5),
            ..ManagerConfig::default()
        });
        let gate: Channel<()> = Channel::new();
        let blocked = {
            let gate = gate.clone();
            m.go(move || gate.receive())
        };
        let queued = m.go(|| 2);

        let start = Instant::now();
        while m.stats().running == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(1));
        }
        let stats = m.stats();
        assert_eq!((stats.active, stats.running, stats.runnable), (2, 1, 1));

        gate.close().unwrap();
        assert_eq!(blocked.join(), Ok(None));
        assert_eq!(queued.join(), Ok(2));
        m.shutdown();
    }

    #[cfg(unix)]
    fn sum_of_squares(n: u128) -> u128 {
        (0..n).map(|i| i * i).sum()
    }

    #[cfg(unix)]
    fn spin(ms: u64) -> u64 {
        std::thread::sleep(Duration::from_millis(ms));
        ms
    }

    #[cfg(unix)]
    #[test]
    fn test_process_goroutine() {
        let m = manager();
        let start = Instant::now();
        let future = m.go_process(sum_of_squares, 10_000_000);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(future.join(), Ok(333_333_283_333_335_000_000u128));
        m.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_process_goroutine_cancelled() {
        let m = manager();
        let ctx = Context::background().child();
        let future = m.go_process_ctx(&ctx, spin, 10_000);
        std::thread::sleep(Duration::from_millis(100));
        ctx.cancel();
        assert_eq!(future.result(None), Err(GoError::Cancelled));

        let report = m.shutdown();
        assert!(report.drained);
        assert_eq!(m.stats().live_processes, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_queued_process_goroutine_not_forked_after_shutdown() {
        let m = GoroutineManager::new(ManagerConfig {
            max_processes: 1,
            shutdown_timeout: Duration::from_millis(100),
            ..ManagerConfig::default()
        });
        let start = Instant::now();
        let first = m.go_process(spin, 3_000);
        let second = m.go_process(spin, 3_000);
        std::thread::sleep(Duration::from_millis(100));

        let report = m.shutdown();
        assert_eq!(report.killed_processes, 1);
        assert_eq!(m.stats().live_processes, 0);
        assert_eq!(first.result(None), Err(GoError::ShutDown));
        assert_eq!(second.result(None), Err(GoError::ShutDown));
        assert!(start.elapsed() < Duration::from_millis(2_500));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_time_limit() {
        let m = GoroutineManager::new(ManagerConfig {
            max_processes: 1,
            process_timeout: Some(Duration::from_millis(100)),
            ..ManagerConfig::default()
        });
        let start = Instant::now();
        assert_eq!(m.go_process(spin, 5_000).join(), Err(GoError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(m.go_process(spin, 10).join(), Ok(10));
        m.shutdown();
        assert_eq!(m.stats().live_processes, 0);
    }
}
