//! 进程执行器
//!
//! 每个进程协程由一个监督线程负责：fork 子进程执行函数，通过管道取回
//! serde_json 编码的结果，再 waitpid 回收。监督线程数即同时存活的子进程上限。
//!
//! 进程协程必须是函数指针 `fn(A) -> R`：参数随 fork 复制到子进程，
//! 结果需要可序列化，共享内存语义不会跨越进程边界。
//!
//! fork 发生在多线程进程里，子进程只继承调用线程。其他线程 fork 时持有的锁
//! 在子进程里永远不会释放，所以 f 不应加锁、打印或使用日志。子进程里的 panic
//! 钩子被换成空实现，panic 信息仍通过结果帧带回。

use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::context::Context;
use super::thread_pool::{Task, ThreadPool, ThreadPoolConfig, ThreadPoolStats};
use super::GoId;
use crate::error::{GoError, Result};

/// 子进程写回管道的结果
#[derive(Debug, Serialize, Deserialize)]
enum Outcome {
    /// 结果的 JSON 文本（文本形式保留 u128 等超出 JSON 数值范围的整数）
    Value(String),
    Panicked(String),
    Unserializable(String),
}

impl Outcome {
    fn decode<R: DeserializeOwned>(bytes: &[u8]) -> Result<R> {
        let outcome: Outcome = serde_json::from_slice(bytes)
            .map_err(|e| GoError::Process(format!("corrupt result frame: {}", e)))?;
        match outcome {
            Outcome::Value(json) => serde_json::from_str(&json)
                .map_err(|e| GoError::Process(format!("result type mismatch: {}", e))),
            Outcome::Panicked(message) => Err(GoError::Panicked(message)),
            Outcome::Unserializable(message) => Err(GoError::Process(format!(
                "result is not serializable: {}",
                message
            ))),
        }
    }
}

/// 存活子进程表：协程 ID -> pid
///
/// 关闭后不再登记新的子进程，排队中的进程协程也不会再 fork
#[derive(Default)]
pub(crate) struct ChildTable {
    pids: DashMap<GoId, i32>,
    closing: Mutex<bool>,
}

impl ChildTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_closing(&self) -> bool {
        *self.closing.lock()
    }

    /// 登记子进程；已关闭时返回 false
    fn register(&self, id: GoId, pid: i32) -> bool {
        let closing = self.closing.lock();
        if *closing {
            return false;
        }
        self.pids.insert(id, pid);
        true
    }

    fn unregister(&self, id: GoId) {
        self.pids.remove(&id);
    }

    pub(crate) fn pid(&self, id: GoId) -> Option<i32> {
        self.pids.get(&id).map(|entry| *entry.value())
    }

    /// 停止登记并杀掉所有已登记的子进程，返回被杀的数量
    fn close(&self) -> usize {
        *self.closing.lock() = true;
        self.pids
            .iter()
            .filter(|entry| kill_child(*entry.value()))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.pids.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

pub(crate) struct ProcessPool {
    supervisors: ThreadPool,
    children: Arc<ChildTable>,
}

impl ProcessPool {
    pub(crate) fn new(max_processes: usize, name: &str) -> Self {
        Self {
            supervisors: ThreadPool::new(ThreadPoolConfig {
                max_threads: max_processes.max(1),
                keep_alive: Duration::from_secs(10),
                name: format!("{}-proc", name),
            }),
            children: Arc::new(ChildTable::new()),
        }
    }

    pub(crate) fn children(&self) -> Arc<ChildTable> {
        Arc::clone(&self.children)
    }

    pub(crate) fn execute(&self, task: Task) -> std::result::Result<(), Task> {
        self.supervisors.execute(task)
    }

    /// 等待监督线程退出；超时后杀掉剩余子进程，排队中的任务不再 fork，再等一次
    ///
    /// 返回被强制终止的子进程数
    pub(crate) fn shutdown(&self, timeout: Duration) -> usize {
        if self.supervisors.shutdown(timeout) {
            self.children.close();
            return 0;
        }
        let killed = self.children.close();
        if killed > 0 {
            warn!(killed, "killed process goroutines still running at shutdown");
        }
        self.supervisors.shutdown(Duration::from_secs(1));
        killed
    }

    pub(crate) fn stats(&self) -> ThreadPoolStats {
        self.supervisors.stats()
    }

    pub(crate) fn live_children(&self) -> usize {
        self.children.len()
    }
}

/// 向子进程发送 SIGKILL
pub(crate) fn kill_child(pid: i32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill 只接收整数参数，pid 来自本进程 fork 的子进程
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            debug!(pid, "killed process goroutine");
        }
        rc == 0
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// 在子进程中执行 f(arg) 并取回结果（在监督线程上调用）
///
/// `limit` 是子进程运行时间的上限，到期后杀掉子进程并返回 `Timeout`
#[cfg(unix)]
pub(crate) fn run_in_child<A, R>(
    id: GoId,
    f: fn(A) -> R,
    arg: A,
    context: Option<&Context>,
    limit: Option<Duration>,
    children: &ChildTable,
) -> Result<R>
where
    R: Serialize + DeserializeOwned,
{
    if children.is_closing() {
        return Err(GoError::ShutDown);
    }

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds 是两个元素的数组
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(GoError::Process(format!(
            "pipe failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    // SAFETY: 子进程只执行 f、写管道、_exit，不返回到调用方
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return Err(GoError::Process(format!("fork failed: {}", err)));
    }

    if pid == 0 {
        unsafe { libc::close(read_fd) };
        std::panic::set_hook(Box::new(|_| {}));
        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(arg))) {
            Ok(value) => match serde_json::to_string(&value) {
                Ok(value) => Outcome::Value(value),
                Err(e) => Outcome::Unserializable(e.to_string()),
            },
            Err(payload) => match GoError::from_panic(payload) {
                GoError::Panicked(message) => Outcome::Panicked(message),
                other => Outcome::Panicked(other.to_string()),
            },
        };
        let code = match serde_json::to_vec(&outcome) {
            Ok(bytes) if write_all(write_fd, &bytes) => 0,
            _ => 1,
        };
        // SAFETY: 不运行析构和 atexit，直接结束子进程
        unsafe { libc::_exit(code) };
    }

    unsafe { libc::close(write_fd) };
    let registered = children.register(id, pid);
    debug!(goroutine = id, pid, registered, "forked process goroutine");

    let expires_at = limit.map(|limit| Instant::now() + limit);
    let mut deadline: Option<Instant> = context
        .and_then(Context::deadline)
        .into_iter()
        .chain(expires_at)
        .min();
    let mut expired = false;
    if !registered || context.is_some_and(Context::is_done) {
        kill_child(pid);
        deadline = None;
    }

    let mut frame = Vec::new();
    let mut buf = [0u8; 8192];
    let mut read_error = None;
    loop {
        let timeout_ms = match deadline {
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                ((remaining.as_micros() + 999) / 1000).min(i32::MAX as u128) as libc::c_int
            }
            None => -1,
        };
        let mut pfd = libc::pollfd {
            fd: read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd 在调用期间有效
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            read_error = Some(err);
            break;
        }
        if rc == 0 {
            // 截止时间到：触发 Context 结束，取消钩子负责解决 Future
            if context.is_some_and(Context::is_done) {
                kill_child(pid);
                deadline = None;
            } else if expires_at.is_some_and(|at| Instant::now() >= at) {
                warn!(goroutine = id, pid, "process goroutine exceeded its time limit");
                kill_child(pid);
                expired = true;
                deadline = None;
            }
            continue;
        }

        // SAFETY: buf 可写 buf.len() 字节
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n == 0 {
            break;
        }
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            read_error = Some(err);
            break;
        }
        frame.extend_from_slice(&buf[..n as usize]);
    }
    unsafe { libc::close(read_fd) };

    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: pid 是本线程 fork 出的子进程
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 || std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            break;
        }
    }
    children.unregister(id);
    debug!(goroutine = id, pid, status, "process goroutine exited");

    if let Some(err) = context.and_then(Context::err) {
        return Err(err.into());
    }
    if expired {
        return Err(GoError::Timeout);
    }
    if frame.is_empty() && children.is_closing() {
        return Err(GoError::ShutDown);
    }
    if let Some(err) = read_error {
        return Err(GoError::Process(format!("reading result failed: {}", err)));
    }
    if frame.is_empty() {
        let reason = if libc::WIFSIGNALED(status) {
            format!("worker killed by signal {}", libc::WTERMSIG(status))
        } else {
            format!("worker exited with status {} without a result", libc::WEXITSTATUS(status))
        };
        return Err(GoError::Process(reason));
    }
    Outcome::decode(&frame)
}

#[cfg(not(unix))]
pub(crate) fn run_in_child<A, R>(
    _id: GoId,
    _f: fn(A) -> R,
    _arg: A,
    _context: Option<&Context>,
    _limit: Option<Duration>,
    _children: &ChildTable,
) -> Result<R>
where
    R: Serialize + DeserializeOwned,
{
    Err(GoError::ProcessUnsupported)
}

#[cfg(unix)]
fn write_all(fd: libc::c_int, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: bytes 在调用期间有效
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return false;
        }
        bytes = &bytes[n as usize..];
    }
    true
}
