//! gort: Go 风格并发运行时
//!
//! 在只提供原生线程和进程的环境上实现 goroutine、channel、select、
//! WaitGroup、Once 和可取消的 Context。
//!
//! ```no_run
//! let ch = gort::new_channel(0);
//! let producer = {
//!     let ch = ch.clone();
//!     gort::try_go(move || {
//!         for i in 0..5 {
//!             ch.send(format!("message {}", i))?;
//!         }
//!         ch.close()
//!     })
//! };
//! for message in &ch {
//!     println!("<- {}", message);
//! }
//! producer.result(None).unwrap();
//! gort::shutdown();
//! ```

pub mod config;
pub mod error;
pub mod runtime;

use std::fmt::Display;
use std::time::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use config::ManagerConfig;
pub use error::{GoError, Result};
pub use runtime::{
    default_manager, select, select_timeout, Case, Channel, ChannelStatus, Context,
    ContextError, Direction, DoneSignal, Future, GoroutineManager, ManagerState, Once,
    Select, Selected, ShutdownReport, TrySendError, WaitGroup,
};

/// 创建 Channel，容量 0 表示同步交付
pub fn new_channel<T>(capacity: usize) -> Channel<T> {
    Channel::with_capacity(capacity)
}

/// 创建在 timeout 后过期的根 Context
pub fn new_context_with_timeout(timeout: Duration) -> Context {
    Context::with_timeout(timeout)
}

/// 在默认管理器的线程执行器上运行 f
pub fn go<F, T>(f: F) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    default_manager().go(f)
}

/// 在默认管理器上运行可失败的 f
pub fn try_go<F, T, E>(f: F) -> Future<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Display,
{
    default_manager().try_go(f)
}

/// 在默认管理器上运行绑定 Context 的 f
pub fn go_ctx<F, T, E>(ctx: &Context, f: F) -> Future<T>
where
    F: FnOnce(Context) -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Display,
{
    default_manager().go_ctx(ctx, f)
}

/// 在默认管理器的进程执行器上运行 f(arg)
///
/// f 在 fork 出的子进程里执行，限制见 [`GoroutineManager::go_process`]
pub fn go_process<A, R>(f: fn(A) -> R, arg: A) -> Future<R>
where
    A: Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    default_manager().go_process(f, arg)
}

/// 在默认管理器的进程执行器上运行绑定 Context 的 f(arg)
pub fn go_process_ctx<A, R>(ctx: &Context, f: fn(A) -> R, arg: A) -> Future<R>
where
    A: Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    default_manager().go_process_ctx(ctx, f, arg)
}

/// 关闭默认管理器（幂等）
pub fn shutdown() -> ShutdownReport {
    default_manager().shutdown()
}
