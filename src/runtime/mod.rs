//! 协程运行时模块
//!
//! 在原生线程与进程之上实现 Go 风格的并发模型
//!
//! 核心组件：
//! - Channel: 可关闭的同步/缓冲管道
//! - select: 在多个 Channel 操作上等待，公平地完成其中一个
//! - WaitGroup / Once: 计数屏障与一次性执行
//! - Context: 可取消、带截止时间的上下文树
//! - GoroutineManager: 线程执行器 + 进程执行器，返回 Future

mod signal;
pub mod goroutine;
pub mod channel;
pub mod select;
pub mod waitgroup;
pub mod once;
pub mod context;
pub mod future;
mod thread_pool;
mod process_pool;
pub mod manager;

pub use channel::{Channel, ChannelStatus, TrySendError};
pub use select::{select, select_timeout, Case, Direction, Select, Selected};
pub use waitgroup::WaitGroup;
pub use once::{Once, OnceState};
pub use context::{Context, ContextError, DoneSignal};
pub use future::Future;
pub use goroutine::{ExecutorKind, GoroutineStatus};
pub use thread_pool::ThreadPoolStats;
pub use manager::{default_manager, GoroutineManager, ManagerState, ManagerStats, ShutdownReport};

/// 协程 ID 类型
pub type GoId = u64;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
