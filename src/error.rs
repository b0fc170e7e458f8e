//! 错误定义
//!
//! 运行时所有原语共享的错误类型

use thiserror::Error;

/// 运行时结果类型
pub type Result<T> = std::result::Result<T, GoError>;

/// 运行时错误
///
/// 同一个终态错误可能被多个等待者观察到，因此需要 `Clone`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GoError {
    /// 向已关闭的 Channel 发送，或发送过程中 Channel 被关闭
    #[error("send on closed channel")]
    ClosedChannel,
    /// 重复关闭 Channel
    #[error("close of closed channel")]
    AlreadyClosed,
    /// WaitGroup 计数器将变为负数
    #[error("negative WaitGroup counter: {current} + {delta}")]
    NegativeCounter { current: i64, delta: i64 },
    /// select 中所有分支都不可能再就绪
    #[error("all select cases are closed: deadlock")]
    SelectDeadlock,
    /// select 没有任何分支
    #[error("select with no cases")]
    EmptySelect,
    /// 本地等待超时（不影响底层任务）
    #[error("timed out waiting for result")]
    Timeout,
    /// Context 截止时间已过
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// Context 被显式取消
    #[error("context canceled")]
    Cancelled,
    /// 协程体返回的错误
    #[error("goroutine failed: {0}")]
    Worker(String),
    /// 协程体 panic
    #[error("goroutine panicked: {0}")]
    Panicked(String),
    /// 管理器已关闭，不再接受或无法完成任务
    #[error("goroutine manager is shut down")]
    ShutDown,
    /// 当前平台不支持进程执行器
    #[error("process goroutines are not supported on this platform")]
    ProcessUnsupported,
    /// 子进程崩溃或结果无法传输
    #[error("process worker failed: {0}")]
    Process(String),
}

impl GoError {
    /// 是否属于超时/取消类的控制流结果（而非协程自身失败）
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            GoError::Timeout | GoError::DeadlineExceeded | GoError::Cancelled | GoError::ShutDown
        )
    }

    /// 从 panic 载荷中提取消息
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        GoError::Panicked(message)
    }
}
