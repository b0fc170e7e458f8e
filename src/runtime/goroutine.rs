//! 协程 (Goroutine) 记录
//!
//! 管理器为每个调度出去的协程保存一条记录，用于统计和关闭时的清理

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use super::GoId;

/// 协程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GoroutineStatus {
    /// 已提交，等待执行器空闲
    Runnable = 0,
    /// 正在运行
    Running = 1,
    /// 已结束（完成、失败或被取消）
    Dead = 2,
}

impl From<u8> for GoroutineStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => GoroutineStatus::Runnable,
            1 => GoroutineStatus::Running,
            _ => GoroutineStatus::Dead,
        }
    }
}

/// 执行器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// 线程执行器，共享内存
    Thread,
    /// 进程执行器，真正并行
    Process,
}

/// 协程记录
pub struct Goroutine {
    /// 协程唯一 ID
    pub id: GoId,
    /// 所在执行器
    pub kind: ExecutorKind,
    /// 绑定的 Context ID
    pub context_id: Option<u64>,
    /// 提交时间
    pub spawned_at: Instant,
    /// 协程状态（原子操作）
    status: AtomicU8,
}

impl Goroutine {
    pub fn new(id: GoId, kind: ExecutorKind, context_id: Option<u64>) -> Self {
        Self {
            id,
            kind,
            context_id,
            spawned_at: Instant::now(),
            status: AtomicU8::new(GoroutineStatus::Runnable as u8),
        }
    }

    /// 获取协程状态
    #[inline]
    pub fn status(&self) -> GoroutineStatus {
        GoroutineStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 尝试将状态从 expected 改为 new
    #[inline]
    pub fn cas_status(&self, expected: GoroutineStatus, new: GoroutineStatus) -> bool {
        self.status
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 标记为死亡
    #[inline]
    pub fn mark_dead(&self) {
        self.status.store(GoroutineStatus::Dead as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == GoroutineStatus::Running
    }
}

impl std::fmt::Debug for Goroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Goroutine")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("context_id", &self.context_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let g = Goroutine::new(1, ExecutorKind::Thread, None);
        assert_eq!(g.status(), GoroutineStatus::Runnable);
        assert!(g.cas_status(GoroutineStatus::Runnable, GoroutineStatus::Running));
        assert!(!g.cas_status(GoroutineStatus::Runnable, GoroutineStatus::Running));
        assert!(g.is_running());
        g.mark_dead();
        assert_eq!(g.status(), GoroutineStatus::Dead);
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(GoroutineStatus::from(0), GoroutineStatus::Runnable);
        assert_eq!(GoroutineStatus::from(1), GoroutineStatus::Running);
        assert_eq!(GoroutineStatus::from(9), GoroutineStatus::Dead);
    }
}
