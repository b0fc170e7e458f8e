//! select 引擎
//!
//! 在一组 Channel 操作（以及 Context 的 done 信号）上等待，恰好完成其中一个。
//! 多个分支同时就绪时均匀随机选择，避免靠前的分支饿死后面的分支。

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use rand::seq::SliceRandom;

use super::channel::{Channel, Readiness, TrySendError};
use super::context::DoneSignal;
use super::signal::Selector;
use crate::error::{GoError, Result};

/// 分支方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 接收
    Get,
    /// 发送
    Put,
    /// Context 完成信号
    Done,
}

/// 分支完成尝试的结果
enum Fired {
    /// 已完成，接收分支携带收到的值
    Completed(Option<Box<dyn Any + Send>>),
    /// 判断就绪后被其他线程抢先
    Lost,
}

/// 单个分支的类型擦除接口
trait CaseOp: Send {
    fn direction(&self) -> Direction;
    fn poll(&self, selector: &Selector) -> Result<Readiness>;
    fn fire(&mut self, selector: &Selector) -> Fired;
    fn watch(&self, selector: &Arc<Selector>, index: usize);
    fn unwatch(&self, id: u64);
    /// select 放弃认领后唤醒可能因此错过的对端
    fn wake_peers(&self) {}
    /// 分支自身会在何时就绪（用于 done 信号的截止时间）
    fn wake_at(&self) -> Option<Instant> {
        None
    }
}

struct GetOp<T> {
    channel: Channel<T>,
}

impl<T: Send + 'static> CaseOp for GetOp<T> {
    fn direction(&self) -> Direction {
        Direction::Get
    }

    fn poll(&self, _selector: &Selector) -> Result<Readiness> {
        Ok(self.channel.poll_receive())
    }

    fn fire(&mut self, _selector: &Selector) -> Fired {
        match self.channel.try_receive() {
            Some(value) => Fired::Completed(Some(Box::new(value))),
            None => Fired::Lost,
        }
    }

    fn watch(&self, selector: &Arc<Selector>, index: usize) {
        self.channel.watch_receive(selector, index);
    }

    fn unwatch(&self, id: u64) {
        self.channel.unwatch(id);
    }

    fn wake_peers(&self) {
        self.channel.notify_watchers();
    }
}

struct PutOp<T> {
    channel: Channel<T>,
    value: Option<T>,
}

impl<T: Send + 'static> CaseOp for PutOp<T> {
    fn direction(&self) -> Direction {
        Direction::Put
    }

    fn poll(&self, selector: &Selector) -> Result<Readiness> {
        match self.channel.poll_send(Some(selector.id())) {
            Readiness::Dead => Err(GoError::ClosedChannel),
            readiness => Ok(readiness),
        }
    }

    fn fire(&mut self, selector: &Selector) -> Fired {
        let Some(value) = self.value.take() else {
            return Fired::Lost;
        };
        match self.channel.offer(value, Some(selector.id())) {
            Ok(()) => Fired::Completed(None),
            Err(TrySendError::Full(value)) | Err(TrySendError::Closed(value)) => {
                self.value = Some(value);
                Fired::Lost
            }
        }
    }

    fn watch(&self, selector: &Arc<Selector>, _index: usize) {
        self.channel.watch(selector.signal());
    }

    fn unwatch(&self, id: u64) {
        self.channel.unwatch(id);
    }
}

struct DoneOp {
    signal: DoneSignal,
}

impl CaseOp for DoneOp {
    fn direction(&self) -> Direction {
        Direction::Done
    }

    fn poll(&self, _selector: &Selector) -> Result<Readiness> {
        Ok(if self.signal.is_fired() {
            Readiness::Ready
        } else {
            Readiness::Pending
        })
    }

    fn fire(&mut self, _selector: &Selector) -> Fired {
        // 完成信号一旦触发就永久保持
        Fired::Completed(None)
    }

    fn watch(&self, selector: &Arc<Selector>, _index: usize) {
        self.signal.watch(selector.signal());
    }

    fn unwatch(&self, id: u64) {
        self.signal.unwatch(id);
    }

    fn wake_at(&self) -> Option<Instant> {
        self.signal.deadline()
    }
}

/// select 的一个候选操作
pub struct Case {
    op: Box<dyn CaseOp>,
}

impl Case {
    /// 接收分支
    pub fn get<T: Send + 'static>(channel: &Channel<T>) -> Self {
        Self {
            op: Box::new(GetOp {
                channel: channel.clone(),
            }),
        }
    }

    /// 发送分支；未被选中时值被丢弃
    pub fn put<T: Send + 'static>(channel: &Channel<T>, value: T) -> Self {
        Self {
            op: Box::new(PutOp {
                channel: channel.clone(),
                value: Some(value),
            }),
        }
    }

    /// Context 完成分支
    pub fn done(signal: &DoneSignal) -> Self {
        Self {
            op: Box::new(DoneOp {
                signal: signal.clone(),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.op.direction()
    }
}

impl std::fmt::Debug for Case {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Case").field("direction", &self.direction()).finish()
    }
}

/// select 的结果
pub struct Selected {
    index: usize,
    direction: Direction,
    value: Option<Box<dyn Any + Send>>,
}

impl Selected {
    /// 被选中分支的下标（按传入顺序）
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 取出接收分支收到的值；类型不符或不是接收分支时返回 None
    pub fn take<T: 'static>(&mut self) -> Option<T> {
        let boxed = self.value.take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                self.value = Some(boxed);
                None
            }
        }
    }

    pub fn into_value<T: 'static>(mut self) -> Option<T> {
        self.take()
    }
}

impl std::fmt::Debug for Selected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selected")
            .field("index", &self.index)
            .field("direction", &self.direction)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

/// select 构建器
///
/// 每次添加分支返回其下标，用来匹配 `Selected::index`
#[derive(Debug, Default)]
pub struct Select {
    cases: Vec<Case>,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv<T: Send + 'static>(&mut self, channel: &Channel<T>) -> usize {
        self.push(Case::get(channel))
    }

    pub fn send<T: Send + 'static>(&mut self, channel: &Channel<T>, value: T) -> usize {
        self.push(Case::put(channel, value))
    }

    pub fn done(&mut self, signal: &DoneSignal) -> usize {
        self.push(Case::done(signal))
    }

    pub fn push(&mut self, case: Case) -> usize {
        self.cases.push(case);
        self.cases.len() - 1
    }

    pub fn select(self) -> Result<Selected> {
        run(self.cases, None)
    }

    pub fn select_timeout(self, timeout: Duration) -> Result<Selected> {
        run(self.cases, Some(Instant::now() + timeout))
    }
}

/// 阻塞直到某个分支完成
///
/// 所有分支都不可能再就绪时返回 `SelectDeadlock`；
/// 发送分支的 Channel 已关闭时返回 `ClosedChannel`。
pub fn select(cases: Vec<Case>) -> Result<Selected> {
    run(cases, None)
}

/// 带超时的 select，超时返回 `Timeout`
pub fn select_timeout(cases: Vec<Case>, timeout: Duration) -> Result<Selected> {
    run(cases, Some(Instant::now() + timeout))
}

fn run(mut cases: Vec<Case>, deadline: Option<Instant>) -> Result<Selected> {
    if cases.is_empty() {
        return Err(GoError::EmptySelect);
    }

    let selector = Selector::new();
    let mut watching = false;
    let result = resolve(&mut cases, deadline, &selector, &mut watching);

    if watching {
        for case in &cases {
            case.op.unwatch(selector.id());
        }
    }
    result
}

fn resolve(
    cases: &mut [Case],
    deadline: Option<Instant>,
    selector: &Arc<Selector>,
    watching: &mut bool,
) -> Result<Selected> {
    let mut rng = rand::thread_rng();

    'scan: loop {
        // 对端发送方已经把值直接交给了某个接收分支
        if let Some((index, value)) = selector.take_delivery() {
            return Ok(Selected {
                index,
                direction: Direction::Get,
                value: Some(value),
            });
        }

        let mut ready = Vec::new();
        let mut live = false;
        for (index, case) in cases.iter().enumerate() {
            match case.op.poll(selector) {
                Ok(Readiness::Ready) => ready.push(index),
                Ok(Readiness::Pending) => live = true,
                Ok(Readiness::Dead) => {}
                Err(err) => {
                    if !selector.claim() {
                        continue 'scan;
                    }
                    return Err(err);
                }
            }
        }

        let raced = !ready.is_empty();
        while let Some(&index) = ready.choose(&mut rng) {
            if !selector.claim() {
                continue 'scan;
            }
            match cases[index].op.fire(selector) {
                Fired::Completed(value) => {
                    return Ok(Selected {
                        index,
                        direction: cases[index].op.direction(),
                        value,
                    });
                }
                Fired::Lost => {
                    selector.release();
                    if *watching {
                        for case in cases.iter() {
                            case.op.wake_peers();
                        }
                    }
                    ready.retain(|&i| i != index);
                }
            }
        }
        if raced {
            // 就绪的分支都被抢走了，重新扫描
            continue;
        }

        if !live {
            if !selector.claim() {
                continue;
            }
            return Err(GoError::SelectDeadlock);
        }

        // 先注册再重新扫描一次，避免丢失注册前发生的唤醒
        if !*watching {
            for (index, case) in cases.iter().enumerate() {
                case.op.watch(selector, index);
            }
            *watching = true;
            continue;
        }

        let wake_at = cases
            .iter()
            .filter_map(|c| c.op.wake_at())
            .chain(deadline)
            .min();
        let notified = selector.signal().wait_until(wake_at);
        if !notified {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline && selector.claim() {
                    return Err(GoError::Timeout);
                }
            }
        }
    }
}
