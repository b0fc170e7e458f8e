//! Channel 实现
//!
//! 基于互斥锁与条件变量实现的 Go 风格 Channel。
//! 容量为 0 时是同步交付：发送方一直阻塞到值被某个接收方取走。

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};

use super::signal::{Selector, Signal, Watchers};
use crate::error::{GoError, Result};

/// Channel ID 计数器
static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Channel 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// 打开
    Open,
    /// 已关闭，但仍有值可读
    Draining,
    /// 已关闭且为空
    Closed,
}

/// 非阻塞发送失败，值原样返还
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// 缓冲区已满（或无缓冲且没有等待的接收者）
    Full(T),
    /// Channel 已关闭
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

/// 队列中的一个值
struct Slot<T> {
    /// 交付票据
    ticket: u64,
    value: T,
    /// 发送方是否仍阻塞等待交付（无缓冲的阻塞发送）
    awaiting: bool,
}

/// 互斥锁保护的内部状态
struct State<T> {
    queue: VecDeque<Slot<T>>,
    closed: bool,
    next_ticket: u64,
    /// 已交付但发送方尚未确认的票据
    handed: HashSet<u64>,
    /// 阻塞在 receive 中的接收者数量
    receivers: usize,
    /// 挂起中的 select 接收分支（仅无缓冲 Channel）：(令牌, 分支下标)
    selectors: Vec<(Arc<Selector>, usize)>,
    /// 注册的 select 信号
    watchers: Watchers,
}

struct Shared<T> {
    id: u64,
    capacity: usize,
    state: Mutex<State<T>>,
    send_cond: Condvar,
    recv_cond: Condvar,
}

/// select 对单个分支的就绪判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// 可以立即完成
    Ready,
    /// 暂时不能完成，但以后可能
    Pending,
    /// 永远不可能完成（已关闭且为空）
    Dead,
}

/// Channel
///
/// 句柄可以任意克隆，所有克隆共享同一个 Channel。
/// 支持带缓冲和无缓冲两种模式。
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Channel<T> {
    /// 创建无缓冲 Channel
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// 创建带缓冲 Channel
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                capacity,
                state: Mutex::new(State {
                    queue: VecDeque::with_capacity(capacity),
                    closed: false,
                    next_ticket: 0,
                    handed: HashSet::new(),
                    receivers: 0,
                    selectors: Vec::new(),
                    watchers: Watchers::default(),
                }),
                send_cond: Condvar::new(),
                recv_cond: Condvar::new(),
            }),
        }
    }

    /// 获取 Channel ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// 当前排队的值数量
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// 是否没有排队的值
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }

    /// 是否已关闭（可能仍有值可读）
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// 当前状态，见 `ChannelStatus`
    pub fn status(&self) -> ChannelStatus {
        let state = self.shared.state.lock();
        match (state.closed, state.queue.is_empty()) {
            (false, _) => ChannelStatus::Open,
            (true, false) => ChannelStatus::Draining,
            (true, true) => ChannelStatus::Closed,
        }
    }

    /// 发送值（阻塞）
    ///
    /// 有缓冲时等待空位；无缓冲时等待接收方取走。
    /// Channel 已关闭或等待期间被关闭时返回 `ClosedChannel`。
    pub fn send(&self, value: T) -> Result<()> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if state.closed {
            return Err(GoError::ClosedChannel);
        }

        if shared.capacity == 0 {
            let ticket = self.enqueue(&mut state, value, true);
            loop {
                if state.handed.remove(&ticket) {
                    return Ok(());
                }
                if state.closed {
                    return Err(GoError::ClosedChannel);
                }
                shared.send_cond.wait(&mut state);
            }
        }

        loop {
            if state.closed {
                return Err(GoError::ClosedChannel);
            }
            if state.queue.len() < shared.capacity {
                self.enqueue(&mut state, value, false);
                return Ok(());
            }
            shared.send_cond.wait(&mut state);
        }
    }

    /// 尝试发送（非阻塞）
    ///
    /// 无缓冲 Channel 只有在有接收方（包括挂起的 select 接收分支）等待时才能成功
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>>
    where
        T: Send + 'static,
    {
        self.offer(value, None)
    }

    /// 非阻塞发送，跳过 id 为 exclude 的 select
    pub(crate) fn offer(
        &self,
        value: T,
        exclude: Option<u64>,
    ) -> std::result::Result<(), TrySendError<T>>
    where
        T: Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if self.shared.capacity > 0 {
            if state.queue.len() < self.shared.capacity {
                self.enqueue(&mut state, value, false);
                return Ok(());
            }
            return Err(TrySendError::Full(value));
        }

        if state.receivers > state.queue.len() {
            self.enqueue(&mut state, value, false);
            return Ok(());
        }

        let mut value = value;
        let mut i = 0;
        while i < state.selectors.len() {
            let (selector, index) = &state.selectors[i];
            if Some(selector.id()) == exclude {
                i += 1;
                continue;
            }
            match selector.deliver(*index, value) {
                Ok(()) => {
                    state.selectors.swap_remove(i);
                    return Ok(());
                }
                Err(returned) => {
                    value = returned;
                    i += 1;
                }
            }
        }
        Err(TrySendError::Full(value))
    }

    /// 接收值（阻塞）
    ///
    /// 返回 Some(value) 表示接收成功，None 表示 Channel 已关闭且为空。
    /// 关闭后仍会先读完缓冲区中的值。
    pub fn receive(&self) -> Option<T> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        loop {
            if let Some(value) = self.dequeue(&mut state) {
                return Some(value);
            }
            if state.closed {
                return None;
            }

            // 无缓冲 Channel 上出现等待的接收者，select 的发送分支可能因此就绪
            state.receivers += 1;
            state.watchers.notify_all();
            shared.recv_cond.wait(&mut state);
            state.receivers -= 1;
        }
    }

    /// 尝试接收（非阻塞）
    pub fn try_receive(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        self.dequeue(&mut state)
    }

    /// 关闭 Channel
    ///
    /// 唤醒所有等待者：阻塞中的发送方失败，接收方读完剩余值后得到 None。
    /// 重复关闭返回 `AlreadyClosed`。
    pub fn close(&self) -> Result<()> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        if state.closed {
            return Err(GoError::AlreadyClosed);
        }
        state.closed = true;

        // 仍在等待交付的无缓冲发送全部作废
        state.queue.retain(|slot| !slot.awaiting);

        shared.send_cond.notify_all();
        shared.recv_cond.notify_all();
        state.watchers.notify_all();
        Ok(())
    }

    /// 迭代器：逐个接收直到 Channel 关闭且为空
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    fn enqueue(&self, state: &mut State<T>, value: T, awaiting: bool) -> u64 {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(Slot { ticket, value, awaiting });
        self.shared.recv_cond.notify_one();
        state.watchers.notify_all();
        ticket
    }

    fn dequeue(&self, state: &mut State<T>) -> Option<T> {
        let slot = state.queue.pop_front()?;
        if slot.awaiting {
            state.handed.insert(slot.ticket);
            self.shared.send_cond.notify_all();
        } else {
            self.shared.send_cond.notify_one();
        }
        state.watchers.notify_all();
        Some(slot.value)
    }

    fn send_readiness(&self, state: &State<T>, exclude: Option<u64>) -> Readiness {
        if state.closed {
            return Readiness::Dead;
        }
        let ready = if self.shared.capacity == 0 {
            state.receivers > state.queue.len()
                || state
                    .selectors
                    .iter()
                    .any(|(s, _)| Some(s.id()) != exclude && s.is_open())
        } else {
            state.queue.len() < self.shared.capacity
        };
        if ready {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    // ---- select 支持 ----

    pub(crate) fn poll_send(&self, exclude: Option<u64>) -> Readiness {
        let state = self.shared.state.lock();
        self.send_readiness(&state, exclude)
    }

    pub(crate) fn poll_receive(&self) -> Readiness {
        let state = self.shared.state.lock();
        if !state.queue.is_empty() {
            Readiness::Ready
        } else if state.closed {
            Readiness::Dead
        } else {
            Readiness::Pending
        }
    }

    pub(crate) fn watch(&self, signal: &Arc<Signal>) {
        self.shared.state.lock().watchers.add(signal);
    }

    /// 注册挂起的 select 接收分支；无缓冲时发送方可以把值直接交给它
    pub(crate) fn watch_receive(&self, selector: &Arc<Selector>, index: usize) {
        let mut state = self.shared.state.lock();
        state.watchers.add(selector.signal());
        if self.shared.capacity == 0
            && !state.selectors.iter().any(|(s, _)| s.id() == selector.id())
        {
            state.selectors.push((Arc::clone(selector), index));
            // 等待中的 select 发送分支可能因此就绪
            state.watchers.notify_all();
        }
    }

    pub(crate) fn unwatch(&self, id: u64) {
        let mut state = self.shared.state.lock();
        state.watchers.remove(id);
        state.selectors.retain(|(s, _)| s.id() != id);
    }

    /// 唤醒所有注册的 select
    pub(crate) fn notify_watchers(&self) {
        self.shared.state.lock().watchers.notify_all();
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 借用迭代器
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive()
    }
}

/// 拥有所有权的迭代器
pub struct IntoIter<T> {
    channel: Channel<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

impl<T> IntoIterator for Channel<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { channel: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_channel_unbuffered_in_order() {
        let ch = Channel::new();
        let producer = {
            let ch = ch.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    ch.send(format!("message {}", i)).unwrap();
                }
                ch.close().unwrap();
            })
        };

        let received: Vec<String> = ch.iter().collect();
        producer.join().unwrap();

        let expected: Vec<String> = (0..5).map(|i| format!("message {}", i)).collect();
        assert_eq!(received, expected);
        // 关闭且读完的 Channel 保持耗尽状态
        assert_eq!(ch.iter().next(), None);
        assert_eq!(ch.status(), ChannelStatus::Closed);
    }

    #[test]
    fn test_unbuffered_send_blocks_until_received() {
        let ch = Channel::new();
        let sender = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(42))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!sender.is_finished());
        assert_eq!(ch.receive(), Some(42));
        assert_eq!(sender.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_channel_buffered() {
        let ch = Channel::with_capacity(2);

        assert!(ch.try_send(1).is_ok());
        assert!(ch.try_send(2).is_ok());
        assert_eq!(ch.try_send(3), Err(TrySendError::Full(3)));

        assert_eq!(ch.try_receive(), Some(1));
        assert_eq!(ch.try_receive(), Some(2));
        assert!(ch.try_receive().is_none());
    }

    #[test]
    fn test_unbuffered_try_send_needs_receiver() {
        let ch: Channel<i32> = Channel::new();
        assert_eq!(ch.try_send(1), Err(TrySendError::Full(1)));
    }

    #[test]
    fn test_channel_close() {
        let ch = Channel::with_capacity(1);

        ch.send(42).unwrap();
        ch.close().unwrap();

        assert!(ch.is_closed());
        assert_eq!(ch.status(), ChannelStatus::Draining);
        assert_eq!(ch.send(100), Err(GoError::ClosedChannel));
        assert_eq!(ch.try_send(100), Err(TrySendError::Closed(100)));

        // 仍可接收已缓冲的值
        assert_eq!(ch.receive(), Some(42));
        assert_eq!(ch.receive(), None);
    }

    #[test]
    fn test_double_close() {
        let ch: Channel<()> = Channel::new();
        assert_eq!(ch.close(), Ok(()));
        assert_eq!(ch.close(), Err(GoError::AlreadyClosed));
    }

    #[test]
    fn test_concurrent_close_single_winner() {
        let ch: Channel<u8> = Channel::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ch = ch.clone();
                thread::spawn(move || ch.close())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| *r == Err(GoError::AlreadyClosed)));
    }

    #[test]
    fn test_close_wakes_blocked_sender() {
        let ch = Channel::new();
        let sender = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(7))
        };

        thread::sleep(Duration::from_millis(50));
        ch.close().unwrap();
        assert_eq!(sender.join().unwrap(), Err(GoError::ClosedChannel));
        // 未交付的值不会留给接收方
        assert_eq!(ch.receive(), None);
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let ch: Channel<i32> = Channel::with_capacity(4);
        let receiver = {
            let ch = ch.clone();
            thread::spawn(move || ch.receive())
        };

        thread::sleep(Duration::from_millis(50));
        ch.close().unwrap();
        assert_eq!(receiver.join().unwrap(), None);
    }

    #[test]
    fn test_buffered_sender_waits_for_room() {
        let ch = Channel::with_capacity(1);
        ch.send(1).unwrap();

        let sender = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!sender.is_finished());

        assert_eq!(ch.receive(), Some(1));
        assert_eq!(sender.join().unwrap(), Ok(()));
        assert_eq!(ch.receive(), Some(2));
    }

    #[test]
    fn test_many_producers_all_values_arrive() {
        let ch = Channel::with_capacity(3);
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ch = ch.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        ch.send(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();

        let consumer = {
            let ch = ch.clone();
            thread::spawn(move || ch.into_iter().collect::<Vec<_>>())
        };

        for p in producers {
            p.join().unwrap();
        }
        ch.close().unwrap();

        let mut values = consumer.join().unwrap();
        assert_eq!(values.len(), 400);
        // 同一生产者的值保持发送顺序
        for p in 0..4 {
            let own: Vec<_> = values.iter().filter(|v| **v / 1000 == p).copied().collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
        values.sort();
        values.dedup();
        assert_eq!(values.len(), 400);
    }
}
