//! `replay`（spec §4.10）：与 `publish` 同构的多播，只是共享缓冲变成了一个
//! 可重放的历史缓冲区。
//!
//! # 设计背景（Why）
//! - spec 把 replay 描述成"所有订阅者共享同一个缓冲区，各自持有指向缓冲区的
//!   索引/节点指针"；本实现把它简化成等价但更容易独立推理的形式：每个新订阅者
//!   在注册时获得缓冲区当前内容的一份快照（克隆进它自己的私有队列），此后活跃期
//!   产生的新值由广播路径直接追加到每个订阅者的私有队列。两者在"每个订阅者看到
//!   的值序列"上是一致的，差别只在于内存布局（共享节点 vs. 每订阅者私有拷贝），
//!   换来的是每个订阅者可以按照自己的需求量独立漏出（不需要 `publish` 那种
//!   "按最慢消费者协调上游请求量"的折衷——因为重放缓冲区本身已经承担了对齐历史
//!   的职责，上游一经连接就以 `i64::MAX` 被无条件拉取）。
//! - `T: Clone` 是必要代价：缓冲区需要把同一个值交给多个订阅者。
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use crate::disposable::{CallbackDisposable, Disposable};
use crate::error::ReactorError;
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};
use crate::request::{RequestCounter, validate_request_amount};
use crate::scheduler::{MonotonicTimePoint, Scheduler};
use crate::timed::Timed;

#[cfg(feature = "std")]
use std::sync::Mutex;

#[cfg(not(feature = "std"))]
use spin::Mutex;

fn lock<T>(mutex: &Mutex<T>) -> impl core::ops::DerefMut<Target = T> + '_ {
    #[cfg(feature = "std")]
    {
        mutex.lock().unwrap_or_else(|p| p.into_inner())
    }
    #[cfg(not(feature = "std"))]
    {
        mutex.lock()
    }
}

fn shallow_copy(error: &ReactorError) -> ReactorError {
    ReactorError::new(error.code(), error.kind(), error.message())
}

/// 重放缓冲区的留存策略（spec §4.10）。
pub enum ReplayBound {
    /// 无界：保留自订阅起的全部历史。
    Unbounded,
    /// 只保留最近 `max_size` 个值。
    SizeBounded { max_size: usize },
    /// 只保留 `max_age` 之内的值（惰性地在读取/写入时淘汰过期尾部）。
    TimeBounded { max_age: Duration },
    /// 同时应用数量上限与时间上限。
    SizeAndTimeBounded { max_size: usize, max_age: Duration },
}

#[derive(Clone)]
enum Terminal {
    Complete,
    Error(Arc<ReactorError>),
}

impl<T> FlowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `replay(bound, scheduler)`（spec §4.10）：`scheduler` 只用于给缓冲区的值
    /// 打时间戳（`TimeBounded`/`SizeAndTimeBounded` 据此淘汰），`Unbounded`/
    /// `SizeBounded` 下仍然记录时间戳但从不据此淘汰。
    pub fn replay(&self, bound: ReplayBound, scheduler: Arc<dyn Scheduler>) -> ConnectableReplay<T> {
        ConnectableReplay {
            state: Arc::new(ReplayState {
                source: self.clone(),
                bound,
                scheduler,
                buffer: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                upstream: Mutex::new(None),
                connected: AtomicBool::new(false),
                terminal: Mutex::new(None),
            }),
        }
    }

    /// `replay(bound, scheduler).ref_count()` 的便捷组合。
    pub fn replay_ref_count(&self, bound: ReplayBound, scheduler: Arc<dyn Scheduler>) -> FlowStream<T> {
        self.replay(bound, scheduler).ref_count()
    }
}

pub struct ConnectableReplay<T> {
    state: Arc<ReplayState<T>>,
}

impl<T> ConnectableReplay<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn as_stream(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(ReplayMulticastSource {
            state: self.state.clone(),
        }))
    }

    pub fn connect(&self) -> Arc<dyn Disposable> {
        if !self.state.connected.swap(true, Ordering::AcqRel) {
            let observer = Arc::new(ReplayUpstreamObserver {
                state: self.state.clone(),
            });
            self.state.source.subscribe(observer);
        }
        let state = self.state.clone();
        Arc::new(CallbackDisposable::new(move || {
            if let Some(sub) = lock(&state.upstream).as_ref() {
                sub.cancel();
            }
        }))
    }

    pub fn ref_count(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(ReplayRefCountSource {
            state: self.state.clone(),
            active_count: Arc::new(core::sync::atomic::AtomicI64::new(0)),
            connection: Mutex::new(None),
        }))
    }
}

struct ReplayState<T> {
    source: FlowStream<T>,
    bound: ReplayBound,
    scheduler: Arc<dyn Scheduler>,
    buffer: Mutex<VecDeque<Timed<T>>>,
    subscribers: Mutex<BTreeMap<u64, Arc<ReplaySubscriber<T>>>>,
    next_id: AtomicU64,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    connected: AtomicBool,
    terminal: Mutex<Option<Terminal>>,
}

impl<T: Clone + Send + Sync + 'static> ReplayState<T> {
    fn trim(&self, buffer: &mut VecDeque<Timed<T>>, now: MonotonicTimePoint) {
        match &self.bound {
            ReplayBound::Unbounded => {}
            ReplayBound::SizeBounded { max_size } => {
                while buffer.len() > *max_size {
                    buffer.pop_front();
                }
            }
            ReplayBound::TimeBounded { max_age } => {
                while let Some(front) = buffer.front() {
                    if now.saturating_duration_since(front.timestamp) > *max_age {
                        buffer.pop_front();
                    } else {
                        break;
                    }
                }
            }
            ReplayBound::SizeAndTimeBounded { max_size, max_age } => {
                while buffer.len() > *max_size {
                    buffer.pop_front();
                }
                while let Some(front) = buffer.front() {
                    if now.saturating_duration_since(front.timestamp) > *max_age {
                        buffer.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
    }

    fn push(&self, value: T) {
        let now = self.scheduler.now();
        let mut buffer = lock(&self.buffer);
        buffer.push_back(Timed::new(value, now));
        self.trim(&mut buffer, now);
    }

    fn snapshot(&self) -> Vec<T> {
        let now = self.scheduler.now();
        let mut buffer = lock(&self.buffer);
        self.trim(&mut buffer, now);
        buffer.iter().map(|timed| timed.value.clone()).collect()
    }

    fn register(self: &Arc<Self>, observer: Arc<dyn FlowObserver<T>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let seed = self.snapshot();
        let subscriber = Arc::new(ReplaySubscriber {
            queue: Mutex::new(seed.into_iter().collect()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            observer: observer.clone(),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });
        lock(&self.subscribers).insert(id, subscriber.clone());
        observer.on_subscribe(Arc::new(ReplaySubscription {
            state: self.clone(),
            id,
        }));
        if let Some(terminal) = lock(&self.terminal).clone() {
            subscriber.done.store(true, Ordering::Release);
            if let Terminal::Error(error) = &terminal {
                *lock(&subscriber.error) = Some(shallow_copy(error));
            }
            subscriber.drain();
        }
        id
    }

    fn unregister(self: &Arc<Self>, id: u64) {
        if let Some(subscriber) = lock(&self.subscribers).remove(&id) {
            subscriber.terminated.store(true, Ordering::Release);
            lock(&subscriber.queue).clear();
        }
    }

    fn broadcast_next(self: &Arc<Self>, value: T) {
        self.push(value.clone());
        let subscribers: Vec<Arc<ReplaySubscriber<T>>> =
            lock(&self.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            lock(&subscriber.queue).push_back(value.clone());
            subscriber.drain();
        }
    }

    fn broadcast_terminal(self: &Arc<Self>, terminal: Terminal) {
        *lock(&self.terminal) = Some(terminal.clone());
        let subscribers: Vec<Arc<ReplaySubscriber<T>>> =
            lock(&self.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            subscriber.done.store(true, Ordering::Release);
            if let Terminal::Error(error) = &terminal {
                *lock(&subscriber.error) = Some(shallow_copy(error));
            }
            subscriber.drain();
        }
    }
}

struct ReplaySubscriber<T> {
    queue: Mutex<VecDeque<T>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    observer: Arc<dyn FlowObserver<T>>,
    done: AtomicBool,
    error: Mutex<Option<ReactorError>>,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> ReplaySubscriber<T> {
    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                lock(&self.queue).clear();
                return;
            }
            loop {
                if self.requested.current() <= 0 {
                    break;
                }
                let next = lock(&self.queue).pop_front();
                match next {
                    Some(value) => {
                        self.requested.produced(1);
                        self.observer.on_next(value);
                    }
                    None => break,
                }
            }
            let finish_now = self.done.load(Ordering::Acquire) && lock(&self.queue).is_empty();
            if finish_now && !self.terminated.swap(true, Ordering::AcqRel) {
                match lock(&self.error).take() {
                    Some(error) => self.observer.on_error(error),
                    None => self.observer.on_complete(),
                }
                return;
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

struct ReplayMulticastSource<T> {
    state: Arc<ReplayState<T>>,
}
impl<T: Clone + Send + Sync + 'static> Flow<T> for ReplayMulticastSource<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        self.state.register(observer);
    }
}

struct ReplaySubscription<T> {
    state: Arc<ReplayState<T>>,
    id: u64,
}
impl<T: Clone + Send + Sync + 'static> Subscription for ReplaySubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            if let Some(subscriber) = lock(&self.state.subscribers).get(&self.id).cloned() {
                if !subscriber.terminated.swap(true, Ordering::AcqRel) {
                    subscriber.observer.on_error(err);
                }
            }
            self.state.unregister(self.id);
            return;
        }
        if let Some(subscriber) = lock(&self.state.subscribers).get(&self.id).cloned() {
            subscriber.requested.add(n);
            subscriber.drain();
        }
    }
    fn cancel(&self) {
        self.state.unregister(self.id);
    }
}

struct ReplayUpstreamObserver<T> {
    state: Arc<ReplayState<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for ReplayUpstreamObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.broadcast_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.broadcast_terminal(Terminal::Error(Arc::new(error)));
    }
    fn on_complete(&self) {
        self.state.broadcast_terminal(Terminal::Complete);
    }
}

struct ReplayRefCountSource<T> {
    state: Arc<ReplayState<T>>,
    active_count: Arc<core::sync::atomic::AtomicI64>,
    connection: Mutex<Option<Arc<dyn Disposable>>>,
}
impl<T: Clone + Send + Sync + 'static> Flow<T> for ReplayRefCountSource<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        if self.active_count.fetch_add(1, Ordering::AcqRel) == 0 {
            let connectable = ConnectableReplay {
                state: self.state.clone(),
            };
            *lock(&self.connection) = Some(connectable.connect());
        }
        self.state.register(Arc::new(ReplayRefCountObserver {
            downstream: observer,
            active_count: self.active_count.clone(),
            source: self.clone(),
        }));
    }
}

struct ReplayRefCountObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    active_count: Arc<core::sync::atomic::AtomicI64>,
    source: Arc<ReplayRefCountSource<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for ReplayRefCountObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(Arc::new(ReplayRefCountSubscription {
            inner: subscription,
            active_count: self.active_count.clone(),
            source: self.source.clone(),
            released: AtomicBool::new(false),
        }));
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct ReplayRefCountSubscription<T> {
    inner: Arc<dyn Subscription>,
    active_count: Arc<core::sync::atomic::AtomicI64>,
    source: Arc<ReplayRefCountSource<T>>,
    released: AtomicBool,
}
impl<T: Send + Sync + 'static> Subscription for ReplayRefCountSubscription<T> {
    fn request(&self, n: i64) {
        self.inner.request(n);
    }
    fn cancel(&self) {
        self.inner.cancel();
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.active_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(connection) = lock(&self.source.connection).take() {
                connection.dispose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
    use crate::scheduler::ImmediateScheduler;
    use alloc::vec::Vec as StdVec;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        values: StdMutex<StdVec<i64>>,
        completed: AtomicBool,
    }
    impl FlowObserver<i64> for CollectingObserver {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&self, value: i64) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn late_subscriber_replays_the_full_history_then_sees_completion() {
        let source = just(alloc::vec![1i64, 2, 3]);
        let connectable = source.replay(ReplayBound::Unbounded, Arc::new(ImmediateScheduler));
        connectable.connect();

        let late = Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        connectable.as_stream().subscribe(late.clone());
        assert_eq!(*late.values.lock().unwrap(), alloc::vec![1, 2, 3]);
        assert!(late.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn size_bounded_replay_only_keeps_the_most_recent_values() {
        let source = just(alloc::vec![1i64, 2, 3, 4, 5]);
        let connectable = source.replay(
            ReplayBound::SizeBounded { max_size: 2 },
            Arc::new(ImmediateScheduler),
        );
        connectable.connect();

        let late = Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        connectable.as_stream().subscribe(late.clone());
        assert_eq!(*late.values.lock().unwrap(), alloc::vec![4, 5]);
    }
}
