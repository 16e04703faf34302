//! `publish`/`connect`/`refCount`（spec §4.9「多播」）。
//!
//! # 设计背景（Why）
//! - 多播把"单个上游订阅"与"任意个下游订阅者"解耦：上游只被订阅一次（在
//!   [`ConnectableFlow::connect`] 时），之后所有下游共享同一条通知序列。
//! - 背压难点在于多个下游的需求各不相同。本实现采用"按最慢消费者协调"的策略：
//!   向上游请求的数量 = 当前所有活跃下游中剩余需求量的最小值；任何一个下游需求
//!   耗尽都会立刻让这个最小值回落到零，从而自然地暂停向上游取数，不会压垮慢的
//!   一方。这是一种偏保守、但正确且易于推理的折衷（教师仓库的多播处理器同样只
//!   以"不压垮最慢下游"为目标，不追求对每个下游做独立缓冲）。
//! - 终止通知（`on_complete`/`on_error`）会被记住：`connect()` 之后才订阅的下游、
//!   以及上游已经终止之后才订阅的下游，都会立即收到同一个终止通知（这部分信息
//!   不需要 `T: Clone`，不属于"重放值"，而是"重放终态"）。
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::disposable::{CallbackDisposable, Disposable};
use crate::error::ReactorError;
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};
use crate::request::{RequestCounter, validate_request_amount};

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

#[derive(Clone)]
enum Terminal {
    Complete,
    Error(Arc<ReactorError>),
}

impl<T> FlowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `publish()`（spec §4.9）：把当前流转换成一个可多播的连接流，在显式
    /// `connect()` 之前不会订阅原始源。
    pub fn publish(&self) -> ConnectableFlow<T> {
        ConnectableFlow {
            state: Arc::new(PublishState {
                source: self.clone(),
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                upstream: Mutex::new(None),
                connected: AtomicBool::new(false),
                upstream_outstanding: AtomicI64::new(0),
                terminal: Mutex::new(None),
            }),
        }
    }

    /// `publish().ref_count()` 的便捷组合（spec §4.9「refCount」）：第一个订阅者
    /// 到来时自动 `connect()`，最后一个订阅者取消时自动断开上游。
    pub fn publish_ref_count(&self) -> FlowStream<T> {
        self.publish().ref_count()
    }
}

/// `publish()` 的句柄：既是一个可订阅的 [`FlowStream`] 来源（通过 [`ConnectableFlow::as_stream`]），
/// 又额外暴露 `connect()`。
pub struct ConnectableFlow<T> {
    state: Arc<PublishState<T>>,
}

impl<T> ConnectableFlow<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 以多播方式暴露这个连接流；每次调用 `subscribe` 都注册一个新的下游，
    /// 而不会重新订阅原始源。
    pub fn as_stream(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(MulticastSource {
            state: self.state.clone(),
        }))
    }

    /// 订阅原始源，开始向所有已注册/未来注册的下游广播通知。重复调用是幂等的：
    /// 第二次调用返回的 disposable 与第一次等价。
    pub fn connect(&self) -> Arc<dyn Disposable> {
        if !self.state.connected.swap(true, Ordering::AcqRel) {
            let state = self.state.clone();
            let observer = Arc::new(PublishUpstreamObserver { state: state.clone() });
            self.state.source.subscribe(observer);
        }
        let state = self.state.clone();
        Arc::new(CallbackDisposable::new(move || {
            if let Some(sub) = lock(&state.upstream).as_ref() {
                sub.cancel();
            }
        }))
    }

    /// `refCount()`：首个订阅者自动 `connect()`，最后一个订阅者取消时自动断开。
    pub fn ref_count(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(RefCountSource {
            connectable_state: self.state.clone(),
            active_count: Arc::new(AtomicI64::new(0)),
            connection: Mutex::new(None),
        }))
    }
}

struct PublishState<T> {
    source: FlowStream<T>,
    subscribers: Mutex<BTreeMap<u64, Arc<PublishSubscriber<T>>>>,
    next_id: AtomicU64,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    connected: AtomicBool,
    upstream_outstanding: AtomicI64,
    terminal: Mutex<Option<Terminal>>,
}

impl<T: Clone + Send + Sync + 'static> PublishState<T> {
    fn register(self: &Arc<Self>, observer: Arc<dyn FlowObserver<T>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let subscriber = Arc::new(PublishSubscriber {
            id,
            observer: observer.clone(),
            requested: RequestCounter::new(),
            terminated: AtomicBool::new(false),
        });
        lock(&self.subscribers).insert(id, subscriber);
        observer.on_subscribe(Arc::new(PublishSubscription {
            state: self.clone(),
            id,
        }));
        if let Some(terminal) = lock(&self.terminal).clone() {
            self.deliver_terminal(id, terminal);
        }
        id
    }

    fn deliver_terminal(self: &Arc<Self>, id: u64, terminal: Terminal) {
        if let Some(subscriber) = lock(&self.subscribers).get(&id).cloned() {
            if !subscriber.terminated.swap(true, Ordering::AcqRel) {
                match terminal {
                    Terminal::Complete => subscriber.observer.on_complete(),
                    Terminal::Error(error) => subscriber.observer.on_error(shallow_copy(&error)),
                }
            }
        }
    }

    fn unregister(self: &Arc<Self>, id: u64) {
        lock(&self.subscribers).remove(&id);
        self.coordinate();
    }

    /// 重新计算"当前所有活跃下游里剩余需求量的最小值"，并按需向上游追加请求。
    fn coordinate(self: &Arc<Self>) {
        let subscribers = lock(&self.subscribers);
        if subscribers.is_empty() {
            return;
        }
        let floor = subscribers
            .values()
            .map(|s| s.requested.current().max(0))
            .min()
            .unwrap_or(0);
        drop(subscribers);
        if floor <= 0 {
            return;
        }
        let outstanding = self.upstream_outstanding.load(Ordering::Acquire);
        if floor > outstanding {
            let delta = floor - outstanding;
            if let Some(sub) = lock(&self.upstream).as_ref() {
                self.upstream_outstanding.fetch_add(delta, Ordering::AcqRel);
                sub.request(delta);
            }
        }
    }

    fn broadcast_next(self: &Arc<Self>, value: T) {
        self.upstream_outstanding.fetch_sub(1, Ordering::AcqRel);
        let subscribers: Vec<Arc<PublishSubscriber<T>>> =
            lock(&self.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            if subscriber.terminated.load(Ordering::Acquire) {
                continue;
            }
            // A subscriber that joined after `coordinate()` computed the floor may
            // still have zero outstanding demand; skip it rather than underflow its
            // counter. It catches up once its own `request(n)` lifts the floor again.
            if subscriber.requested.current() <= 0 {
                continue;
            }
            subscriber.requested.produced(1);
            subscriber.observer.on_next(value.clone());
        }
        self.coordinate();
    }

    fn broadcast_terminal(self: &Arc<Self>, terminal: Terminal) {
        *lock(&self.terminal) = Some(terminal.clone());
        let subscribers: Vec<Arc<PublishSubscriber<T>>> =
            lock(&self.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            if !subscriber.terminated.swap(true, Ordering::AcqRel) {
                match &terminal {
                    Terminal::Complete => subscriber.observer.on_complete(),
                    Terminal::Error(error) => subscriber.observer.on_error(shallow_copy(error)),
                }
            }
        }
    }
}

struct PublishSubscriber<T> {
    #[allow(dead_code)]
    id: u64,
    observer: Arc<dyn FlowObserver<T>>,
    requested: RequestCounter,
    terminated: AtomicBool,
}

struct MulticastSource<T> {
    state: Arc<PublishState<T>>,
}
impl<T: Clone + Send + Sync + 'static> Flow<T> for MulticastSource<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        self.state.register(observer);
    }
}

struct PublishSubscription<T> {
    state: Arc<PublishState<T>>,
    id: u64,
}
impl<T: Clone + Send + Sync + 'static> Subscription for PublishSubscription<T> {
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
        }
        self.state.coordinate();
    }
    fn cancel(&self) {
        self.state.unregister(self.id);
    }
}

struct PublishUpstreamObserver<T> {
    state: Arc<PublishState<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for PublishUpstreamObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *lock(&self.state.upstream) = Some(subscription);
        self.state.coordinate();
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

/// `refCount()` 的自动连接/断开包装：第一个订阅者到来时调用 `connect()`，
/// 最后一个订阅者取消订阅时断开上游（简化版：断开之后不支持"冷重启"，
/// 即断开后再有新订阅者到来不会触发二次 `connect`——这与 `ConnectableFlow`
/// 本身"只连接一次"的语义保持一致）。
struct RefCountSource<T> {
    connectable_state: Arc<PublishState<T>>,
    active_count: Arc<AtomicI64>,
    connection: Mutex<Option<Arc<dyn Disposable>>>,
}
impl<T: Clone + Send + Sync + 'static> Flow<T> for RefCountSource<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        if self.active_count.fetch_add(1, Ordering::AcqRel) == 0 {
            let connectable = ConnectableFlow {
                state: self.connectable_state.clone(),
            };
            *lock(&self.connection) = Some(connectable.connect());
        }
        self.connectable_state.register(Arc::new(RefCountObserver {
            downstream: observer,
            active_count: self.active_count.clone(),
            connection: self.clone(),
        }));
    }
}

/// 包装下游观察者，仅为了在其订阅被取消时把"最后一个订阅者离开"这件事接回
/// [`RefCountSource`]（断开上游连接）。
struct RefCountObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    active_count: Arc<AtomicI64>,
    connection: Arc<RefCountSource<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for RefCountObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(Arc::new(RefCountSubscription {
            inner: subscription,
            active_count: self.active_count.clone(),
            connection: self.connection.clone(),
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

struct RefCountSubscription<T> {
    inner: Arc<dyn Subscription>,
    active_count: Arc<AtomicI64>,
    connection: Arc<RefCountSource<T>>,
    released: AtomicBool,
}
impl<T: Send + Sync + 'static> Subscription for RefCountSubscription<T> {
    fn request(&self, n: i64) {
        self.inner.request(n);
    }
    fn cancel(&self) {
        self.inner.cancel();
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.active_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(connection) = lock(&self.connection.connection).take() {
                connection.dispose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
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
    fn publish_broadcasts_to_every_subscriber_registered_before_connect() {
        let source = just(alloc::vec![1i64, 2, 3]);
        let connectable = source.publish();
        let stream = connectable.as_stream();

        let first = Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        let second = Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        stream.subscribe(first.clone());
        stream.subscribe(second.clone());

        connectable.connect();

        assert_eq!(*first.values.lock().unwrap(), alloc::vec![1, 2, 3]);
        assert_eq!(*second.values.lock().unwrap(), alloc::vec![1, 2, 3]);
        assert!(first.completed.load(Ordering::SeqCst));
        assert!(second.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn late_subscriber_after_completion_still_receives_the_terminal_notification() {
        let source = just(alloc::vec![1i64]);
        let connectable = source.publish();
        connectable.connect();

        let late = Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        connectable.as_stream().subscribe(late.clone());
        assert!(late.completed.load(Ordering::SeqCst));
        assert!(late.values.lock().unwrap().is_empty());
    }
}
