//! `concat`/`concatMap`（spec §4.8）。
//!
//! 多个流顺次拼接，对外表现为单一订阅：一个源完成后才开始订阅下一个源。
//! 请求量的转发使用 [`SubscriptionArbiter`]（与教师仓库 retry/repeat 所用的
//! "替换底层订阅、结转请求量"模式一致），而不是各自维护一套计数逻辑。
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arbiter::SubscriptionArbiter;
use crate::error::ReactorError;
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};

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

/// 依次拼接一组流：前一个完成后才订阅下一个。
pub fn concat_streams<T>(sources: Vec<FlowStream<T>>) -> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    FlowStream::new(Arc::new(ConcatFlow { sources }))
}

struct ConcatFlow<T> {
    sources: Vec<FlowStream<T>>,
}

impl<T: Send + Sync + 'static> Flow<T> for ConcatFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let arbiter = Arc::new(SubscriptionArbiter::new());
        let state = Arc::new(ConcatState {
            sources: self.sources.clone(),
            index: AtomicUsize::new(0),
            arbiter: arbiter.clone(),
            downstream: observer.clone(),
        });
        observer.on_subscribe(arbiter);
        state.subscribe_next();
    }
}

struct ConcatState<T> {
    sources: Vec<FlowStream<T>>,
    index: AtomicUsize,
    arbiter: Arc<SubscriptionArbiter>,
    downstream: Arc<dyn FlowObserver<T>>,
}

impl<T: Send + Sync + 'static> ConcatState<T> {
    fn subscribe_next(self: &Arc<Self>) {
        let idx = self.index.fetch_add(1, Ordering::AcqRel);
        match self.sources.get(idx) {
            Some(source) => {
                let inner_observer = Arc::new(ConcatInnerObserver {
                    state: self.clone(),
                });
                source.subscribe(inner_observer);
            }
            None => {
                self.downstream.on_complete();
            }
        }
    }
}

struct ConcatInnerObserver<T> {
    state: Arc<ConcatState<T>>,
}

impl<T: Send + Sync + 'static> FlowObserver<T> for ConcatInnerObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.arbiter.produced(1);
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.state.subscribe_next();
    }
}

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `concat_map(mapper, prefetch)`：把每个上游值映射为一个内层流，按到达顺序
    /// 顺次（而非并发）订阅、转发（spec §4.8「concatMap」）。`prefetch` 控制向
    /// 上游预取的元素个数上限，小于 1 时视为 1。
    pub fn concat_map<U, F>(&self, mapper: F, prefetch: i64) -> FlowStream<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(ConcatMapFlow {
            source: self.clone(),
            mapper: Arc::new(mapper),
            prefetch: prefetch.max(1),
        }))
    }
}

struct ConcatMapFlow<T, U, F> {
    source: FlowStream<T>,
    mapper: Arc<F>,
    prefetch: i64,
}

impl<T, U, F> Flow<U> for ConcatMapFlow<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<U>>) {
        let inner_arbiter = Arc::new(SubscriptionArbiter::new());
        let state = Arc::new(ConcatMapState {
            mapper: self.mapper.clone(),
            downstream: observer.clone(),
            upstream: Mutex::new(None),
            inner_arbiter: inner_arbiter.clone(),
            queue: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
            upstream_done: AtomicBool::new(false),
            prefetch: self.prefetch,
        });
        observer.on_subscribe(inner_arbiter);
        let outer_observer = Arc::new(ConcatMapOuterObserver { state });
        self.source.subscribe(outer_observer);
    }
}

struct ConcatMapState<T, U, F> {
    mapper: Arc<F>,
    downstream: Arc<dyn FlowObserver<U>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    inner_arbiter: Arc<SubscriptionArbiter>,
    queue: Mutex<VecDeque<T>>,
    active: AtomicBool,
    upstream_done: AtomicBool,
    prefetch: i64,
}

impl<T, U, F> ConcatMapState<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    /// 若当前没有正在转发的内层流，弹出队列中的下一个值并订阅其映射流；
    /// 队列为空且上游已完成时，向下游发出终止通知。
    fn try_start_next(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let next = lock(&self.queue).pop_front();
        match next {
            Some(value) => {
                let inner = (self.mapper)(value);
                let observer = Arc::new(ConcatMapInnerObserver {
                    state: self.clone(),
                });
                inner.subscribe(observer);
            }
            None => {
                self.active.store(false, Ordering::Release);
                if self.upstream_done.load(Ordering::Acquire) {
                    self.downstream.on_complete();
                }
            }
        }
    }
}

struct ConcatMapOuterObserver<T, U, F> {
    state: Arc<ConcatMapState<T, U, F>>,
}

impl<T, U, F> FlowObserver<T> for ConcatMapOuterObserver<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(self.state.prefetch);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        lock(&self.state.queue).push_back(value);
        self.state.try_start_next();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.state.upstream_done.store(true, Ordering::Release);
        if !self.state.active.load(Ordering::Acquire) && lock(&self.state.queue).is_empty() {
            self.state.downstream.on_complete();
        }
    }
}

struct ConcatMapInnerObserver<T, U, F> {
    state: Arc<ConcatMapState<T, U, F>>,
}

impl<T, U, F> FlowObserver<U> for ConcatMapInnerObserver<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.inner_arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: U) {
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.state.active.store(false, Ordering::Release);
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.request(1);
        }
        self.state.try_start_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        values: StdMutex<Vec<i64>>,
        completed: core::sync::atomic::AtomicBool,
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
    fn concat_preserves_source_order() {
        let first = just(alloc::vec![1, 2]);
        let second = just(alloc::vec![3, 4]);
        let combined = concat_streams(alloc::vec![first, second]);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: core::sync::atomic::AtomicBool::new(false),
        });
        combined.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 2, 3, 4]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn concat_map_runs_inner_streams_sequentially() {
        let source = just(alloc::vec![1, 2, 3]);
        let mapped = source.concat_map(|n| just(alloc::vec![n * 10, n * 10 + 1]), 2);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: core::sync::atomic::AtomicBool::new(false),
        });
        mapped.subscribe(observer.clone());
        assert_eq!(
            *observer.values.lock().unwrap(),
            alloc::vec![10, 11, 20, 21, 30, 31]
        );
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
