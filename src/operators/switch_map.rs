//! `switchMap`（spec §4.8）。
//!
//! # 设计背景（Why）
//! - 每个上游值都会产生一个新的内层流，并立刻取消前一个仍在运行的内层流；切换后
//!   旧内层流迟到的值必须被丢弃，不能到达下游（spec §4.8「switchMap」不变式）。
//!   使用一个递增的"代"（generation）标记当前有效的内层流，内层观察者在回调时
//!   核对自己的代号是否仍是最新，天然处理"取消与新订阅竞争"的窗口。
//! - 下游的 `request`/`cancel` 需要转发给"当前"内层流，而内层流会不断切换，因此
//!   复用 [`SubscriptionArbiter`]（spec §4.4）作为替换载体。
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

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

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `switch_map(mapper, buffer_size)`：`buffer_size` 控制向上游预取的原始值
    /// 个数上限（上游值到达即切换，`buffer_size` 只影响背压记账，不延迟切换）。
    pub fn switch_map<U, F>(&self, mapper: F, buffer_size: i64) -> FlowStream<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(SwitchMapFlow {
            source: self.clone(),
            mapper: Arc::new(mapper),
            buffer_size: buffer_size.max(1),
        }))
    }
}

struct SwitchMapFlow<T, U, F> {
    source: FlowStream<T>,
    mapper: Arc<F>,
    buffer_size: i64,
}

impl<T, U, F> Flow<U> for SwitchMapFlow<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<U>>) {
        let arbiter = Arc::new(SubscriptionArbiter::new());
        let state = Arc::new(SwitchMapState {
            downstream: observer.clone(),
            arbiter: arbiter.clone(),
            generation: AtomicU64::new(0),
            current_inner: Mutex::new(None),
            outer_upstream: Mutex::new(None),
            outer_done: AtomicBool::new(false),
            inner_active: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(SwitchMapSubscription { state: state.clone() }));
        let outer_observer = Arc::new(SwitchMapOuterObserver {
            state,
            mapper: self.mapper.clone(),
            buffer_size: self.buffer_size,
        });
        self.source.subscribe(outer_observer);
    }
}

struct SwitchMapState<U> {
    downstream: Arc<dyn FlowObserver<U>>,
    arbiter: Arc<SubscriptionArbiter>,
    generation: AtomicU64,
    current_inner: Mutex<Option<Arc<dyn Subscription>>>,
    outer_upstream: Mutex<Option<Arc<dyn Subscription>>>,
    outer_done: AtomicBool,
    inner_active: AtomicBool,
    terminated: AtomicBool,
}

impl<U: Send + Sync + 'static> SwitchMapState<U> {
    fn finish_ok(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
    fn finish_err(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            if let Some(sub) = lock(&self.outer_upstream).as_ref() {
                sub.cancel();
            }
            if let Some(sub) = lock(&self.current_inner).take() {
                sub.cancel();
            }
            self.downstream.on_error(error);
        }
    }
}

struct SwitchMapSubscription<U> {
    state: Arc<SwitchMapState<U>>,
}
impl<U: Send + Sync + 'static> Subscription for SwitchMapSubscription<U> {
    fn request(&self, n: i64) {
        self.state.arbiter.request(n);
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.arbiter.cancel();
        if let Some(sub) = lock(&self.state.outer_upstream).as_ref() {
            sub.cancel();
        }
    }
}

struct SwitchMapOuterObserver<T, U, F> {
    state: Arc<SwitchMapState<U>>,
    mapper: Arc<F>,
    buffer_size: i64,
}
impl<T, U, F> FlowObserver<T> for SwitchMapOuterObserver<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(self.buffer_size);
        *lock(&self.state.outer_upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(old) = lock(&self.state.current_inner).take() {
            old.cancel();
        }
        self.state.inner_active.store(true, Ordering::Release);
        let inner = (self.mapper)(value);
        let observer = Arc::new(SwitchMapInnerObserver {
            state: self.state.clone(),
            generation,
        });
        inner.subscribe(observer);
        if let Some(sub) = lock(&self.state.outer_upstream).as_ref() {
            sub.request(1);
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.state.finish_err(error);
    }
    fn on_complete(&self) {
        self.state.outer_done.store(true, Ordering::Release);
        if !self.state.inner_active.load(Ordering::Acquire) {
            self.state.finish_ok();
        }
    }
}

struct SwitchMapInnerObserver<U> {
    state: Arc<SwitchMapState<U>>,
    generation: u64,
}
impl<U: Send + Sync + 'static> SwitchMapInnerObserver<U> {
    fn is_current(&self) -> bool {
        self.state.generation.load(Ordering::Acquire) == self.generation
    }
}
impl<U: Send + Sync + 'static> FlowObserver<U> for SwitchMapInnerObserver<U> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if !self.is_current() {
            subscription.cancel();
            return;
        }
        *lock(&self.state.current_inner) = Some(subscription.clone());
        self.state.arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: U) {
        if !self.is_current() {
            return;
        }
        self.state.arbiter.produced(1);
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        if self.is_current() {
            self.state.finish_err(error);
        }
    }
    fn on_complete(&self) {
        if !self.is_current() {
            return;
        }
        self.state.inner_active.store(false, Ordering::Release);
        if self.state.outer_done.load(Ordering::Acquire) {
            self.state.finish_ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        values: StdMutex<Vec<i64>>,
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
    fn switch_map_keeps_only_the_last_inner_for_synchronous_sources() {
        // Both inner sources complete synchronously within on_next, so the second
        // switch observes the first inner already finished; this still exercises
        // the generation bookkeeping on the completion path.
        let source = just(alloc::vec![1i64, 2]);
        let switched = source.switch_map(|n| just(alloc::vec![n * 10, n * 10 + 1]), 4);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        switched.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![10, 11, 20, 21]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
