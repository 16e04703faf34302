//! `merge` / `flatMap`（spec §4.8）。
//!
//! # 设计背景（Why）
//! - 合并类操作符是并发操作符里最基础的一个：多个内层来源各自独立运行，通过一个
//!   共享缓冲区和单一漏循环（drain loop）序列化到下游，遵守"不得并发调用同一个
//!   下游观察者"的纪律（spec §4.1「delivery discipline」、§5「Mutation discipline」）。
//!   `flatMap` 只是在此之上加了一个"把上游值映射成内层流"的前端，因此与 `merge`
//!   共用同一套 [`MergeState`]。
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

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

/// `merge`/`flatMap` 共享的状态机：一个输出缓冲 + 漏循环 + 错误聚合 + 并发度闸门。
struct MergeState<U> {
    downstream: Arc<dyn FlowObserver<U>>,
    queue: Mutex<VecDeque<U>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    active_inners: AtomicUsize,
    pending_inners: Mutex<VecDeque<FlowStream<U>>>,
    max_concurrency: usize,
    outer_done: AtomicBool,
    terminated: AtomicBool,
    errors: Mutex<Vec<ReactorError>>,
    delay_error: bool,
    inner_subs: Mutex<Vec<Arc<dyn Subscription>>>,
    /// 只在 `flatMap` 前端使用：上游订阅，供发射下一个内层流时补发 `request(1)`。
    outer_upstream: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<U: Send + Sync + 'static> MergeState<U> {
    fn new(downstream: Arc<dyn FlowObserver<U>>, max_concurrency: usize, delay_error: bool) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            active_inners: AtomicUsize::new(0),
            pending_inners: Mutex::new(VecDeque::new()),
            max_concurrency: if max_concurrency == 0 { usize::MAX } else { max_concurrency },
            outer_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            delay_error,
            inner_subs: Mutex::new(Vec::new()),
            outer_upstream: Mutex::new(None),
        })
    }

    /// 追加一个待订阅的内层流；若当前在途数量未达到 `max_concurrency`，立即启动。
    fn push_inner(self: &Arc<Self>, inner: FlowStream<U>) {
        lock(&self.pending_inners).push_back(inner);
        self.try_launch();
    }

    fn try_launch(self: &Arc<Self>) {
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            if self.active_inners.load(Ordering::Acquire) >= self.max_concurrency {
                return;
            }
            let next = lock(&self.pending_inners).pop_front();
            match next {
                Some(source) => {
                    self.active_inners.fetch_add(1, Ordering::AcqRel);
                    let observer = Arc::new(MergeInnerObserver { state: self.clone() });
                    source.subscribe(observer);
                    // 为 flatMap 的预取窗口腾出一个名额。
                    if let Some(sub) = lock(&self.outer_upstream).as_ref() {
                        sub.request(1);
                    }
                }
                None => return,
            }
        }
    }

    fn register_inner(&self, sub: Arc<dyn Subscription>) {
        lock(&self.inner_subs).push(sub);
    }

    fn inner_finished(self: &Arc<Self>) {
        self.active_inners.fetch_sub(1, Ordering::AcqRel);
        self.try_launch();
        self.drain();
    }

    fn emit(self: &Arc<Self>, value: U) {
        lock(&self.queue).push_back(value);
        self.drain();
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        lock(&self.errors).push(error);
        if !self.delay_error {
            self.cancel_all_inners();
            self.outer_done.store(true, Ordering::Release);
            lock(&self.pending_inners).clear();
        }
        self.drain();
    }

    fn outer_complete(self: &Arc<Self>) {
        self.outer_done.store(true, Ordering::Release);
        self.drain();
    }

    fn cancel_all_inners(&self) {
        for sub in core::mem::take(&mut *lock(&self.inner_subs)) {
            sub.cancel();
        }
        if let Some(sub) = lock(&self.outer_upstream).as_ref() {
            sub.cancel();
        }
    }

    fn is_terminal_ready(&self) -> bool {
        lock(&self.queue).is_empty()
            && self.outer_done.load(Ordering::Acquire)
            && self.active_inners.load(Ordering::Acquire) == 0
            && lock(&self.pending_inners).is_empty()
    }

    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                lock(&self.queue).clear();
                return;
            }
            let fail_fast = !self.delay_error && !lock(&self.errors).is_empty();
            loop {
                if fail_fast || self.requested.current() <= 0 {
                    break;
                }
                let next = lock(&self.queue).pop_front();
                match next {
                    Some(value) => {
                        self.requested.produced(1);
                        self.downstream.on_next(value);
                    }
                    None => break,
                }
            }
            let should_finish = if fail_fast {
                lock(&self.queue).is_empty()
            } else {
                self.is_terminal_ready()
            };
            if should_finish && !self.terminated.swap(true, Ordering::AcqRel) {
                let errors = core::mem::take(&mut *lock(&self.errors));
                if errors.is_empty() {
                    self.downstream.on_complete();
                } else {
                    self.downstream.on_error(ReactorError::composite(errors));
                }
                return;
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn cancel(&self) {
        self.requested.cancel();
        self.terminated.store(true, Ordering::Release);
        self.cancel_all_inners();
    }
}

struct MergeSubscription<U> {
    state: Arc<MergeState<U>>,
}
impl<U: Send + Sync + 'static> Subscription for MergeSubscription<U> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.downstream.on_error(err);
            return;
        }
        self.state.requested.add(n);
        self.state.drain();
    }
    fn cancel(&self) {
        self.state.cancel();
    }
}

struct MergeInnerObserver<U> {
    state: Arc<MergeState<U>>,
}
impl<U: Send + Sync + 'static> FlowObserver<U> for MergeInnerObserver<U> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.register_inner(subscription.clone());
        subscription.request(i64::MAX);
    }
    fn on_next(&self, value: U) {
        self.state.emit(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.inner_finished();
    }
}

/// 并发订阅一组固定来源，最多 `max_concurrency` 个同时在途（`0` 表示不设上限）。
pub fn merge_streams<T>(sources: Vec<FlowStream<T>>, max_concurrency: usize, delay_error: bool) -> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    FlowStream::new(Arc::new(MergeFlow {
        sources,
        max_concurrency,
        delay_error,
    }))
}

struct MergeFlow<T> {
    sources: Vec<FlowStream<T>>,
    max_concurrency: usize,
    delay_error: bool,
}
impl<T: Send + Sync + 'static> Flow<T> for MergeFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = MergeState::new(observer, self.max_concurrency, self.delay_error);
        state
            .downstream
            .on_subscribe(Arc::new(MergeSubscription { state: state.clone() }));
        for source in &self.sources {
            state.push_inner(source.clone());
        }
        state.outer_complete();
    }
}

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `flat_map(mapper, max_concurrency, buffer_size, delay_error)`（spec §4.8）：
    /// 把每个上游值映射为内层流，最多并发订阅 `max_concurrency` 个；`buffer_size`
    /// 控制向上游预取的原始值个数上限。
    pub fn flat_map<U, F>(
        &self,
        mapper: F,
        max_concurrency: usize,
        buffer_size: i64,
        delay_error: bool,
    ) -> FlowStream<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(FlatMapFlow {
            source: self.clone(),
            mapper: Arc::new(mapper),
            max_concurrency,
            buffer_size: buffer_size.max(1),
            delay_error,
        }))
    }

    /// `merge_with(other)`：与另一个同类型流并发合并，等价于
    /// `merge_streams(vec![self, other], 0, false)`。
    pub fn merge_with(&self, other: FlowStream<T>) -> FlowStream<T> {
        merge_streams(alloc::vec![self.clone(), other], 0, false)
    }
}

struct FlatMapFlow<T, U, F> {
    source: FlowStream<T>,
    mapper: Arc<F>,
    max_concurrency: usize,
    buffer_size: i64,
    delay_error: bool,
}
impl<T, U, F> Flow<U> for FlatMapFlow<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> FlowStream<U> + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<U>>) {
        let state = MergeState::new(observer, self.max_concurrency, self.delay_error);
        state
            .downstream
            .on_subscribe(Arc::new(MergeSubscription { state: state.clone() }));
        let outer_observer = Arc::new(FlatMapOuterObserver {
            state: state.clone(),
            mapper: self.mapper.clone(),
            buffer_size: self.buffer_size,
        });
        self.source.subscribe(outer_observer);
    }
}

struct FlatMapOuterObserver<T, U, F> {
    state: Arc<MergeState<U>>,
    mapper: Arc<F>,
    buffer_size: i64,
}
impl<T, U, F> FlowObserver<T> for FlatMapOuterObserver<T, U, F>
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
        let inner = (self.mapper)(value);
        self.state.push_inner(inner);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.outer_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::{error as error_stream, just};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        values: StdMutex<Vec<i64>>,
        completed: AtomicBool,
        errored: AtomicBool,
    }
    impl FlowObserver<i64> for CollectingObserver {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&self, value: i64) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {
            self.errored.store(true, Ordering::SeqCst);
        }
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }
    fn collector() -> Arc<CollectingObserver> {
        Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
        })
    }

    #[test]
    fn merge_of_just_and_empty_preserves_the_single_value() {
        let merged = merge_streams(
            alloc::vec![just(alloc::vec![1i64]), crate::factories::empty()],
            0,
            false,
        );
        let observer = collector();
        merged.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn merge_without_delay_error_surfaces_error_and_drops_pending_inners() {
        let merged = merge_streams(
            alloc::vec![just(alloc::vec![1i64]), error_stream(ReactorError::protocol_violation(
                "test.boom",
                "boom",
            ))],
            0,
            false,
        );
        let observer = collector();
        merged.subscribe(observer.clone());
        assert!(observer.errored.load(Ordering::SeqCst));
    }

    #[test]
    fn flat_map_runs_inner_streams_concurrently() {
        let source = just(alloc::vec![1i64, 2, 3]);
        let mapped = source.flat_map(|n| just(alloc::vec![n * 10]), 0, 8, false);
        let observer = collector();
        mapped.subscribe(observer.clone());
        let mut values = observer.values.lock().unwrap().clone();
        values.sort_unstable();
        assert_eq!(values, alloc::vec![10, 20, 30]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
