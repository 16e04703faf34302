//! `window`（spec §4.11）：与 `buffer` 同样的切分时机，但产出的是活的子流而不是
//! 攒好的 `Vec`。
//!
//! # 设计背景（Why）
//! - 切分时机（按计数、按边界流）与 [`super::buffer`] 完全一致，只是"关闭一个桶"
//!   在这里变成"完结一条子流"而不是"把攒好的 `Vec` 入队"。因此 [`WindowBucket`]
//!   直接照搬 `group_by` 里"单订阅、内部带漏循环的热子流"模型（spec §4.1「delivery
//!   discipline」同样适用于每条窗口子流自身）。
//! - 外层发射的是 `FlowStream<T>` 序列本身，其背压（`requested`）只约束"窗口开启
//!   的速率"，不约束窗口内部的值；每条窗口子流独立背压，和 `group_by` 的分组子流
//!   完全类似。
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

fn shallow_copy(error: &ReactorError) -> ReactorError {
    ReactorError::new(error.code(), error.kind(), error.message())
}

/// 单条窗口子流：只允许被订阅一次的热流，带自己的漏循环与背压。
struct WindowBucket<T> {
    queue: Mutex<VecDeque<T>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    observer: Mutex<Option<Arc<dyn FlowObserver<T>>>>,
    done: AtomicBool,
    error: Mutex<Option<ReactorError>>,
    terminated: AtomicBool,
    subscribed: AtomicBool,
}

impl<T: Send + Sync + 'static> WindowBucket<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            observer: Mutex::new(None),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        })
    }

    fn push(self: &Arc<Self>, value: T) {
        lock(&self.queue).push_back(value);
        self.drain();
    }

    fn complete(self: &Arc<Self>) {
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        *lock(&self.error) = Some(error);
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    fn cancel(self: &Arc<Self>) {
        self.terminated.store(true, Ordering::Release);
        lock(&self.queue).clear();
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
            let observer = lock(&self.observer).clone();
            if let Some(observer) = observer.as_ref() {
                loop {
                    if self.requested.current() <= 0 {
                        break;
                    }
                    let next = lock(&self.queue).pop_front();
                    match next {
                        Some(value) => {
                            self.requested.produced(1);
                            observer.on_next(value);
                        }
                        None => break,
                    }
                }
                let finish_now = self.done.load(Ordering::Acquire) && lock(&self.queue).is_empty();
                if finish_now && !self.terminated.swap(true, Ordering::AcqRel) {
                    match lock(&self.error).take() {
                        Some(error) => observer.on_error(error),
                        None => observer.on_complete(),
                    }
                    return;
                }
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

impl<T: Send + Sync + 'static> Flow<T> for WindowBucket<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            let subscription = Arc::new(crate::observer::NoopSubscription);
            observer.on_subscribe(subscription.clone());
            crate::observer::reject_second_subscription(subscription.as_ref());
            return;
        }
        *lock(&self.observer) = Some(observer.clone());
        observer.on_subscribe(Arc::new(WindowBucketSubscription { state: self.clone() }));
        self.drain();
    }
}

struct WindowBucketSubscription<T> {
    state: Arc<WindowBucket<T>>,
}
impl<T: Send + Sync + 'static> Subscription for WindowBucketSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            if let Some(observer) = lock(&self.state.observer).as_ref() {
                observer.on_error(err);
            }
            return;
        }
        self.state.requested.add(n);
        self.state.drain();
    }
    fn cancel(&self) {
        self.state.cancel();
    }
}

/// 外层状态：一个"窗口序列"的发射调度，驱动一批 [`WindowBucket`] 的开启/关闭。
struct WindowOuterState<T> {
    downstream: Arc<dyn FlowObserver<FlowStream<T>>>,
    open_windows: Mutex<Vec<Arc<WindowBucket<T>>>>,
    emitted: Mutex<VecDeque<FlowStream<T>>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    upstream_done: AtomicBool,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> WindowOuterState<T> {
    fn new(downstream: Arc<dyn FlowObserver<FlowStream<T>>>) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            open_windows: Mutex::new(Vec::new()),
            emitted: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            upstream_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    fn open_window(self: &Arc<Self>) {
        let bucket = WindowBucket::new();
        lock(&self.open_windows).push(bucket.clone());
        lock(&self.emitted).push_back(FlowStream::new(bucket as Arc<dyn Flow<T>>));
        self.drain();
    }

    fn push_value(&self, value: T)
    where
        T: Clone,
    {
        for bucket in lock(&self.open_windows).iter() {
            bucket.push(value.clone());
        }
    }

    fn close_oldest(&self) {
        let closed = {
            let mut open = lock(&self.open_windows);
            if open.is_empty() { None } else { Some(open.remove(0)) }
        };
        if let Some(bucket) = closed {
            bucket.complete();
        }
    }

    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                lock(&self.emitted).clear();
                return;
            }
            loop {
                if self.requested.current() <= 0 {
                    break;
                }
                let next = lock(&self.emitted).pop_front();
                match next {
                    Some(window) => {
                        self.requested.produced(1);
                        self.downstream.on_next(window);
                    }
                    None => break,
                }
            }
            let finish_now = self.upstream_done.load(Ordering::Acquire) && lock(&self.emitted).is_empty();
            if finish_now && !self.terminated.swap(true, Ordering::AcqRel) {
                self.downstream.on_complete();
                return;
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.emitted).clear();
        let open: Vec<Arc<WindowBucket<T>>> = core::mem::take(&mut *lock(&self.open_windows));
        for bucket in open {
            bucket.fail(shallow_copy(&error));
        }
        if let Some(sub) = lock(&self.upstream).as_ref() {
            sub.cancel();
        }
        self.downstream.on_error(error);
    }

    fn complete_upstream(self: &Arc<Self>) {
        let open: Vec<Arc<WindowBucket<T>>> = core::mem::take(&mut *lock(&self.open_windows));
        for bucket in open {
            bucket.complete();
        }
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }
}

struct WindowOuterSubscription<T> {
    state: Arc<WindowOuterState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for WindowOuterSubscription<T> {
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
        self.state.requested.cancel();
        self.state.terminated.store(true, Ordering::Release);
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.cancel();
        }
        for bucket in lock(&self.state.open_windows).iter() {
            bucket.cancel();
        }
    }
}

impl<T> FlowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `window(count, skip)`（spec §4.11）：切分时机与 [`Self::buffer_count`] 相同，
    /// 但每个桶是一个发射给下游的活子流，而不是攒好的 `Vec`。
    pub fn window_count(&self, count: usize, skip: usize) -> FlowStream<FlowStream<T>> {
        let count = count.max(1);
        let skip = skip.max(1);
        FlowStream::new(Arc::new(WindowCountFlow {
            source: self.clone(),
            count,
            skip,
        }))
    }

    /// `window(boundary)`（spec §4.11）：`boundary` 的每次发射关闭当前窗口并开启
    /// 下一个。
    pub fn window_boundary<B>(&self, boundary: FlowStream<B>) -> FlowStream<FlowStream<T>>
    where
        B: Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(WindowBoundaryFlow {
            source: self.clone(),
            boundary,
        }))
    }
}

struct WindowCountFlow<T> {
    source: FlowStream<T>,
    count: usize,
    skip: usize,
}
impl<T: Clone + Send + Sync + 'static> Flow<FlowStream<T>> for WindowCountFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<FlowStream<T>>>) {
        let state = WindowOuterState::new(observer.clone());
        observer.on_subscribe(Arc::new(WindowOuterSubscription { state: state.clone() }));
        state.open_window();
        let inner = Arc::new(WindowCountObserver {
            state: state.clone(),
            seen: AtomicUsize::new(0),
            count: self.count,
            skip: self.skip,
        });
        self.source.subscribe(inner);
    }
}

struct WindowCountObserver<T> {
    state: Arc<WindowOuterState<T>>,
    seen: AtomicUsize,
    count: usize,
    skip: usize,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for WindowCountObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.push_value(value);
        let seen = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        if seen % self.skip == 0 {
            self.state.open_window();
        }
        if seen % self.count == 0 {
            self.state.close_oldest();
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.complete_upstream();
    }
}

struct WindowBoundaryFlow<T, B> {
    source: FlowStream<T>,
    boundary: FlowStream<B>,
}
impl<T, B> Flow<FlowStream<T>> for WindowBoundaryFlow<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<FlowStream<T>>>) {
        let state = WindowOuterState::new(observer.clone());
        observer.on_subscribe(Arc::new(WindowOuterSubscription { state: state.clone() }));
        state.open_window();
        let value_observer = Arc::new(WindowValueObserver { state: state.clone() });
        self.source.subscribe(value_observer);
        let boundary_observer = Arc::new(WindowBoundaryObserver { state });
        self.boundary.subscribe(boundary_observer);
    }
}

struct WindowValueObserver<T> {
    state: Arc<WindowOuterState<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for WindowValueObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.push_value(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.complete_upstream();
    }
}

struct WindowBoundaryObserver<T> {
    state: Arc<WindowOuterState<T>>,
}
impl<T, B> FlowObserver<B> for WindowBoundaryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
    }
    fn on_next(&self, _value: B) {
        self.state.close_oldest();
        self.state.open_window();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.complete_upstream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
    use alloc::vec::Vec as StdVec;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver<T> {
        values: StdMutex<StdVec<T>>,
        completed: AtomicBool,
    }
    impl<T: Send + Sync + 'static> FlowObserver<T> for CollectingObserver<T> {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&self, value: T) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn window_count_splits_into_non_overlapping_live_substreams() {
        let source = just(alloc::vec![1i64, 2, 3, 4, 5]);
        let windows = source.window_count(2, 2);

        let outer_observer = Arc::new(CollectingObserver::<FlowStream<i64>> {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        windows.subscribe(outer_observer.clone());
        assert!(outer_observer.completed.load(Ordering::SeqCst));

        let collected_windows = outer_observer.values.lock().unwrap().clone();
        assert_eq!(collected_windows.len(), 3);

        let mut flattened = StdVec::new();
        for window in collected_windows {
            let inner_observer = Arc::new(CollectingObserver::<i64> {
                values: StdMutex::new(StdVec::new()),
                completed: AtomicBool::new(false),
            });
            window.subscribe(inner_observer.clone());
            flattened.extend(inner_observer.values.lock().unwrap().clone());
        }
        assert_eq!(flattened, alloc::vec![1, 2, 3, 4, 5]);
    }
}
