//! 流工厂（spec §6.1）。
//!
//! # 设计背景（Why）
//! - 每个工厂都产出一个"冷"（per-subscribe 独立重放）、可重复订阅的 [`FlowStream`]。
//!   大多数工厂共享同一套背压推进逻辑：把一个迭代器包装进单一订阅内的漏循环
//!   （drain loop），只在存在未消费的 `request` 额度时才调用 `on_next`，
//!   并通过一个 `wip`（work-in-progress）原子计数器防止同一观察者被并发或重入调用
//!   （spec §4.1「delivery discipline」、§5「Shared resources」）。
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use crate::error::{ReactorError, codes};
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};
use crate::request::{RequestCounter, validate_request_amount};
use crate::scheduler::Scheduler;

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

/// 一个可以反复创建全新迭代器的"冷"来源。
trait ColdSource<T>: Send + Sync {
    fn open(&self) -> Box<dyn Iterator<Item = T> + Send>;
}

impl<T, F, I> ColdSource<T> for F
where
    F: Fn() -> I + Send + Sync,
    I: Iterator<Item = T> + Send + 'static,
{
    fn open(&self) -> Box<dyn Iterator<Item = T> + Send> {
        Box::new((self)())
    }
}

struct IterableFlow<T> {
    source: Arc<dyn ColdSource<T>>,
}

impl<T: Send + Sync + 'static> Flow<T> for IterableFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let iter = self.source.open();
        let subscription = Arc::new(IterableSubscription {
            iter: Mutex::new(Some(iter)),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            observer,
        });
        let observer = subscription.observer.clone();
        observer.on_subscribe(subscription);
    }
}

struct IterableSubscription<T> {
    iter: Mutex<Option<Box<dyn Iterator<Item = T> + Send>>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    observer: Arc<dyn FlowObserver<T>>,
}

impl<T> IterableSubscription<T> {
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            loop {
                if self.requested.is_cancelled() {
                    *lock(&self.iter) = None;
                    return;
                }
                if self.requested.current() <= 0 {
                    break;
                }
                let next = {
                    let mut guard = lock(&self.iter);
                    guard.as_mut().and_then(|it| it.next())
                };
                match next {
                    Some(value) => {
                        self.observer.on_next(value);
                        self.requested.produced(1);
                    }
                    None => {
                        *lock(&self.iter) = None;
                        if !self.requested.is_cancelled() {
                            self.observer.on_complete();
                        }
                        return;
                    }
                }
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

impl<T> Subscription for IterableSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.requested.cancel();
            self.observer.on_error(err);
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        self.requested.cancel();
        *lock(&self.iter) = None;
    }
}

/// 从一个可重复调用的迭代器工厂构造冷流。
pub fn from_iterable<T, F, I>(source: F) -> FlowStream<T>
where
    T: Send + Sync + 'static,
    F: Fn() -> I + Send + Sync + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    FlowStream::new(Arc::new(IterableFlow {
        source: Arc::new(source),
    }))
}

/// 固定一组值。
pub fn just<T>(values: Vec<T>) -> FlowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    from_iterable(move || values.clone().into_iter())
}

/// `[start, start+count)` 的整数序列。
pub fn range(start: i64, count: i64) -> FlowStream<i64> {
    from_iterable(move || start..start.saturating_add(count))
}

/// 每次订阅都调用一次 `supplier`，取其返回值作为单个发射值。
pub fn from_callable<T, F>(supplier: F) -> FlowStream<T>
where
    T: Send + Sync + 'static,
    F: Fn() -> Result<T, ReactorError> + Send + Sync + 'static,
{
    defer(move || match supplier() {
        Ok(value) => single(value),
        Err(err) => error(err),
    })
}

/// 恰好发射一个值后完成；不要求 `T: Clone`（经由 [`from_iterable`] 的漏循环发射，
/// 因此仍然服从下游的请求额度；供 [`defer`] 内部在每次订阅时新建一次）。
fn single<T: Send + Sync + 'static>(value: T) -> FlowStream<T> {
    let slot = Arc::new(Mutex::new(Some(value)));
    from_iterable(move || lock(&slot).take().into_iter())
}

/// 每次订阅都重新调用 `supplier` 来获得实际的流（用于延迟构造上游）。
pub fn defer<T, F>(supplier: F) -> FlowStream<T>
where
    T: Send + Sync + 'static,
    F: Fn() -> FlowStream<T> + Send + Sync + 'static,
{
    struct DeferFlow<T> {
        supplier: Arc<dyn Fn() -> FlowStream<T> + Send + Sync>,
    }
    impl<T: 'static> Flow<T> for DeferFlow<T> {
        fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
            (self.supplier)().subscribe(observer);
        }
    }
    FlowStream::new(Arc::new(DeferFlow {
        supplier: Arc::new(supplier),
    }))
}

/// 立即以给定错误终止的流。
pub fn error<T: Send + Sync + 'static>(err: ReactorError) -> FlowStream<T> {
    struct ErrorFlow<T> {
        err: ReactorError,
        _marker: core::marker::PhantomData<fn() -> T>,
    }
    impl<T: 'static> Flow<T> for ErrorFlow<T> {
        fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
            observer.on_subscribe(Arc::new(crate::observer::NoopSubscription));
            // `ReactorError` 不是 `Clone`，每次订阅都重建一份（丢弃 cause 链）以便
            // 同一个 `error()` 流可以被多次订阅。
            let err = ReactorError::new(self.err.code(), self.err.kind(), self.err.message());
            observer.on_error(err);
        }
    }
    FlowStream::new(Arc::new(ErrorFlow {
        err,
        _marker: core::marker::PhantomData,
    }))
}

/// 不发射任何值、立即完成的流。
pub fn empty<T: Send + Sync + 'static>() -> FlowStream<T> {
    from_iterable(|| core::iter::empty())
}

/// 既不发射任何值也不终止的流（直到取消）。
pub fn never<T: Send + Sync + 'static>() -> FlowStream<T> {
    struct NeverFlow<T>(core::marker::PhantomData<fn() -> T>);
    impl<T: 'static> Flow<T> for NeverFlow<T> {
        fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
            observer.on_subscribe(Arc::new(crate::observer::NoopSubscription));
        }
    }
    FlowStream::new(Arc::new(NeverFlow(core::marker::PhantomData)))
}

/// 从 `initial_state` 出发，每次拉取都调用 `step(state) -> (next_state, Option<value>)`；
/// 返回 `None` 表示完成。
pub fn generate<S, T, F>(initial_state: S, step: F) -> FlowStream<T>
where
    S: Send + Sync + Clone + 'static,
    T: Send + Sync + 'static,
    F: Fn(S) -> (S, Option<T>) + Send + Sync + 'static,
{
    struct GenerateIter<S, T, F> {
        state: Option<S>,
        step: Arc<F>,
        _marker: core::marker::PhantomData<fn() -> T>,
    }
    impl<S, T, F> Iterator for GenerateIter<S, T, F>
    where
        F: Fn(S) -> (S, Option<T>),
    {
        type Item = T;
        fn next(&mut self) -> Option<T> {
            let state = self.state.take()?;
            let (next_state, value) = (self.step)(state);
            self.state = Some(next_state);
            value
        }
    }
    let step = Arc::new(step);
    from_iterable(move || GenerateIter {
        state: Some(initial_state.clone()),
        step: step.clone(),
        _marker: core::marker::PhantomData,
    })
}

/// `delay` 之后发射单个严格递增的 tick（从 0 开始），永不完成，除非下游取消。
pub fn timer<S>(delay: Duration, scheduler: Arc<S>) -> FlowStream<i64>
where
    S: Scheduler,
{
    struct TimerFlow<S> {
        delay: Duration,
        scheduler: Arc<S>,
    }
    impl<S: Scheduler> Flow<i64> for TimerFlow<S> {
        fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<i64>>) {
            let requested = Arc::new(RequestCounter::new());
            let worker = self.scheduler.create_worker();
            let sub = Arc::new(TimerSubscription {
                requested: requested.clone(),
                handle: Mutex::new(None),
            });
            observer.on_subscribe(sub.clone());
            let sub_for_task = sub.clone();
            let handle = worker.schedule_delay(
                self.delay,
                Box::new(move || {
                    if !sub_for_task.requested.is_cancelled() {
                        observer.on_next(0);
                        observer.on_complete();
                    }
                }),
            );
            *lock(&sub.handle) = Some(handle);
        }
    }
    struct TimerSubscription {
        requested: Arc<RequestCounter>,
        handle: Mutex<Option<Arc<dyn crate::disposable::Disposable>>>,
    }
    impl Subscription for TimerSubscription {
        fn request(&self, n: i64) {
            if n > 0 {
                self.requested.add(n);
            }
        }
        fn cancel(&self) {
            self.requested.cancel();
            if let Some(handle) = lock(&self.handle).as_ref() {
                handle.dispose();
            }
        }
    }
    FlowStream::new(Arc::new(TimerFlow { delay, scheduler }))
}

/// 每隔 `period` 发射一个严格递增的 tick（从 0 开始）；下游必须持续保有请求额度，
/// 否则在 tick 到达而需求为零时以 [`codes::BACKPRESSURE_MISSING`] 终止
/// （spec §4.7「MissingBackpressure」）。
pub fn interval<S>(period: Duration, scheduler: Arc<S>) -> FlowStream<i64>
where
    S: Scheduler,
{
    struct IntervalFlow<S> {
        period: Duration,
        scheduler: Arc<S>,
    }
    impl<S: Scheduler> Flow<i64> for IntervalFlow<S> {
        fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<i64>>) {
            let requested = Arc::new(RequestCounter::new());
            let tick = Arc::new(AtomicUsize::new(0));
            let worker = self.scheduler.create_worker();
            let sub = Arc::new(IntervalSubscription {
                requested: requested.clone(),
                handle: Mutex::new(None),
            });
            observer.on_subscribe(sub.clone());
            let sub_for_task = sub.clone();
            let handle = worker.schedule_periodic(
                self.period,
                self.period,
                Box::new(move || {
                    if sub_for_task.requested.is_cancelled() {
                        return;
                    }
                    if sub_for_task.requested.current() <= 0 {
                        sub_for_task.requested.cancel();
                        observer.on_error(ReactorError::new(
                            codes::BACKPRESSURE_MISSING,
                            crate::error::ReactorErrorKind::MissingBackpressure,
                            "interval tick arrived with no outstanding downstream request",
                        ));
                        return;
                    }
                    let value = tick.fetch_add(1, Ordering::AcqRel) as i64;
                    sub_for_task.requested.produced(1);
                    observer.on_next(value);
                }),
            );
            *lock(&sub.handle) = Some(handle);
        }
    }
    struct IntervalSubscription {
        requested: Arc<RequestCounter>,
        handle: Mutex<Option<Arc<dyn crate::disposable::Disposable>>>,
    }
    impl Subscription for IntervalSubscription {
        fn request(&self, n: i64) {
            if let Err(_err) = validate_request_amount(n) {
                self.requested.cancel();
                return;
            }
            self.requested.add(n);
        }
        fn cancel(&self) {
            self.requested.cancel();
            if let Some(handle) = lock(&self.handle).as_ref() {
                handle.dispose();
            }
        }
    }
    FlowStream::new(Arc::new(IntervalFlow { period, scheduler }))
}
