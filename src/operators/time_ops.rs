//! 时间相关操作符（spec §4.11）：`debounce`、`throttle_first`、`sample`、
//! `timeout`、`delay`。
//!
//! # 设计背景（Why）
//! - 都建立在 [`crate::scheduler::Scheduler`] 之上，沿用 `factories::timer`/
//!   `factories::interval` 的写法：`Worker::schedule_delay`/`schedule_periodic`
//!   产出一个 [`crate::disposable::Disposable`] 句柄，取消时调用其 `dispose`。
//! - `debounce`/`throttle_first`/`sample` 都是"异步产生的值"：真正调用下游
//!   `on_next` 的时机由定时器决定，而不是由下游 `request` 决定。沿用
//!   `factories::interval` 已经确立的策略——定时器触发时若下游需求为零，判定为
//!   违反背压协议并以 [`codes::BACKPRESSURE_MISSING`] 终止，而不是引入一套额外的
//!   排队机制。
//! - `delay` 需要保留上游的全部值（不允许丢弃），因此仍然走 `queue + wip` 漏循环，
//!   与 [`super::merge`] 的"待完成计数 + 延迟错误"模型同构：这里的"待完成计数"是
//!   还在飞行中的定时器数量，而不是还在运行的内层流数量。
//! - `timeout` 不对值做任何缓冲或改写，只是在每次上游发射后重新武装一个定时器；
//!   定时器先于下一个值触发时，要么切换到 `fallback`，要么以
//!   [`crate::error::ReactorErrorKind::Timeout`] 终止。请求转发通过
//!   [`crate::arbiter::SubscriptionArbiter`] 完成，与 `retry`/`switchMap` 共用同一套
//!   "替换当前上游、结转请求量"的机制。
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;

use crate::arbiter::SubscriptionArbiter;
use crate::disposable::Disposable;
use crate::error::{MissingBackpressureError, ReactorError, TimeoutError};
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};
use crate::request::{RequestCounter, validate_request_amount};
use crate::scheduler::{Scheduler, Worker};

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

fn missing_backpressure_error() -> ReactorError {
    let error = ReactorError::missing_backpressure(MissingBackpressureError::TimedEmissionOverflow);
    tracing::warn!(
        target: "reactor_core::time_ops",
        code = error.code(),
        "backpressure overflow: a timer-driven emission had no outstanding downstream request"
    );
    error
}

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `debounce(timeout, scheduler)`（spec §4.11）：每个新值重新武装一个 `timeout`
    /// 定时器；定时器到期且期间没有更新的值时发射最近一次看到的值。上游完成时，
    /// 若还有尚未到期的待发射值，在完成前同步冲刷。
    pub fn debounce<S>(&self, timeout: Duration, scheduler: Arc<S>) -> FlowStream<T>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(DebounceFlow {
            source: self.clone(),
            timeout,
            scheduler,
        }))
    }

    /// `throttle_first(duration, scheduler)`（spec §4.11）：发射一个值后，在随后
    /// `duration` 内忽略所有新值；窗口结束后下一个到达的值重新打开窗口。
    pub fn throttle_first<S>(&self, duration: Duration, scheduler: Arc<S>) -> FlowStream<T>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(ThrottleFirstFlow {
            source: self.clone(),
            duration,
            scheduler,
        }))
    }

    /// `sample(period, scheduler)`（spec §4.11）：周期性地发射自上次采样以来看到的
    /// 最新值；若周期内没有新值到达，这一拍不发射任何东西。上游完成时不冲刷尾值。
    pub fn sample<S>(&self, period: Duration, scheduler: Arc<S>) -> FlowStream<T>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(SampleFlow {
            source: self.clone(),
            period,
            scheduler,
        }))
    }

    /// `timeout(duration, scheduler, fallback)`（spec §4.11）：每次上游发射都重新
    /// 武装定时器；定时器先于下一个值触发时，切换到 `fallback`（若提供）或以
    /// `Timeout` 错误终止。
    pub fn timeout<S>(&self, duration: Duration, scheduler: Arc<S>, fallback: Option<FlowStream<T>>) -> FlowStream<T>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(TimeoutFlow {
            source: self.clone(),
            duration,
            scheduler,
            fallback,
        }))
    }

    /// `delay(duration, scheduler, delay_error)`（spec §4.11）：把每个值的发射推迟
    /// `duration`；`delay_error` 为 `true` 时错误通知也等所有已排队的值发射完毕后
    /// 才交付，否则立即终止并丢弃尚未到期的值。
    pub fn delay<S>(&self, duration: Duration, scheduler: Arc<S>, delay_error: bool) -> FlowStream<T>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(DelayFlow {
            source: self.clone(),
            duration,
            scheduler,
            delay_error,
        }))
    }
}

// ---------------------------------------------------------------------
// debounce
// ---------------------------------------------------------------------

struct DebounceFlow<T, S> {
    source: FlowStream<T>,
    timeout: Duration,
    scheduler: Arc<S>,
}
impl<T, S> Flow<T> for DebounceFlow<T, S>
where
    T: Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(DebounceState {
            downstream: observer.clone(),
            timeout: self.timeout,
            worker: self.scheduler.create_worker(),
            latest: Mutex::new(None),
            timer: Mutex::new(None),
            upstream: Mutex::new(None),
            terminated: AtomicBool::new(false),
            requested: RequestCounter::new(),
        });
        observer.on_subscribe(Arc::new(DebounceSubscription { state: state.clone() }));
        let inner = Arc::new(DebounceObserver { state });
        self.source.subscribe(inner);
    }
}

struct DebounceState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    timeout: Duration,
    worker: alloc::boxed::Box<dyn Worker>,
    latest: Mutex<Option<T>>,
    timer: Mutex<Option<Arc<dyn Disposable>>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    terminated: AtomicBool,
    requested: RequestCounter,
}

impl<T: Send + Sync + 'static> DebounceState<T> {
    fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.dispose();
        }
    }

    fn try_emit(self: &Arc<Self>, value: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() <= 0 {
            self.terminate_with_error(missing_backpressure_error());
            return;
        }
        self.requested.produced(1);
        self.downstream.on_next(value);
    }

    fn terminate_with_error(self: &Arc<Self>, error: ReactorError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_timer();
        if let Some(sub) = lock(&self.upstream).as_ref() {
            sub.cancel();
        }
        self.downstream.on_error(error);
    }

    fn rearm(self: &Arc<Self>) {
        self.cancel_timer();
        let state = self.clone();
        let handle = self.worker.schedule_delay(
            self.timeout,
            alloc::boxed::Box::new(move || {
                if let Some(value) = lock(&state.latest).take() {
                    state.try_emit(value);
                }
            }),
        );
        *lock(&self.timer) = Some(handle);
    }
}

struct DebounceSubscription<T> {
    state: Arc<DebounceState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for DebounceSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.terminate_with_error(err);
            return;
        }
        self.state.requested.add(n);
    }
    fn cancel(&self) {
        self.state.requested.cancel();
        self.state.terminated.store(true, Ordering::Release);
        self.state.cancel_timer();
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.cancel();
        }
    }
}

struct DebounceObserver<T> {
    state: Arc<DebounceState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for DebounceObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        *lock(&self.state.latest) = Some(value);
        self.state.rearm();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        self.state.cancel_timer();
        if let Some(value) = lock(&self.state.latest).take() {
            self.state.try_emit(value);
        }
        if !self.state.terminated.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

// ---------------------------------------------------------------------
// throttle_first
// ---------------------------------------------------------------------

struct ThrottleFirstFlow<T, S> {
    source: FlowStream<T>,
    duration: Duration,
    scheduler: Arc<S>,
}
impl<T, S> Flow<T> for ThrottleFirstFlow<T, S>
where
    T: Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(ThrottleFirstState {
            downstream: observer.clone(),
            duration: self.duration,
            worker: self.scheduler.create_worker(),
            gate_open: AtomicBool::new(true),
            timer: Mutex::new(None),
            upstream: Mutex::new(None),
            terminated: AtomicBool::new(false),
            requested: RequestCounter::new(),
        });
        observer.on_subscribe(Arc::new(ThrottleFirstSubscription { state: state.clone() }));
        let inner = Arc::new(ThrottleFirstObserver { state });
        self.source.subscribe(inner);
    }
}

struct ThrottleFirstState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    duration: Duration,
    worker: alloc::boxed::Box<dyn Worker>,
    gate_open: AtomicBool,
    timer: Mutex<Option<Arc<dyn Disposable>>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    terminated: AtomicBool,
    requested: RequestCounter,
}

impl<T: Send + Sync + 'static> ThrottleFirstState<T> {
    fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.dispose();
        }
    }

    fn try_emit(self: &Arc<Self>, value: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() <= 0 {
            self.terminate_with_error(missing_backpressure_error());
            return;
        }
        self.requested.produced(1);
        self.downstream.on_next(value);
    }

    fn terminate_with_error(self: &Arc<Self>, error: ReactorError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_timer();
        if let Some(sub) = lock(&self.upstream).as_ref() {
            sub.cancel();
        }
        self.downstream.on_error(error);
    }

    fn open_after_delay(self: &Arc<Self>) {
        let state = self.clone();
        let handle = self.worker.schedule_delay(
            self.duration,
            alloc::boxed::Box::new(move || {
                state.gate_open.store(true, Ordering::Release);
            }),
        );
        *lock(&self.timer) = Some(handle);
    }
}

struct ThrottleFirstSubscription<T> {
    state: Arc<ThrottleFirstState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for ThrottleFirstSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.terminate_with_error(err);
            return;
        }
        self.state.requested.add(n);
    }
    fn cancel(&self) {
        self.state.requested.cancel();
        self.state.terminated.store(true, Ordering::Release);
        self.state.cancel_timer();
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.cancel();
        }
    }
}

struct ThrottleFirstObserver<T> {
    state: Arc<ThrottleFirstState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for ThrottleFirstObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        if self.state.gate_open.swap(false, Ordering::AcqRel) {
            self.state.open_after_delay();
            self.state.try_emit(value);
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        self.state.cancel_timer();
        if !self.state.terminated.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

// ---------------------------------------------------------------------
// sample
// ---------------------------------------------------------------------

struct SampleFlow<T, S> {
    source: FlowStream<T>,
    period: Duration,
    scheduler: Arc<S>,
}
impl<T, S> Flow<T> for SampleFlow<T, S>
where
    T: Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(SampleState {
            downstream: observer.clone(),
            latest: Mutex::new(None),
            timer: Mutex::new(None),
            upstream: Mutex::new(None),
            terminated: AtomicBool::new(false),
            requested: RequestCounter::new(),
        });
        observer.on_subscribe(Arc::new(SampleSubscription { state: state.clone() }));
        let worker = self.scheduler.create_worker();
        let tick_state = state.clone();
        let handle = worker.schedule_periodic(
            self.period,
            self.period,
            alloc::boxed::Box::new(move || {
                if let Some(value) = lock(&tick_state.latest).take() {
                    tick_state.try_emit(value);
                }
            }),
        );
        *lock(&state.timer) = Some(handle);
        let inner = Arc::new(SampleObserver { state });
        self.source.subscribe(inner);
    }
}

struct SampleState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    latest: Mutex<Option<T>>,
    timer: Mutex<Option<Arc<dyn Disposable>>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    terminated: AtomicBool,
    requested: RequestCounter,
}

impl<T: Send + Sync + 'static> SampleState<T> {
    fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.dispose();
        }
    }

    fn try_emit(self: &Arc<Self>, value: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() <= 0 {
            self.terminate_with_error(missing_backpressure_error());
            return;
        }
        self.requested.produced(1);
        self.downstream.on_next(value);
    }

    fn terminate_with_error(self: &Arc<Self>, error: ReactorError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_timer();
        if let Some(sub) = lock(&self.upstream).as_ref() {
            sub.cancel();
        }
        self.downstream.on_error(error);
    }
}

struct SampleSubscription<T> {
    state: Arc<SampleState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for SampleSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.terminate_with_error(err);
            return;
        }
        self.state.requested.add(n);
    }
    fn cancel(&self) {
        self.state.requested.cancel();
        self.state.terminated.store(true, Ordering::Release);
        self.state.cancel_timer();
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.cancel();
        }
    }
}

struct SampleObserver<T> {
    state: Arc<SampleState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for SampleObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        *lock(&self.state.latest) = Some(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        self.state.cancel_timer();
        if !self.state.terminated.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

// ---------------------------------------------------------------------
// timeout
// ---------------------------------------------------------------------

struct TimeoutFlow<T, S> {
    source: FlowStream<T>,
    duration: Duration,
    scheduler: Arc<S>,
    fallback: Option<FlowStream<T>>,
}
impl<T, S> Flow<T> for TimeoutFlow<T, S>
where
    T: Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(TimeoutState {
            downstream: observer.clone(),
            duration: self.duration,
            worker: self.scheduler.create_worker(),
            arbiter: Arc::new(SubscriptionArbiter::new()),
            current_sub: Mutex::new(None),
            timer: Mutex::new(None),
            terminated: AtomicBool::new(false),
            switched: AtomicBool::new(false),
            fallback: self.fallback.clone(),
        });
        observer.on_subscribe(Arc::new(TimeoutSubscription { state: state.clone() }));
        state.rearm();
        let inner = Arc::new(TimeoutRelayObserver {
            state: state.clone(),
            is_fallback: false,
        });
        self.source.subscribe(inner);
    }
}

struct TimeoutState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    duration: Duration,
    worker: alloc::boxed::Box<dyn Worker>,
    arbiter: Arc<SubscriptionArbiter>,
    current_sub: Mutex<Option<Arc<dyn Subscription>>>,
    timer: Mutex<Option<Arc<dyn Disposable>>>,
    terminated: AtomicBool,
    switched: AtomicBool,
    fallback: Option<FlowStream<T>>,
}

impl<T: Send + Sync + 'static> TimeoutState<T> {
    fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.dispose();
        }
    }

    fn rearm(self: &Arc<Self>) {
        self.cancel_timer();
        let state = self.clone();
        let handle = self
            .worker
            .schedule_delay(self.duration, alloc::boxed::Box::new(move || state.fire_timeout()));
        *lock(&self.timer) = Some(handle);
    }

    fn fire_timeout(self: &Arc<Self>) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if let Some(sub) = lock(&self.current_sub).take() {
            sub.cancel();
        }
        let already_switched = self.switched.swap(true, Ordering::AcqRel);
        if !already_switched {
            if let Some(fallback) = self.fallback.clone() {
                tracing::debug!(target: "reactor_core::timeout", "timer elapsed, switching to fallback stream");
                let inner = Arc::new(TimeoutRelayObserver {
                    state: self.clone(),
                    is_fallback: true,
                });
                fallback.subscribe(inner);
                return;
            }
        }
        let reason = if already_switched {
            TimeoutError::FallbackTimedOut
        } else {
            TimeoutError::NoFallback
        };
        tracing::warn!(target: "reactor_core::timeout", reason = ?reason, "timed out with no fallback to recover");
        self.terminate_with_error(ReactorError::timeout(reason));
    }

    fn terminate_with_error(self: &Arc<Self>, error: ReactorError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_timer();
        self.arbiter.cancel();
        self.downstream.on_error(error);
    }

    fn terminate_with_complete(self: &Arc<Self>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_timer();
        self.downstream.on_complete();
    }
}

struct TimeoutSubscription<T> {
    state: Arc<TimeoutState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for TimeoutSubscription<T> {
    fn request(&self, n: i64) {
        self.state.arbiter.request(n);
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.cancel_timer();
        self.state.arbiter.cancel();
    }
}

struct TimeoutRelayObserver<T> {
    state: Arc<TimeoutState<T>>,
    is_fallback: bool,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for TimeoutRelayObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *lock(&self.state.current_sub) = Some(subscription.clone());
        self.state.arbiter.set_subscription(subscription);
        if self.is_fallback {
            self.state.rearm();
        }
    }
    fn on_next(&self, value: T) {
        self.state.rearm();
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        self.state.terminate_with_complete();
    }
}

// ---------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------

struct DelayFlow<T, S> {
    source: FlowStream<T>,
    duration: Duration,
    scheduler: Arc<S>,
    delay_error: bool,
}
impl<T, S> Flow<T> for DelayFlow<T, S>
where
    T: Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(DelayState {
            downstream: observer.clone(),
            duration: self.duration,
            worker: self.scheduler.create_worker(),
            queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            pending_timers: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            upstream_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            delay_error: self.delay_error,
        });
        observer.on_subscribe(Arc::new(DelaySubscription { state: state.clone() }));
        let inner = Arc::new(DelayObserver { state });
        self.source.subscribe(inner);
    }
}

struct DelayState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    duration: Duration,
    worker: alloc::boxed::Box<dyn Worker>,
    queue: Mutex<VecDeque<T>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    pending_timers: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    upstream_done: AtomicBool,
    terminated: AtomicBool,
    errors: Mutex<Vec<ReactorError>>,
    delay_error: bool,
}

impl<T: Send + Sync + 'static> DelayState<T> {
    fn schedule_value(self: &Arc<Self>, value: T) {
        self.pending_timers.fetch_add(1, Ordering::AcqRel);
        let state = self.clone();
        self.worker.schedule_delay(
            self.duration,
            alloc::boxed::Box::new(move || {
                lock(&state.queue).push_back(value);
                state.pending_timers.fetch_sub(1, Ordering::AcqRel);
                state.drain();
            }),
        );
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        lock(&self.errors).push(error);
        if !self.delay_error {
            lock(&self.queue).clear();
            self.upstream_done.store(true, Ordering::Release);
            if let Some(sub) = lock(&self.upstream).as_ref() {
                sub.cancel();
            }
        }
        self.drain();
    }

    fn complete_upstream(self: &Arc<Self>) {
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }

    fn is_terminal_ready(&self) -> bool {
        self.upstream_done.load(Ordering::Acquire)
            && self.pending_timers.load(Ordering::Acquire) == 0
            && lock(&self.queue).is_empty()
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
}

struct DelaySubscription<T> {
    state: Arc<DelayState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for DelaySubscription<T> {
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
    }
}

struct DelayObserver<T> {
    state: Arc<DelayState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for DelayObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.schedule_value(value);
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
    use crate::scheduler::VirtualScheduler;
    use alloc::vec::Vec as StdVec;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver<T> {
        values: StdMutex<StdVec<T>>,
        completed: AtomicBool,
        errored: AtomicBool,
    }
    impl<T: Send + Sync + 'static> FlowObserver<T> for CollectingObserver<T> {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&self, value: T) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {
            self.errored.store(true, Ordering::SeqCst);
        }
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }
    fn collector<T: Send + Sync + 'static>() -> Arc<CollectingObserver<T>> {
        Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
        })
    }

    #[test]
    fn delay_preserves_order_and_completes_after_the_last_value_fires() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let delayed = just(alloc::vec![1i64, 2, 3]).delay(Duration::from_millis(50), scheduler.clone(), false);
        let observer = collector::<i64>();
        delayed.subscribe(observer.clone());
        assert!(observer.values.lock().unwrap().is_empty());
        scheduler.advance_by(Duration::from_millis(50));
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 2, 3]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn timeout_switches_to_fallback_when_no_value_arrives_in_time() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let never_source = crate::factories::never::<i64>();
        let fallback = just(alloc::vec![42i64]);
        let with_timeout = never_source.timeout(Duration::from_millis(100), scheduler.clone(), Some(fallback));
        let observer = collector::<i64>();
        with_timeout.subscribe(observer.clone());
        scheduler.advance_by(Duration::from_millis(100));
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![42]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn timeout_without_fallback_signals_an_error() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let never_source = crate::factories::never::<i64>();
        let with_timeout = never_source.timeout(Duration::from_millis(100), scheduler.clone(), None);
        let observer = collector::<i64>();
        with_timeout.subscribe(observer.clone());
        scheduler.advance_by(Duration::from_millis(100));
        assert!(observer.errored.load(Ordering::SeqCst));
    }
}
