//! `retry` / `repeat` / `retryWhen` / `repeatWhen`（spec §4.12）。
//!
//! # 设计背景（Why）
//! - 四者都是"同一个上游来源被重新订阅若干次，中间只通过一个
//!   [`SubscriptionArbiter`] 对外表现为单一订阅"的变体，区别只在于触发重新订阅的
//!   条件（错误 vs. 完成）以及条件的来源（内建的次数+谓词 vs. 外部提供的"通知
//!   流"）。
//! - 重新订阅必须走**trampoline**而不是直接递归调用：如果上游是同步的（例如
//!   `factories::error`），每次重试都会在同一次 `subscribe` 调用栈内同步再次失败，
//!   直接递归会让调用栈随重试次数线性增长。这里复用本仓库其它操作符里反复出现的
//!   `wip`（work-in-progress）计数器漏循环写法：重入的重新订阅请求只增加计数器，
//!   由最外层的循环负责实际发起下一次订阅。
//! - `retryWhen`/`repeatWhen` 的"通知流"采用和 [`super::group_by::GroupState`]/
//!   [`super::window::WindowBucket`] 同构的"只允许订阅一次的热缓冲子流"模型：我们
//!   把每次错误（或每次完成）推入这个子流，由调用方提供的 `handler` 决定要不要、
//!   以及何时产出一个触发值。
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crate::arbiter::SubscriptionArbiter;
use crate::error::ReactorError;
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};
use crate::request::RequestCounter;

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
    /// `retry(max_retries, predicate)`（spec §4.12「retry」）：上游出错时，若
    /// `predicate(&error)` 为真且尝试次数未耗尽，重新订阅源；否则把错误转发给
    /// 下游。`max_retries < 0` 表示不限次数。
    pub fn retry<F>(&self, max_retries: i64, predicate: F) -> FlowStream<T>
    where
        F: Fn(&ReactorError) -> bool + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(RetryFlow {
            source: self.clone(),
            max_retries,
            predicate: Arc::new(predicate),
        }))
    }

    /// `repeat(max_repeats)`（spec §4.12「repeat」）：上游正常完成时重新订阅源，
    /// 直到达到 `max_repeats` 次（`< 0` 表示不限次数）；任何错误都直接转发。
    pub fn repeat(&self, max_repeats: i64) -> FlowStream<T> {
        FlowStream::new(Arc::new(RepeatFlow {
            source: self.clone(),
            max_repeats,
        }))
    }

    /// `retry_when(handler)`（spec §4.12「retryWhen」）：把每个上游错误推入一条
    /// "通知流"，交给 `handler` 决定何时（以及是否）产出一个触发值——每个触发值
    /// 都会使源被重新订阅一次；`handler` 返回的流自身完成或出错则分别转化为
    /// 整体完成或整体出错。
    pub fn retry_when<F, D>(&self, handler: F) -> FlowStream<T>
    where
        F: Fn(FlowStream<ReactorError>) -> FlowStream<D> + Send + Sync + 'static,
        D: Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(RetryWhenFlow {
            source: self.clone(),
            handler: Arc::new(handler),
        }))
    }

    /// `repeat_when(handler)`（spec §4.12「repeatWhen」）：与 [`Self::retry_when`]
    /// 对称，但通知流在每次上游**完成**（而非出错）时收到一个 `()` 事件；任何
    /// 错误都直接转发给下游，不经过 `handler`。
    pub fn repeat_when<F, D>(&self, handler: F) -> FlowStream<T>
    where
        F: Fn(FlowStream<()>) -> FlowStream<D> + Send + Sync + 'static,
        D: Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(RepeatWhenFlow {
            source: self.clone(),
            handler: Arc::new(handler),
        }))
    }
}

// ---------------------------------------------------------------------
// retry(max_retries, predicate)
// ---------------------------------------------------------------------

struct RetryFlow<T, F> {
    source: FlowStream<T>,
    max_retries: i64,
    predicate: Arc<F>,
}
impl<T, F> Flow<T> for RetryFlow<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&ReactorError) -> bool + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(RetryState {
            downstream: observer.clone(),
            source: self.source.clone(),
            predicate: self.predicate.clone(),
            remaining: AtomicI64::new(self.max_retries),
            arbiter: Arc::new(SubscriptionArbiter::new()),
            resubscribe_wip: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(RetrySubscription { state: state.clone() }));
        state.trigger_resubscribe();
    }
}

struct RetryState<T, F> {
    downstream: Arc<dyn FlowObserver<T>>,
    source: FlowStream<T>,
    predicate: Arc<F>,
    remaining: AtomicI64,
    arbiter: Arc<SubscriptionArbiter>,
    resubscribe_wip: AtomicUsize,
    terminated: AtomicBool,
}

impl<T, F> RetryState<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&ReactorError) -> bool + Send + Sync + 'static,
{
    fn trigger_resubscribe(self: &Arc<Self>) {
        if self.resubscribe_wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            let observer = Arc::new(RetryInnerObserver { state: self.clone() });
            self.source.subscribe(observer);
            if self.resubscribe_wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn terminate_with_error(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn terminate_with_complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct RetrySubscription<T, F> {
    state: Arc<RetryState<T, F>>,
}
impl<T, F> Subscription for RetrySubscription<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&ReactorError) -> bool + Send + Sync + 'static,
{
    fn request(&self, n: i64) {
        self.state.arbiter.request(n);
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.arbiter.cancel();
    }
}

struct RetryInnerObserver<T, F> {
    state: Arc<RetryState<T, F>>,
}
impl<T, F> FlowObserver<T> for RetryInnerObserver<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&ReactorError) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.arbiter.produced(1);
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        if self.state.terminated.load(Ordering::Acquire) {
            return;
        }
        let remaining = self.state.remaining.load(Ordering::Acquire);
        let allowed = (remaining < 0 || remaining > 0) && (self.state.predicate)(&error);
        if allowed {
            if remaining > 0 {
                self.state.remaining.fetch_sub(1, Ordering::AcqRel);
            }
            self.state.trigger_resubscribe();
        } else {
            self.state.terminate_with_error(error);
        }
    }
    fn on_complete(&self) {
        self.state.terminate_with_complete();
    }
}

// ---------------------------------------------------------------------
// repeat(max_repeats)
// ---------------------------------------------------------------------

struct RepeatFlow<T> {
    source: FlowStream<T>,
    max_repeats: i64,
}
impl<T: Send + Sync + 'static> Flow<T> for RepeatFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(RepeatState {
            downstream: observer.clone(),
            source: self.source.clone(),
            remaining: AtomicI64::new(self.max_repeats),
            arbiter: Arc::new(SubscriptionArbiter::new()),
            resubscribe_wip: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(RepeatSubscription { state: state.clone() }));
        state.trigger_resubscribe();
    }
}

struct RepeatState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    source: FlowStream<T>,
    remaining: AtomicI64,
    arbiter: Arc<SubscriptionArbiter>,
    resubscribe_wip: AtomicUsize,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> RepeatState<T> {
    fn trigger_resubscribe(self: &Arc<Self>) {
        if self.resubscribe_wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            let observer = Arc::new(RepeatInnerObserver { state: self.clone() });
            self.source.subscribe(observer);
            if self.resubscribe_wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn terminate_with_error(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn terminate_with_complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct RepeatSubscription<T> {
    state: Arc<RepeatState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for RepeatSubscription<T> {
    fn request(&self, n: i64) {
        self.state.arbiter.request(n);
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.arbiter.cancel();
    }
}

struct RepeatInnerObserver<T> {
    state: Arc<RepeatState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for RepeatInnerObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.arbiter.produced(1);
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        if self.state.terminated.load(Ordering::Acquire) {
            return;
        }
        let remaining = self.state.remaining.load(Ordering::Acquire);
        if remaining < 0 || remaining > 0 {
            if remaining > 0 {
                self.state.remaining.fetch_sub(1, Ordering::AcqRel);
            }
            self.state.trigger_resubscribe();
        } else {
            self.state.terminate_with_complete();
        }
    }
}

// ---------------------------------------------------------------------
// 通知流：只允许订阅一次的热缓冲子流，见模块文档。
// ---------------------------------------------------------------------

struct NotifierHub<N> {
    queue: Mutex<VecDeque<N>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    observer: Mutex<Option<Arc<dyn FlowObserver<N>>>>,
    terminated: AtomicBool,
    subscribed: AtomicBool,
}

impl<N: Send + Sync + 'static> NotifierHub<N> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            observer: Mutex::new(None),
            terminated: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        })
    }

    fn push(self: &Arc<Self>, event: N) {
        lock(&self.queue).push_back(event);
        self.drain();
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
                        Some(event) => {
                            self.requested.produced(1);
                            observer.on_next(event);
                        }
                        None => break,
                    }
                }
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

impl<N: Send + Sync + 'static> Flow<N> for NotifierHub<N> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<N>>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            let subscription = Arc::new(crate::observer::NoopSubscription);
            observer.on_subscribe(subscription.clone());
            crate::observer::reject_second_subscription(subscription.as_ref());
            return;
        }
        *lock(&self.observer) = Some(observer.clone());
        observer.on_subscribe(Arc::new(NotifierSubscription { state: self.clone() }));
        self.drain();
    }
}

struct NotifierSubscription<N> {
    state: Arc<NotifierHub<N>>,
}
impl<N: Send + Sync + 'static> Subscription for NotifierSubscription<N> {
    fn request(&self, n: i64) {
        if n > 0 {
            self.state.requested.add(n);
            self.state.drain();
        }
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        lock(&self.state.queue).clear();
    }
}

// ---------------------------------------------------------------------
// retry_when(handler)
// ---------------------------------------------------------------------

struct RetryWhenFlow<T, F> {
    source: FlowStream<T>,
    handler: Arc<F>,
}
impl<T, F, D> Flow<T> for RetryWhenFlow<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(FlowStream<ReactorError>) -> FlowStream<D> + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let notifier = NotifierHub::new();
        let trigger_flow = (self.handler)(FlowStream::new(notifier.clone() as Arc<dyn Flow<ReactorError>>));
        let state = Arc::new(RetryWhenState {
            downstream: observer.clone(),
            source: self.source.clone(),
            notifier,
            arbiter: Arc::new(SubscriptionArbiter::new()),
            resubscribe_wip: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(RetryWhenSubscription { state: state.clone() }));
        let trigger_observer = Arc::new(TriggerObserver {
            state: state.clone(),
            _marker: core::marker::PhantomData,
        });
        trigger_flow.subscribe(trigger_observer);
        state.trigger_resubscribe();
    }
}

struct RetryWhenState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    source: FlowStream<T>,
    notifier: Arc<NotifierHub<ReactorError>>,
    arbiter: Arc<SubscriptionArbiter>,
    resubscribe_wip: AtomicUsize,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> RetryWhenState<T> {
    fn trigger_resubscribe(self: &Arc<Self>) {
        if self.resubscribe_wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            let observer = Arc::new(RetryWhenInnerObserver { state: self.clone() });
            self.source.subscribe(observer);
            if self.resubscribe_wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn terminate_with_error(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn terminate_with_complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct RetryWhenSubscription<T> {
    state: Arc<RetryWhenState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for RetryWhenSubscription<T> {
    fn request(&self, n: i64) {
        self.state.arbiter.request(n);
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.arbiter.cancel();
    }
}

struct RetryWhenInnerObserver<T> {
    state: Arc<RetryWhenState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for RetryWhenInnerObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.arbiter.produced(1);
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        if !self.state.terminated.load(Ordering::Acquire) {
            self.state.notifier.push(error);
        }
    }
    fn on_complete(&self) {
        self.state.terminate_with_complete();
    }
}

struct TriggerObserver<T, D> {
    state: Arc<RetryWhenState<T>>,
    _marker: core::marker::PhantomData<fn() -> D>,
}

impl<T: Send + Sync + 'static, D: Send + Sync + 'static> FlowObserver<D> for TriggerObserver<T, D> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
    }
    fn on_next(&self, _value: D) {
        self.state.trigger_resubscribe();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        self.state.terminate_with_complete();
    }
}

// ---------------------------------------------------------------------
// repeat_when(handler)
// ---------------------------------------------------------------------

struct RepeatWhenFlow<T, F> {
    source: FlowStream<T>,
    handler: Arc<F>,
}
impl<T, F, D> Flow<T> for RepeatWhenFlow<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(FlowStream<()>) -> FlowStream<D> + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let notifier = NotifierHub::new();
        let trigger_flow = (self.handler)(FlowStream::new(notifier.clone() as Arc<dyn Flow<()>>));
        let state = Arc::new(RepeatWhenState {
            downstream: observer.clone(),
            source: self.source.clone(),
            notifier,
            arbiter: Arc::new(SubscriptionArbiter::new()),
            resubscribe_wip: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(RepeatWhenSubscription { state: state.clone() }));
        let trigger_observer = Arc::new(RepeatTriggerObserver {
            state: state.clone(),
            _marker: core::marker::PhantomData,
        });
        trigger_flow.subscribe(trigger_observer);
        state.trigger_resubscribe();
    }
}

struct RepeatWhenState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    source: FlowStream<T>,
    notifier: Arc<NotifierHub<()>>,
    arbiter: Arc<SubscriptionArbiter>,
    resubscribe_wip: AtomicUsize,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> RepeatWhenState<T> {
    fn trigger_resubscribe(self: &Arc<Self>) {
        if self.resubscribe_wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            let observer = Arc::new(RepeatWhenInnerObserver { state: self.clone() });
            self.source.subscribe(observer);
            if self.resubscribe_wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn terminate_with_error(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn terminate_with_complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct RepeatWhenSubscription<T> {
    state: Arc<RepeatWhenState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for RepeatWhenSubscription<T> {
    fn request(&self, n: i64) {
        self.state.arbiter.request(n);
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.arbiter.cancel();
    }
}

struct RepeatWhenInnerObserver<T> {
    state: Arc<RepeatWhenState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for RepeatWhenInnerObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.arbiter.set_subscription(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.arbiter.produced(1);
        self.state.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        if !self.state.terminated.load(Ordering::Acquire) {
            self.state.notifier.push(());
        }
    }
}

struct RepeatTriggerObserver<T, D> {
    state: Arc<RepeatWhenState<T>>,
    _marker: core::marker::PhantomData<fn() -> D>,
}
impl<T: Send + Sync + 'static, D: Send + Sync + 'static> FlowObserver<D> for RepeatTriggerObserver<T, D> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
    }
    fn on_next(&self, _value: D) {
        self.state.trigger_resubscribe();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.terminate_with_error(error);
    }
    fn on_complete(&self) {
        self.state.terminate_with_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::{error as error_stream, just};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicUsize};
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
    fn retry_resubscribes_until_attempts_are_exhausted_then_forwards_the_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let source = crate::factories::defer(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            error_stream::<i64>(ReactorError::protocol_violation("test.boom", "boom"))
        });
        let retried = source.retry(2, |_| true);
        let observer = collector();
        retried.subscribe(observer.clone());
        assert!(observer.errored.load(Ordering::SeqCst));
        // one original attempt + 2 retries = 3 subscriptions total.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn repeat_resubscribes_the_given_number_of_times_then_completes() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let source = crate::factories::defer(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            just(alloc::vec![1i64])
        });
        let repeated = source.repeat(2);
        let observer = collector();
        repeated.subscribe(observer.clone());
        assert!(observer.completed.load(Ordering::SeqCst));
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 1, 1]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_when_gives_up_once_the_handler_stream_completes() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let source = crate::factories::defer(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            error_stream::<i64>(ReactorError::protocol_violation("test.boom", "boom"))
        });
        let retried = source.retry_when(|errors: FlowStream<ReactorError>| {
            // 只重新订阅一次，随后让通知流完成，放弃后续重试。
            errors.take(1)
        });
        let observer = collector();
        retried.subscribe(observer.clone());
        assert!(observer.completed.load(Ordering::SeqCst));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
