//! 逐值变换类操作符（spec §11「SUPPLEMENTAL FEATURES」，契约遵循 §6.2 的统一前置条件）。
//!
//! 所有操作符都遵循同一种包装方式：构造一个把下游观察者包起来的新 [`FlowObserver`]，
//! 通过 [`FlowStream::lift`] 接到上游。因为流是冷的、可重复订阅的，`lift` 的工厂闭包
//! 本身是 `Fn`（可能被调用多次）；用户提供的变换函数因此以 `Arc<dyn Fn>` 存放，
//! 每次订阅克隆一次引用计数而非移动闭包本体。
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::arc_swap::ArcSwapSlot;
use crate::error::ReactorError;
use crate::flow::FlowStream;
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

/// 转发上游 [`Subscription`] 的 `request`/`cancel`；大多数本模块的观察者内部都
/// 持有一个这样的句柄，经由 [`ArcSwapSlot`] 懒存储上游订阅（spec §9 的
/// "back-reference" 建议：操作符持有上游订阅，包装观察者只透传）。
struct UpstreamHandle(ArcSwapSlot<dyn Subscription>);

impl UpstreamHandle {
    fn new() -> Self {
        UpstreamHandle(ArcSwapSlot::empty())
    }
    fn set(&self, subscription: Arc<dyn Subscription>) {
        self.0.store(subscription);
    }
    fn request(&self, n: i64) {
        if let Some(sub) = self.0.load_full() {
            sub.request(n);
        }
    }
    fn cancel(&self) {
        if let Some(sub) = self.0.load_full() {
            sub.cancel();
        }
    }
}

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `map(f)`：对每个值应用 `f`（spec §6.2）。
    pub fn map<U, F>(&self, f: F) -> FlowStream<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(T) -> U + Send + Sync> = Arc::new(f);
        self.lift(move |downstream: Arc<dyn FlowObserver<U>>| {
            Arc::new(MapObserver {
                downstream,
                f: f.clone(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `filter(predicate)`：丢弃不满足谓词的值；为保持背压活性，被丢弃的值会
    /// 立即向上游补发一次 `request(1)`（否则下游的需求会被无谓消耗）。
    pub fn filter<F>(&self, predicate: F) -> FlowStream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<dyn Fn(&T) -> bool + Send + Sync> = Arc::new(predicate);
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(FilterObserver {
                downstream,
                predicate: predicate.clone(),
                upstream: UpstreamHandle::new(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `scan(seed, accumulator)`：发射每一步的累计值（不单独发射 `seed` 本身）。
    pub fn scan<U, F>(&self, seed: U, accumulator: F) -> FlowStream<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(U, T) -> U + Send + Sync + 'static,
    {
        let accumulator: Arc<dyn Fn(U, T) -> U + Send + Sync> = Arc::new(accumulator);
        self.lift(move |downstream: Arc<dyn FlowObserver<U>>| {
            Arc::new(ScanObserver {
                downstream,
                state: Mutex::new(seed.clone()),
                accumulator: accumulator.clone(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `take(count)`：转发前 `count` 个值后取消上游并完成下游；`count <= 0` 立即完成。
    pub fn take(&self, count: i64) -> FlowStream<T> {
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(TakeObserver {
                downstream,
                remaining: AtomicI64::new(count),
                upstream: UpstreamHandle::new(),
                done: AtomicBool::new(count <= 0),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `take_while(predicate)`：直到谓词首次为假为止转发值，随后取消上游并完成。
    pub fn take_while<F>(&self, predicate: F) -> FlowStream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<dyn Fn(&T) -> bool + Send + Sync> = Arc::new(predicate);
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(TakeWhileObserver {
                downstream,
                predicate: predicate.clone(),
                upstream: UpstreamHandle::new(),
                done: AtomicBool::new(false),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `skip(count)`：丢弃前 `count` 个值；被丢弃的值同样补发请求额度。
    pub fn skip(&self, count: i64) -> FlowStream<T> {
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(SkipObserver {
                downstream,
                remaining: AtomicI64::new(count.max(0)),
                upstream: UpstreamHandle::new(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `skip_while(predicate)`：丢弃值直到谓词首次为假，此后全部转发。
    pub fn skip_while<F>(&self, predicate: F) -> FlowStream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<dyn Fn(&T) -> bool + Send + Sync> = Arc::new(predicate);
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(SkipWhileObserver {
                downstream,
                predicate: predicate.clone(),
                skipping: AtomicBool::new(true),
                upstream: UpstreamHandle::new(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `do_on_next`：副作用钩子，不改变通知本身。
    pub fn do_on_next<F>(&self, action: F) -> FlowStream<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let action: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(action);
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(DoOnNextObserver {
                downstream,
                action: action.clone(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `do_on_error`：副作用钩子，不改变通知本身。
    pub fn do_on_error<F>(&self, action: F) -> FlowStream<T>
    where
        F: Fn(&ReactorError) + Send + Sync + 'static,
    {
        let action: Arc<dyn Fn(&ReactorError) + Send + Sync> = Arc::new(action);
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(DoOnErrorObserver {
                downstream,
                action: action.clone(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `do_on_complete`：副作用钩子，不改变通知本身。
    pub fn do_on_complete<F>(&self, action: F) -> FlowStream<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let action: Arc<dyn Fn() + Send + Sync> = Arc::new(action);
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(DoOnCompleteObserver {
                downstream,
                action: action.clone(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `distinct_until_changed`：丢弃与紧邻前一个被转发值相等的值。
    pub fn distinct_until_changed(&self) -> FlowStream<T>
    where
        T: PartialEq + Clone,
    {
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(DistinctUntilChangedObserver {
                downstream,
                last: Mutex::new(None),
                upstream: UpstreamHandle::new(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `default_if_empty(default)`：若上游未发射任何值即完成，则改为发射 `default`
    /// 后完成。
    pub fn default_if_empty(&self, default: T) -> FlowStream<T>
    where
        T: Clone,
    {
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(DefaultIfEmptyObserver {
                downstream,
                default: default.clone(),
                seen_value: AtomicBool::new(false),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `start_with(values)`：在上游的值之前先同步发射给定的前缀值。
    pub fn start_with(&self, prefix: Vec<T>) -> FlowStream<T>
    where
        T: Clone,
    {
        crate::operators::concat_map::concat_streams(alloc::vec![
            crate::factories::from_iterable(move || prefix.clone().into_iter()),
            self.clone(),
        ])
    }

    /// `concat_with(other)`：上游完成后接着订阅 `other`。
    pub fn concat_with(&self, other: FlowStream<T>) -> FlowStream<T>
    where
        T: Clone,
    {
        crate::operators::concat_map::concat_streams(alloc::vec![self.clone(), other])
    }

    /// `ignore_elements`：丢弃所有值，只转发终止通知。
    pub fn ignore_elements(&self) -> FlowStream<T> {
        self.lift(move |downstream: Arc<dyn FlowObserver<T>>| {
            Arc::new(IgnoreElementsObserver {
                downstream,
                upstream: UpstreamHandle::new(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `count()`：转发上游元素总数（上游完成时发射一次）。
    pub fn count(&self) -> FlowStream<i64> {
        self.lift(move |downstream: Arc<dyn FlowObserver<i64>>| {
            Arc::new(CountObserver {
                downstream,
                count: AtomicI64::new(0),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `to_list()`：把整个序列收集为一个 `Vec<T>`，在上游完成时一次性发射。
    pub fn to_list(&self) -> FlowStream<Vec<T>>
    where
        T: Clone,
    {
        self.lift(move |downstream: Arc<dyn FlowObserver<Vec<T>>>| {
            Arc::new(ToListObserver {
                downstream,
                buffer: Mutex::new(Vec::new()),
            }) as Arc<dyn FlowObserver<T>>
        })
    }

    /// `reduce(seed, accumulator)`：与 `scan` 相同的累加逻辑，但只在上游完成时发射
    /// 最终值。
    pub fn reduce<U, F>(&self, seed: U, accumulator: F) -> FlowStream<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(U, T) -> U + Send + Sync + 'static,
    {
        let accumulator: Arc<dyn Fn(U, T) -> U + Send + Sync> = Arc::new(accumulator);
        self.lift(move |downstream: Arc<dyn FlowObserver<U>>| {
            Arc::new(ReduceObserver {
                downstream,
                state: Mutex::new(seed.clone()),
                accumulator: accumulator.clone(),
            }) as Arc<dyn FlowObserver<T>>
        })
    }
}

struct MapObserver<T, U> {
    downstream: Arc<dyn FlowObserver<U>>,
    f: Arc<dyn Fn(T) -> U + Send + Sync>,
}
impl<T, U> FlowObserver<T> for MapObserver<T, U> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next((self.f)(value));
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct FilterObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    upstream: UpstreamHandle,
}
impl<T> FlowObserver<T> for FilterObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        if (self.predicate)(&value) {
            self.downstream.on_next(value);
        } else {
            self.upstream.request(1);
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct ScanObserver<T, U> {
    downstream: Arc<dyn FlowObserver<U>>,
    state: Mutex<U>,
    accumulator: Arc<dyn Fn(U, T) -> U + Send + Sync>,
}
impl<T, U: Clone> FlowObserver<T> for ScanObserver<T, U> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        let mut guard = lock(&self.state);
        let next = (self.accumulator)(guard.clone(), value);
        *guard = next.clone();
        drop(guard);
        self.downstream.on_next(next);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct TakeObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    remaining: AtomicI64,
    upstream: UpstreamHandle,
    done: AtomicBool,
}
impl<T> FlowObserver<T> for TakeObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        if self.done.load(Ordering::Acquire) {
            self.downstream
                .on_subscribe(Arc::new(crate::observer::NoopSubscription));
            subscription.cancel();
            self.downstream.on_complete();
            return;
        }
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if remaining > 0 {
            self.downstream.on_next(value);
        }
        if remaining <= 1 && !self.done.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
    fn on_error(&self, error: ReactorError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }
    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct TakeWhileObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    upstream: UpstreamHandle,
    done: AtomicBool,
}
impl<T> FlowObserver<T> for TakeWhileObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if (self.predicate)(&value) {
            self.downstream.on_next(value);
        } else if !self.done.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
    fn on_error(&self, error: ReactorError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }
    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct SkipObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    remaining: AtomicI64,
    upstream: UpstreamHandle,
}
impl<T> FlowObserver<T> for SkipObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) > 0 {
            self.upstream.request(1);
        } else {
            self.downstream.on_next(value);
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct SkipWhileObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    skipping: AtomicBool,
    upstream: UpstreamHandle,
}
impl<T> FlowObserver<T> for SkipWhileObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        if self.skipping.load(Ordering::Acquire) {
            if (self.predicate)(&value) {
                self.upstream.request(1);
                return;
            }
            self.skipping.store(false, Ordering::Release);
        }
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DoOnNextObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    action: Arc<dyn Fn(&T) + Send + Sync>,
}
impl<T> FlowObserver<T> for DoOnNextObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        (self.action)(&value);
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DoOnErrorObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    action: Arc<dyn Fn(&ReactorError) + Send + Sync>,
}
impl<T> FlowObserver<T> for DoOnErrorObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        (self.action)(&error);
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DoOnCompleteObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    action: Arc<dyn Fn() + Send + Sync>,
}
impl<T> FlowObserver<T> for DoOnCompleteObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        (self.action)();
        self.downstream.on_complete();
    }
}

struct DistinctUntilChangedObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    last: Mutex<Option<T>>,
    upstream: UpstreamHandle,
}
impl<T: PartialEq + Clone> FlowObserver<T> for DistinctUntilChangedObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        let mut guard = lock(&self.last);
        if guard.as_ref() == Some(&value) {
            drop(guard);
            self.upstream.request(1);
            return;
        }
        *guard = Some(value.clone());
        drop(guard);
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DefaultIfEmptyObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    default: T,
    seen_value: AtomicBool,
}
impl<T: Clone> FlowObserver<T> for DefaultIfEmptyObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        self.seen_value.store(true, Ordering::Release);
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        if !self.seen_value.load(Ordering::Acquire) {
            self.downstream.on_next(self.default.clone());
        }
        self.downstream.on_complete();
    }
}

struct IgnoreElementsObserver<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    upstream: UpstreamHandle,
}
impl<T> FlowObserver<T> for IgnoreElementsObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription.clone());
        self.downstream.on_subscribe(subscription);
        self.upstream.request(i64::MAX);
    }
    fn on_next(&self, _value: T) {
        self.upstream.request(1);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct CountObserver<T> {
    downstream: Arc<dyn FlowObserver<i64>>,
    count: AtomicI64,
}
impl<T> FlowObserver<T> for CountObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, _value: T) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_next(self.count.load(Ordering::Acquire));
        self.downstream.on_complete();
    }
}

struct ToListObserver<T> {
    downstream: Arc<dyn FlowObserver<Vec<T>>>,
    buffer: Mutex<Vec<T>>,
}
impl<T: Clone> FlowObserver<T> for ToListObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        lock(&self.buffer).push(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        let collected = core::mem::take(&mut *lock(&self.buffer));
        self.downstream.on_next(collected);
        self.downstream.on_complete();
    }
}

struct ReduceObserver<T, U> {
    downstream: Arc<dyn FlowObserver<U>>,
    state: Mutex<U>,
    accumulator: Arc<dyn Fn(U, T) -> U + Send + Sync>,
}
impl<T, U: Clone> FlowObserver<T> for ReduceObserver<T, U> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }
    fn on_next(&self, value: T) {
        let mut guard = lock(&self.state);
        let next = (self.accumulator)(guard.clone(), value);
        *guard = next;
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_next(lock(&self.state).clone());
        self.downstream.on_complete();
    }
}
