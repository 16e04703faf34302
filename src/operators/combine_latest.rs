//! `combineLatest`（spec §4.8）：每当任一源发射新值，且两侧都至少发射过一次，
//! 就重新组合两侧最新值并发射。
//!
//! # 设计背景（Why）
//! - 与 `zip` 不同，`combineLatest` 不按位配对，而是始终持有"各源最近一次的值"；
//!   两侧源可能来自不同线程并发调用 `on_next`，因此同样需要一个输出缓冲 + 漏循环
//!   把组合值序列化地交付给下游（spec §4.1「delivery discipline」）。
//! - 源的拉取与下游需求解耦：两侧源都以 `request(i64::MAX)` 订阅（持续产生最新值），
//!   真正的背压体现在下游对组合结果缓冲区的消费速度上。
use alloc::collections::VecDeque;
use alloc::sync::Arc;
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

impl<A> FlowStream<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// `combine_latest(other, combiner)`（spec §4.8「combineLatest」）。
    pub fn combine_latest<B, R, F>(&self, other: FlowStream<B>, combiner: F) -> FlowStream<R>
    where
        B: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(A, B) -> R + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(CombineLatestFlow {
            a: self.clone(),
            b: other,
            combiner: Arc::new(combiner),
        }))
    }
}

struct CombineLatestFlow<A, B, R, F> {
    a: FlowStream<A>,
    b: FlowStream<B>,
    combiner: Arc<F>,
}

impl<A, B, R, F> Flow<R> for CombineLatestFlow<A, B, R, F>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<R>>) {
        let state = Arc::new(CombineLatestState {
            downstream: observer.clone(),
            combiner: self.combiner.clone(),
            latest_a: Mutex::new(None),
            latest_b: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            sub_a: Mutex::new(None),
            sub_b: Mutex::new(None),
            done_a: AtomicBool::new(false),
            done_b: AtomicBool::new(false),
            errors: Mutex::new(alloc::vec::Vec::new()),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(CombineLatestSubscription { state: state.clone() }));
        self.a.subscribe(Arc::new(CombineLatestSideA { state: state.clone() }));
        self.b.subscribe(Arc::new(CombineLatestSideB { state }));
    }
}

struct CombineLatestState<A, B, R, F> {
    downstream: Arc<dyn FlowObserver<R>>,
    combiner: Arc<F>,
    latest_a: Mutex<Option<A>>,
    latest_b: Mutex<Option<B>>,
    queue: Mutex<VecDeque<R>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    sub_a: Mutex<Option<Arc<dyn Subscription>>>,
    sub_b: Mutex<Option<Arc<dyn Subscription>>>,
    done_a: AtomicBool,
    done_b: AtomicBool,
    errors: Mutex<alloc::vec::Vec<ReactorError>>,
    terminated: AtomicBool,
}

impl<A, B, R, F> CombineLatestState<A, B, R, F>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn try_combine(self: &Arc<Self>) {
        let combined = {
            let a = lock(&self.latest_a).clone();
            let b = lock(&self.latest_b).clone();
            match (a, b) {
                (Some(a), Some(b)) => Some((self.combiner)(a, b)),
                _ => None,
            }
        };
        if let Some(value) = combined {
            lock(&self.queue).push_back(value);
        }
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
            loop {
                if self.requested.current() <= 0 {
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
            let unreachable = (self.done_a.load(Ordering::Acquire) && lock(&self.latest_a).is_none())
                || (self.done_b.load(Ordering::Acquire) && lock(&self.latest_b).is_none());
            let both_done = self.done_a.load(Ordering::Acquire) && self.done_b.load(Ordering::Acquire);
            let has_errors = !lock(&self.errors).is_empty();
            let finish_now = lock(&self.queue).is_empty() && (unreachable || both_done || has_errors);
            if finish_now && !self.terminated.swap(true, Ordering::AcqRel) {
                let errors = core::mem::take(&mut *lock(&self.errors));
                if let Some(sub) = lock(&self.sub_a).as_ref() {
                    sub.cancel();
                }
                if let Some(sub) = lock(&self.sub_b).as_ref() {
                    sub.cancel();
                }
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

    fn fail(self: &Arc<Self>, error: ReactorError) {
        lock(&self.errors).push(error);
        self.done_a.store(true, Ordering::Release);
        self.done_b.store(true, Ordering::Release);
        self.drain();
    }
}

struct CombineLatestSubscription<A, B, R, F> {
    state: Arc<CombineLatestState<A, B, R, F>>,
}
impl<A, B, R, F> Subscription for CombineLatestSubscription<A, B, R, F>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
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
        if let Some(sub) = lock(&self.state.sub_a).as_ref() {
            sub.cancel();
        }
        if let Some(sub) = lock(&self.state.sub_b).as_ref() {
            sub.cancel();
        }
    }
}

struct CombineLatestSideA<A, B, R, F> {
    state: Arc<CombineLatestState<A, B, R, F>>,
}
impl<A, B, R, F> FlowObserver<A> for CombineLatestSideA<A, B, R, F>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.sub_a) = Some(subscription);
    }
    fn on_next(&self, value: A) {
        *lock(&self.state.latest_a) = Some(value);
        self.state.try_combine();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.done_a.store(true, Ordering::Release);
        self.state.drain();
    }
}

struct CombineLatestSideB<A, B, R, F> {
    state: Arc<CombineLatestState<A, B, R, F>>,
}
impl<A, B, R, F> FlowObserver<B> for CombineLatestSideB<A, B, R, F>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.sub_b) = Some(subscription);
    }
    fn on_next(&self, value: B) {
        *lock(&self.state.latest_b) = Some(value);
        self.state.try_combine();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.done_b.store(true, Ordering::Release);
        self.state.drain();
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
    fn combine_latest_emits_once_both_sides_have_a_value() {
        let a = just(alloc::vec![1i64, 2]);
        let b = just(alloc::vec![10i64]);
        let combined = a.combine_latest(b, |x, y| x + y);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        combined.subscribe(observer.clone());
        assert!(observer.completed.load(Ordering::SeqCst));
        assert!(observer.values.lock().unwrap().contains(&12));
    }
}
