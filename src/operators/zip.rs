//! `zip`（spec §4.8）：按到达顺序逐位配对两个源，直到任一源耗尽。
//!
//! # 设计背景（Why）
//! - 每个源各自拥有一个有界缓冲，只有当两侧缓冲都至少有一个待配对的值时才发射
//!   组合值；任一源完成且其缓冲已空即结束组合流（除非 `delay_error` 要求排干）。
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
    A: Send + Sync + 'static,
{
    /// `zip_with(other, combiner, buffer_size, delay_error)`（spec §4.8「zip」）。
    pub fn zip_with<B, R, F>(
        &self,
        other: FlowStream<B>,
        combiner: F,
        buffer_size: i64,
        delay_error: bool,
    ) -> FlowStream<R>
    where
        B: Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(A, B) -> R + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(ZipFlow {
            a: self.clone(),
            b: other,
            combiner: Arc::new(combiner),
            buffer_size: buffer_size.max(1),
            delay_error,
        }))
    }
}

struct ZipFlow<A, B, R, F> {
    a: FlowStream<A>,
    b: FlowStream<B>,
    combiner: Arc<F>,
    buffer_size: i64,
    delay_error: bool,
}

impl<A, B, R, F> Flow<R> for ZipFlow<A, B, R, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<R>>) {
        let state = Arc::new(ZipState {
            downstream: observer.clone(),
            combiner: self.combiner.clone(),
            queue_a: Mutex::new(VecDeque::new()),
            queue_b: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            sub_a: Mutex::new(None),
            sub_b: Mutex::new(None),
            done_a: AtomicBool::new(false),
            done_b: AtomicBool::new(false),
            errors: Mutex::new(alloc::vec::Vec::new()),
            delay_error: self.delay_error,
            terminated: AtomicBool::new(false),
            buffer_size: self.buffer_size,
        });
        observer.on_subscribe(Arc::new(ZipSubscription { state: state.clone() }));
        self.a.subscribe(Arc::new(ZipSideA { state: state.clone() }));
        self.b.subscribe(Arc::new(ZipSideB { state }));
    }
}

struct ZipState<A, B, R, F> {
    downstream: Arc<dyn FlowObserver<R>>,
    combiner: Arc<F>,
    queue_a: Mutex<VecDeque<A>>,
    queue_b: Mutex<VecDeque<B>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    sub_a: Mutex<Option<Arc<dyn Subscription>>>,
    sub_b: Mutex<Option<Arc<dyn Subscription>>>,
    done_a: AtomicBool,
    done_b: AtomicBool,
    errors: Mutex<alloc::vec::Vec<ReactorError>>,
    delay_error: bool,
    terminated: AtomicBool,
    buffer_size: i64,
}

impl<A, B, R, F> ZipState<A, B, R, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                lock(&self.queue_a).clear();
                lock(&self.queue_b).clear();
                return;
            }
            loop {
                if self.requested.current() <= 0 {
                    break;
                }
                let pair = {
                    let mut qa = lock(&self.queue_a);
                    let mut qb = lock(&self.queue_b);
                    if qa.is_empty() || qb.is_empty() {
                        None
                    } else {
                        Some((qa.pop_front().unwrap(), qb.pop_front().unwrap()))
                    }
                };
                match pair {
                    Some((a, b)) => {
                        self.requested.produced(1);
                        let combined = (self.combiner)(a, b);
                        self.downstream.on_next(combined);
                        if let Some(sub) = lock(&self.sub_a).as_ref() {
                            sub.request(1);
                        }
                        if let Some(sub) = lock(&self.sub_b).as_ref() {
                            sub.request(1);
                        }
                    }
                    None => break,
                }
            }
            let exhausted_a = self.done_a.load(Ordering::Acquire) && lock(&self.queue_a).is_empty();
            let exhausted_b = self.done_b.load(Ordering::Acquire) && lock(&self.queue_b).is_empty();
            let finish_now = if self.delay_error {
                exhausted_a && exhausted_b
            } else {
                exhausted_a || exhausted_b || !lock(&self.errors).is_empty()
            };
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
        if !self.delay_error {
            self.done_a.store(true, Ordering::Release);
            self.done_b.store(true, Ordering::Release);
        }
        self.drain();
    }
}

struct ZipSubscription<A, B, R, F> {
    state: Arc<ZipState<A, B, R, F>>,
}
impl<A, B, R, F> Subscription for ZipSubscription<A, B, R, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
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

struct ZipSideA<A, B, R, F> {
    state: Arc<ZipState<A, B, R, F>>,
}
impl<A, B, R, F> FlowObserver<A> for ZipSideA<A, B, R, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(self.state.buffer_size);
        *lock(&self.state.sub_a) = Some(subscription);
    }
    fn on_next(&self, value: A) {
        lock(&self.state.queue_a).push_back(value);
        self.state.drain();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.done_a.store(true, Ordering::Release);
        self.state.drain();
    }
}

struct ZipSideB<A, B, R, F> {
    state: Arc<ZipState<A, B, R, F>>,
}
impl<A, B, R, F> FlowObserver<B> for ZipSideB<A, B, R, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(A, B) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(self.state.buffer_size);
        *lock(&self.state.sub_b) = Some(subscription);
    }
    fn on_next(&self, value: B) {
        lock(&self.state.queue_b).push_back(value);
        self.state.drain();
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
    use crate::factories::{from_iterable, range};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        values: StdMutex<Vec<(i64, &'static str)>>,
        completed: AtomicBool,
    }
    impl FlowObserver<(i64, &'static str)> for CollectingObserver {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&self, value: (i64, &'static str)) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn zip_pairs_by_arrival_and_completes_when_shorter_source_is_drained() {
        let numbers = range(1, 3);
        let letters = from_iterable(|| ["a", "b", "c", "d"].into_iter());
        let paired = numbers.zip_with(letters, |n, s| (n, s), 8, false);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        paired.subscribe(observer.clone());
        assert_eq!(
            *observer.values.lock().unwrap(),
            alloc::vec![(1, "a"), (2, "b"), (3, "c")]
        );
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
