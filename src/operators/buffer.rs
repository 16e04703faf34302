//! `buffer`（spec §4.11）：把上游值攒成若干个"桶"再整批下发。
//!
//! # 设计背景（Why）
//! - `buffer(count, skip)`：按固定元素个数切桶，`skip < count` 时桶之间重叠，
//!   `skip > count` 时部分值被跳过（两者都由"同一时刻可能有多个活跃桶"这一
//!   通用模型覆盖，而不是为重叠/间隔各写一套逻辑）。
//! - `buffer(timespan, timeskip, scheduler)`：按时间而非计数切桶，开桶/关桶都通过
//!   `Worker::schedule_periodic`/`schedule_delay` 驱动，核心累积逻辑与计数版共享。
//! - `buffer(boundary)`：由一个"边界流"的每次发射触发"关闭当前桶、开一个新桶"，
//!   边界流完成则让输出流跟着完成。
//! - 三个变体都复用同一个"多活跃桶"累积器：每个桶是一个 `Mutex<Option<Vec<T>>>`，
//!   上游值到达时追加到所有仍打开的桶；桶关闭时整体出队，经由与其它操作符相同的
//!   `queue + requested + wip` 漏循环交付给下游（spec §4.1「delivery discipline」）。
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;

use crate::error::ReactorError;
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

/// 驱动一个或多个"桶"的通用累积状态：所有 `buffer_*` 变体的核心。
struct BufferAccumulator<T> {
    downstream: Arc<dyn FlowObserver<Vec<T>>>,
    open_buffers: Mutex<Vec<Vec<T>>>,
    emitted: Mutex<alloc::collections::VecDeque<Vec<T>>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    upstream_done: AtomicBool,
    terminated: AtomicBool,
    timer: Mutex<Option<Arc<dyn crate::disposable::Disposable>>>,
}

impl<T: Send + Sync + 'static> BufferAccumulator<T> {
    fn new(downstream: Arc<dyn FlowObserver<Vec<T>>>) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            open_buffers: Mutex::new(Vec::new()),
            emitted: Mutex::new(alloc::collections::VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            upstream_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    fn set_timer(&self, handle: Arc<dyn crate::disposable::Disposable>) {
        *lock(&self.timer) = Some(handle);
    }

    fn dispose_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.dispose();
        }
    }

    fn open_buffer(&self) {
        lock(&self.open_buffers).push(Vec::new());
    }

    fn push_value(&self, value: T)
    where
        T: Clone,
    {
        for buffer in lock(&self.open_buffers).iter_mut() {
            buffer.push(value.clone());
        }
    }

    /// 关闭最早打开的桶（FIFO），把内容整体排队给下游。桶为空时不跳过发射
    /// ——空桶本身也是一个合法的产出（例如没有任何值落在这个时间窗内）。
    fn close_oldest(self: &Arc<Self>) {
        let closed = {
            let mut open = lock(&self.open_buffers);
            if open.is_empty() { None } else { Some(open.remove(0)) }
        };
        if let Some(bucket) = closed {
            lock(&self.emitted).push_back(bucket);
            self.drain();
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
                    Some(bucket) => {
                        self.requested.produced(1);
                        self.downstream.on_next(bucket);
                    }
                    None => break,
                }
            }
            let finish_now = self.upstream_done.load(Ordering::Acquire) && lock(&self.emitted).is_empty();
            if finish_now && !self.terminated.swap(true, Ordering::AcqRel) {
                self.dispose_timer();
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
        lock(&self.open_buffers).clear();
        self.dispose_timer();
        if let Some(sub) = lock(&self.upstream).as_ref() {
            sub.cancel();
        }
        self.downstream.on_error(error);
    }

    fn complete_upstream(self: &Arc<Self>) {
        let remaining: Vec<Vec<T>> = core::mem::take(&mut *lock(&self.open_buffers));
        for bucket in remaining {
            lock(&self.emitted).push_back(bucket);
        }
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }
}

struct BufferSubscription<T> {
    state: Arc<BufferAccumulator<T>>,
}
impl<T: Send + Sync + 'static> Subscription for BufferSubscription<T> {
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
        self.state.dispose_timer();
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.cancel();
        }
    }
}

impl<T> FlowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `buffer(count, skip)`（spec §4.11）：每累积 `count` 个值关闭并发射最早打开
    /// 的桶；每 `skip` 个值打开一个新桶。`skip == count` 时桶互不重叠；
    /// `skip < count` 时桶重叠；`skip > count` 时部分值落在任何桶之外被丢弃。
    pub fn buffer_count(&self, count: usize, skip: usize) -> FlowStream<Vec<T>> {
        let count = count.max(1);
        let skip = skip.max(1);
        FlowStream::new(Arc::new(BufferCountFlow {
            source: self.clone(),
            count,
            skip,
        }))
    }

    /// `buffer(boundary)`（spec §4.11）：`boundary` 的每次发射关闭当前桶并立刻打开
    /// 下一个；`boundary` 完成时，当前桶（若非空）连同上游已完成一起落定。
    pub fn buffer_boundary<B>(&self, boundary: FlowStream<B>) -> FlowStream<Vec<T>>
    where
        B: Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(BufferBoundaryFlow {
            source: self.clone(),
            boundary,
        }))
    }

    /// `buffer(timespan, timeskip, scheduler)`（spec §4.11）：每隔 `timeskip` 打开一
    /// 个新桶，每个桶在打开 `timespan` 之后关闭。`timespan == timeskip` 时退化为
    /// 连续不重叠的时间窗。
    pub fn buffer_time<S>(&self, timespan: Duration, timeskip: Duration, scheduler: Arc<S>) -> FlowStream<Vec<T>>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(BufferTimeFlow {
            source: self.clone(),
            timespan,
            timeskip: if timeskip.is_zero() { timespan } else { timeskip },
            scheduler,
        }))
    }
}

struct BufferCountFlow<T> {
    source: FlowStream<T>,
    count: usize,
    skip: usize,
}
impl<T: Clone + Send + Sync + 'static> Flow<Vec<T>> for BufferCountFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<Vec<T>>>) {
        let state = BufferAccumulator::new(observer.clone());
        observer.on_subscribe(Arc::new(BufferSubscription { state: state.clone() }));
        let seen = Arc::new(AtomicUsize::new(0));
        let count = self.count;
        let skip = self.skip;
        state.open_buffer();
        let inner = Arc::new(BufferCountObserver {
            state: state.clone(),
            seen,
            count,
            skip,
        });
        self.source.subscribe(inner);
    }
}

struct BufferCountObserver<T> {
    state: Arc<BufferAccumulator<T>>,
    seen: Arc<AtomicUsize>,
    count: usize,
    skip: usize,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for BufferCountObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.push_value(value);
        let seen = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        if seen % self.skip == 0 {
            self.state.open_buffer();
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

struct BufferBoundaryFlow<T, B> {
    source: FlowStream<T>,
    boundary: FlowStream<B>,
}
impl<T, B> Flow<Vec<T>> for BufferBoundaryFlow<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<Vec<T>>>) {
        let state = BufferAccumulator::new(observer.clone());
        observer.on_subscribe(Arc::new(BufferSubscription { state: state.clone() }));
        state.open_buffer();
        let value_observer = Arc::new(BufferValueObserver { state: state.clone() });
        self.source.subscribe(value_observer);
        let boundary_observer = Arc::new(BufferBoundaryObserver { state });
        self.boundary.subscribe(boundary_observer);
    }
}

struct BufferValueObserver<T> {
    state: Arc<BufferAccumulator<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for BufferValueObserver<T> {
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

struct BufferBoundaryObserver<T> {
    state: Arc<BufferAccumulator<T>>,
}
impl<T, B> FlowObserver<B> for BufferBoundaryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
    }
    fn on_next(&self, _value: B) {
        self.state.close_oldest();
        self.state.open_buffer();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.complete_upstream();
    }
}

struct BufferTimeFlow<T, S> {
    source: FlowStream<T>,
    timespan: Duration,
    timeskip: Duration,
    scheduler: Arc<S>,
}
impl<T, S> Flow<Vec<T>> for BufferTimeFlow<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<Vec<T>>>) {
        let state = BufferAccumulator::new(observer.clone());
        observer.on_subscribe(Arc::new(BufferSubscription { state: state.clone() }));
        let worker = self.scheduler.create_worker();
        let opener_state = state.clone();
        let closer_worker_state = state.clone();
        let timespan = self.timespan;
        let timer_worker: Arc<dyn crate::scheduler::Worker> = Arc::from(worker);
        let worker_for_open = timer_worker.clone();
        let disposable = timer_worker.schedule_periodic(
            Duration::ZERO,
            self.timeskip,
            Box::new(move || {
                opener_state.open_buffer();
                let close_state = closer_worker_state.clone();
                worker_for_open.schedule_delay(
                    timespan,
                    Box::new(move || {
                        close_state.close_oldest();
                    }),
                );
            }),
        );
        state.set_timer(disposable);
        let inner = Arc::new(BufferTimeObserver { state: state.clone() });
        self.source.subscribe(inner);
    }
}

struct BufferTimeObserver<T> {
    state: Arc<BufferAccumulator<T>>,
}
impl<T: Clone + Send + Sync + 'static> FlowObserver<T> for BufferTimeObserver<T> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
    use alloc::vec::Vec as StdVec;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver {
        values: StdMutex<StdVec<StdVec<i64>>>,
        completed: AtomicBool,
    }
    impl FlowObserver<Vec<i64>> for CollectingObserver {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
        }
        fn on_next(&self, value: Vec<i64>) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn buffer_count_emits_non_overlapping_chunks() {
        let source = just(alloc::vec![1i64, 2, 3, 4, 5]);
        let buffered = source.buffer_count(2, 2);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(StdVec::new()),
            completed: AtomicBool::new(false),
        });
        buffered.subscribe(observer.clone());
        assert_eq!(
            *observer.values.lock().unwrap(),
            alloc::vec![alloc::vec![1, 2], alloc::vec![3, 4], alloc::vec![5]]
        );
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
