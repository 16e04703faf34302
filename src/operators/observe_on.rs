//! `observe_on`（spec §4.7）以及 `onBackpressureBuffer`/`Drop`/`Latest`/`Error`
//! 四个 SN→SB 背压桥接操作符（同属 spec §4.7）。
//!
//! # 设计背景（Why）
//! - `observe_on` 把"在哪个线程上调用下游观察者"这件事从"谁调用了 `on_next`"中
//!   解耦出来：上游线程只管把值塞进一个有界环形队列（[`crate::queue::BoundedSpscQueue`]，
//!   单生产者——上游按照协议串行调用——单消费者——漏循环本身）并唤醒漏循环；真正
//!   的 `downstream.on_next` 调用永远发生在 `scheduler` 分配的那个 worker 上。
//! - 漏循环本身沿用 [`super::merge::MergeState`] 的 `wip` 计数器写法：把"有新工作
//!   到达"编码成一次 `fetch_add`，只有把计数器从 0 提到 1 的调用者才真正把漏循环
//!   任务提交给 worker；`delay_error=false` 时错误抢占队列中尚未发射的值，这与
//!   `merge` 的 `fail_fast` 分支是同一个决策，只是触发条件从"多个内层流之一出错"
//!   换成了"唯一的上游出错"。
//! - `onBackpressureBuffer`/`Drop`/`Latest`/`Error` 反过来：源头是一个不受背压约束
//!   的 [`crate::signal::SignalStream`]（SN），目标是一个背压流（SB）。四者的区别
//!   只在于"下游暂时没有请求量时，新到的值该怎么办"：缓冲、丢弃、只留最新、还是
//!   直接判定协议违规。
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;

use crate::disposable::Disposable;
use crate::error::{MissingBackpressureError, ReactorError};
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, SignalObserver, Subscription};
use crate::queue::BoundedSpscQueue;
use crate::request::{RequestCounter, validate_request_amount};
use crate::scheduler::{Scheduler, Worker};
use crate::signal::{Signal, SignalStream};

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

// ---------------------------------------------------------------------
// observe_on(scheduler, delay_error, buffer_size)
// ---------------------------------------------------------------------

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `observe_on(scheduler, delay_error, buffer_size)`（spec §4.7）：把下游通知
    /// 的发射迁移到 `scheduler` 创建的一个 worker 上；`buffer_size` 既是环形队列
    /// 容量也是向上游补发需求的批大小。
    pub fn observe_on<S>(&self, scheduler: Arc<S>, delay_error: bool, buffer_size: usize) -> FlowStream<T>
    where
        S: Scheduler,
    {
        FlowStream::new(Arc::new(ObserveOnFlow {
            source: self.clone(),
            scheduler,
            delay_error,
            buffer_size: buffer_size.max(1),
        }))
    }
}

struct ObserveOnFlow<T, S> {
    source: FlowStream<T>,
    scheduler: Arc<S>,
    delay_error: bool,
    buffer_size: usize,
}

impl<T, S> Flow<T> for ObserveOnFlow<T, S>
where
    T: Send + Sync + 'static,
    S: Scheduler,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let _span = tracing::debug_span!("reactor.subscribe", operator = "observe_on", buffer_size = self.buffer_size).entered();
        let worker: Arc<dyn Worker> = Arc::from(self.scheduler.create_worker());
        let state = Arc::new(ObserveOnState {
            downstream: observer.clone(),
            queue: BoundedSpscQueue::with_capacity(self.buffer_size),
            buffer_size: self.buffer_size,
            consumed_since_refill: AtomicUsize::new(0),
            worker,
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            upstream_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pending_error: Mutex::new(None),
            delay_error: self.delay_error,
        });
        observer.on_subscribe(Arc::new(ObserveOnSubscription { state: state.clone() }));
        self.source.subscribe(Arc::new(ObserveOnUpstreamObserver { state }));
    }
}

struct ObserveOnState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    queue: BoundedSpscQueue<T>,
    buffer_size: usize,
    consumed_since_refill: AtomicUsize,
    worker: Arc<dyn Worker>,
    requested: RequestCounter,
    wip: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    upstream_done: AtomicBool,
    terminated: AtomicBool,
    pending_error: Mutex<Option<ReactorError>>,
    delay_error: bool,
}

impl<T: Send + Sync + 'static> ObserveOnState<T> {
    fn enqueue(self: &Arc<Self>, value: T) {
        if self.queue.push(value).is_err() {
            // 上游违反了"只发已授权需求量"的协议：视为致命的背压缺失。
            let error = ReactorError::missing_backpressure(MissingBackpressureError::ObserveOnQueueFull);
            tracing::warn!(
                target: "reactor_core::observe_on",
                code = error.code(),
                "backpressure overflow: upstream emitted with no queue capacity and no outstanding request"
            );
            self.fail(error);
            return;
        }
        self.schedule_drain();
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        *lock(&self.pending_error) = Some(error);
        self.upstream_done.store(true, Ordering::Release);
        if !self.delay_error {
            if let Some(sub) = lock(&self.upstream).as_ref() {
                sub.cancel();
            }
        }
        self.schedule_drain();
    }

    fn complete_upstream(self: &Arc<Self>) {
        self.upstream_done.store(true, Ordering::Release);
        self.schedule_drain();
    }

    fn schedule_drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let state = self.clone();
        self.worker.schedule(alloc::boxed::Box::new(move || state.drain_loop()));
    }

    fn drain_loop(self: &Arc<Self>) {
        loop {
            self.drain_once();
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn drain_once(self: &Arc<Self>) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let fail_fast = !self.delay_error && lock(&self.pending_error).is_some();
        if !fail_fast {
            loop {
                if self.requested.current() <= 0 {
                    break;
                }
                match self.queue.pop() {
                    Some(value) => {
                        self.requested.produced(1);
                        self.downstream.on_next(value);
                        self.maybe_refill();
                    }
                    None => break,
                }
            }
        }
        let should_finish = if fail_fast { true } else { self.queue.is_empty() && self.upstream_done.load(Ordering::Acquire) };
        if should_finish && !self.terminated.swap(true, Ordering::AcqRel) {
            match lock(&self.pending_error).take() {
                Some(error) => self.downstream.on_error(error),
                None => self.downstream.on_complete(),
            }
        }
    }

    fn maybe_refill(&self) {
        let consumed = self.consumed_since_refill.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed >= self.buffer_size {
            self.consumed_since_refill.store(0, Ordering::Release);
            if let Some(sub) = lock(&self.upstream).as_ref() {
                sub.request(self.buffer_size as i64);
            }
        }
    }

    fn cancel(&self) {
        tracing::trace!(target: "reactor_core::observe_on", "downstream cancelled observe_on subscription");
        self.requested.cancel();
        self.terminated.store(true, Ordering::Release);
        if let Some(sub) = lock(&self.upstream).as_ref() {
            sub.cancel();
        }
        self.worker.dispose();
    }
}

struct ObserveOnSubscription<T> {
    state: Arc<ObserveOnState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for ObserveOnSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.downstream.on_error(err);
            return;
        }
        self.state.requested.add(n);
        self.state.schedule_drain();
    }
    fn cancel(&self) {
        self.state.cancel();
    }
}

struct ObserveOnUpstreamObserver<T> {
    state: Arc<ObserveOnState<T>>,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for ObserveOnUpstreamObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(self.state.buffer_size as i64);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        self.state.enqueue(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.complete_upstream();
    }
}

// ---------------------------------------------------------------------
// onBackpressureBuffer/Drop/Latest/Error：SN -> SB 背压桥接
// ---------------------------------------------------------------------

impl<T> SignalStream<T>
where
    T: Send + Sync + 'static,
{
    /// `onBackpressureBuffer(capacity)`（spec §4.7）：把源头值缓存进一个队列，
    /// 等下游有需求量时再发射；`capacity` 为 `None` 表示不设上限，否则满了就
    /// 丢弃最旧的一项腾出空间。
    pub fn on_backpressure_buffer(&self, capacity: Option<usize>) -> FlowStream<T> {
        FlowStream::new(Arc::new(BackpressureBufferFlow {
            source: self.clone(),
            capacity,
        }))
    }

    /// `onBackpressureDrop`（spec §4.7）：下游需求量为零时，新到的值直接丢弃。
    pub fn on_backpressure_drop(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(BackpressureDropFlow { source: self.clone() }))
    }

    /// `onBackpressureLatest`（spec §4.7）：下游需求量为零时，只保留最近一个值，
    /// 覆盖掉此前未发射的那个。
    pub fn on_backpressure_latest(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(BackpressureLatestFlow { source: self.clone() }))
    }

    /// `onBackpressureError`（spec §4.7）：下游需求量为零时到达的值被判定为协议
    /// 违规，以 `MissingBackpressure` 终止整个流。
    pub fn on_backpressure_error(&self) -> FlowStream<T> {
        FlowStream::new(Arc::new(BackpressureErrorFlow { source: self.clone() }))
    }
}

// --- Buffer ---

struct BackpressureBufferFlow<T> {
    source: SignalStream<T>,
    capacity: Option<usize>,
}
impl<T: Send + Sync + 'static> Flow<T> for BackpressureBufferFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(BufferBridgeState {
            downstream: observer.clone(),
            queue: Mutex::new(VecDeque::new()),
            capacity: self.capacity,
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            upstream_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pending_error: Mutex::new(None),
        });
        observer.on_subscribe(Arc::new(BufferBridgeSubscription { state: state.clone() }));
        self.source.subscribe(Arc::new(BufferBridgeObserver { state }));
    }
}

struct BufferBridgeState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    queue: Mutex<VecDeque<T>>,
    capacity: Option<usize>,
    requested: RequestCounter,
    wip: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Disposable>>>,
    upstream_done: AtomicBool,
    terminated: AtomicBool,
    pending_error: Mutex<Option<ReactorError>>,
}

impl<T: Send + Sync + 'static> BufferBridgeState<T> {
    fn push_value(self: &Arc<Self>, value: T) {
        let mut queue = lock(&self.queue);
        if let Some(capacity) = self.capacity {
            if queue.len() >= capacity {
                queue.pop_front();
            }
        }
        queue.push_back(value);
        drop(queue);
        self.drain();
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        *lock(&self.pending_error) = Some(error);
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }

    fn complete_upstream(self: &Arc<Self>) {
        self.upstream_done.store(true, Ordering::Release);
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
            if lock(&self.queue).is_empty() && self.upstream_done.load(Ordering::Acquire) && !self.terminated.swap(true, Ordering::AcqRel) {
                match lock(&self.pending_error).take() {
                    Some(error) => self.downstream.on_error(error),
                    None => self.downstream.on_complete(),
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
        if let Some(disposable) = lock(&self.upstream).as_ref() {
            disposable.dispose();
        }
    }
}

struct BufferBridgeSubscription<T> {
    state: Arc<BufferBridgeState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for BufferBridgeSubscription<T> {
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

struct BufferBridgeObserver<T> {
    state: Arc<BufferBridgeState<T>>,
}
impl<T: Send + Sync + 'static> SignalObserver<T> for BufferBridgeObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        *lock(&self.state.upstream) = Some(disposable);
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

// --- Drop ---

struct BackpressureDropFlow<T> {
    source: SignalStream<T>,
}
impl<T: Send + Sync + 'static> Flow<T> for BackpressureDropFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(DropBridgeState {
            downstream: observer.clone(),
            requested: RequestCounter::new(),
            upstream: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(DropBridgeSubscription { state: state.clone() }));
        self.source.subscribe(Arc::new(DropBridgeObserver { state }));
    }
}

struct DropBridgeState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    requested: RequestCounter,
    upstream: Mutex<Option<Arc<dyn Disposable>>>,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> DropBridgeState<T> {
    fn finish_error(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }
    fn finish_complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
    fn cancel(&self) {
        self.requested.cancel();
        self.terminated.store(true, Ordering::Release);
        if let Some(disposable) = lock(&self.upstream).as_ref() {
            disposable.dispose();
        }
    }
}

struct DropBridgeSubscription<T> {
    state: Arc<DropBridgeState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for DropBridgeSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.downstream.on_error(err);
            return;
        }
        self.state.requested.add(n);
    }
    fn cancel(&self) {
        self.state.cancel();
    }
}

struct DropBridgeObserver<T> {
    state: Arc<DropBridgeState<T>>,
}
impl<T: Send + Sync + 'static> SignalObserver<T> for DropBridgeObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        *lock(&self.state.upstream) = Some(disposable);
    }
    fn on_next(&self, value: T) {
        if self.state.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.state.requested.current() > 0 {
            self.state.requested.produced(1);
            self.state.downstream.on_next(value);
        }
        // 否则：按 onBackpressureDrop 的契约直接丢弃。
    }
    fn on_error(&self, error: ReactorError) {
        self.state.finish_error(error);
    }
    fn on_complete(&self) {
        self.state.finish_complete();
    }
}

// --- Latest ---

struct BackpressureLatestFlow<T> {
    source: SignalStream<T>,
}
impl<T: Send + Sync + 'static> Flow<T> for BackpressureLatestFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(LatestBridgeState {
            downstream: observer.clone(),
            latest: Mutex::new(None),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            upstream_done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pending_error: Mutex::new(None),
        });
        observer.on_subscribe(Arc::new(LatestBridgeSubscription { state: state.clone() }));
        self.source.subscribe(Arc::new(LatestBridgeObserver { state }));
    }
}

struct LatestBridgeState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    latest: Mutex<Option<T>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Disposable>>>,
    upstream_done: AtomicBool,
    terminated: AtomicBool,
    pending_error: Mutex<Option<ReactorError>>,
}

impl<T: Send + Sync + 'static> LatestBridgeState<T> {
    fn push_value(self: &Arc<Self>, value: T) {
        *lock(&self.latest) = Some(value);
        self.drain();
    }

    fn fail(self: &Arc<Self>, error: ReactorError) {
        *lock(&self.pending_error) = Some(error);
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }

    fn complete_upstream(self: &Arc<Self>) {
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }

    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                *lock(&self.latest) = None;
                return;
            }
            if self.requested.current() > 0 {
                if let Some(value) = lock(&self.latest).take() {
                    self.requested.produced(1);
                    self.downstream.on_next(value);
                }
            }
            if lock(&self.latest).is_none() && self.upstream_done.load(Ordering::Acquire) && !self.terminated.swap(true, Ordering::AcqRel) {
                match lock(&self.pending_error).take() {
                    Some(error) => self.downstream.on_error(error),
                    None => self.downstream.on_complete(),
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
        if let Some(disposable) = lock(&self.upstream).as_ref() {
            disposable.dispose();
        }
    }
}

struct LatestBridgeSubscription<T> {
    state: Arc<LatestBridgeState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for LatestBridgeSubscription<T> {
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

struct LatestBridgeObserver<T> {
    state: Arc<LatestBridgeState<T>>,
}
impl<T: Send + Sync + 'static> SignalObserver<T> for LatestBridgeObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        *lock(&self.state.upstream) = Some(disposable);
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

// --- Error ---

struct BackpressureErrorFlow<T> {
    source: SignalStream<T>,
}
impl<T: Send + Sync + 'static> Flow<T> for BackpressureErrorFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let state = Arc::new(ErrorBridgeState {
            downstream: observer.clone(),
            requested: RequestCounter::new(),
            upstream: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(ErrorBridgeSubscription { state: state.clone() }));
        self.source.subscribe(Arc::new(ErrorBridgeObserver { state }));
    }
}

struct ErrorBridgeState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    requested: RequestCounter,
    upstream: Mutex<Option<Arc<dyn Disposable>>>,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> ErrorBridgeState<T> {
    fn finish_error(&self, error: ReactorError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }
    fn finish_complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
    fn cancel(&self) {
        self.requested.cancel();
        self.terminated.store(true, Ordering::Release);
        if let Some(disposable) = lock(&self.upstream).as_ref() {
            disposable.dispose();
        }
    }
}

struct ErrorBridgeSubscription<T> {
    state: Arc<ErrorBridgeState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for ErrorBridgeSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.requested.cancel();
            self.state.downstream.on_error(err);
            return;
        }
        self.state.requested.add(n);
    }
    fn cancel(&self) {
        self.state.cancel();
    }
}

struct ErrorBridgeObserver<T> {
    state: Arc<ErrorBridgeState<T>>,
}
impl<T: Send + Sync + 'static> SignalObserver<T> for ErrorBridgeObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        *lock(&self.state.upstream) = Some(disposable);
    }
    fn on_next(&self, value: T) {
        if self.state.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.state.requested.current() > 0 {
            self.state.requested.produced(1);
            self.state.downstream.on_next(value);
        } else {
            let error = ReactorError::missing_backpressure(MissingBackpressureError::BridgeOverflow);
            tracing::warn!(
                target: "reactor_core::on_backpressure_error",
                code = error.code(),
                "backpressure overflow: downstream demand was zero when a value arrived"
            );
            self.state.finish_error(error);
            if let Some(disposable) = lock(&self.state.upstream).as_ref() {
                disposable.dispose();
            }
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.state.finish_error(error);
    }
    fn on_complete(&self) {
        self.state.finish_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::just;
    use crate::scheduler::VirtualScheduler;
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
    fn observe_on_delivers_all_values_after_advancing_the_virtual_scheduler() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let moved = just(alloc::vec![1i64, 2, 3]).observe_on(scheduler.clone(), false, 16);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        moved.subscribe(observer.clone());
        assert!(observer.values.lock().unwrap().is_empty());
        scheduler.advance_by(Duration::from_millis(0));
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 2, 3]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }

    struct RecordingSignalObserver {
        values: StdMutex<Vec<i64>>,
    }
    impl SignalObserver<i64> for RecordingSignalObserver {
        fn on_subscribe(&self, _disposable: Arc<dyn Disposable>) {}
        fn on_next(&self, value: i64) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {}
    }

    struct PushOnSubscribeSignal;
    impl Signal<i64> for PushOnSubscribeSignal {
        fn subscribe_signal(self: Arc<Self>, observer: Arc<dyn SignalObserver<i64>>) {
            observer.on_subscribe(Arc::new(crate::disposable::EmptyDisposable));
            for value in 1..=5 {
                observer.on_next(value);
            }
            observer.on_complete();
        }
    }

    #[test]
    fn on_backpressure_drop_discards_values_beyond_outstanding_demand() {
        let source = SignalStream::new(Arc::new(PushOnSubscribeSignal) as Arc<dyn Signal<i64>>);
        let bridged = source.on_backpressure_drop();
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        struct LimitedSubscribe(Arc<CollectingObserver>);
        impl FlowObserver<i64> for LimitedSubscribe {
            fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
                subscription.request(2);
            }
            fn on_next(&self, value: i64) {
                self.0.values.lock().unwrap().push(value);
            }
            fn on_error(&self, error: ReactorError) {
                self.0.on_error(error);
            }
            fn on_complete(&self) {
                self.0.on_complete();
            }
        }
        bridged.subscribe(Arc::new(LimitedSubscribe(observer.clone())));
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 2]);
    }

    #[test]
    fn on_backpressure_buffer_replays_everything_once_demand_arrives() {
        let source = SignalStream::new(Arc::new(PushOnSubscribeSignal) as Arc<dyn Signal<i64>>);
        let bridged = source.on_backpressure_buffer(None);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        bridged.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 2, 3, 4, 5]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
