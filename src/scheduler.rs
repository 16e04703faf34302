//! 调度器接口（spec §4.5）。
//!
//! # 设计背景（Why）
//! - 时间相关操作符（`delay`、`timeout`、`debounce`、`sample`、`interval`、`retryWhen`
//!   的退避延时等）都需要一个可替换的时间/调度抽象，而不是直接调用
//!   `std::thread::sleep`：测试需要虚拟时间来确定性地推进，生产环境需要真正的
//!   计时器或线程池。本模块的 [`Scheduler`]/[`Worker`] 对组合了教师仓库
//!   `runtime::timer::TimeDriver` 的"单调时钟 + 延时 Future"思路，并扩展出
//!   "工作者"概念以支持周期调度与可取消任务（教师仓库本身只管时间，不管任务生命周期）。
//!
//! # 契约说明（What）
//! - [`Scheduler::now`] 必须单调递增。
//! - [`Worker`] 上调度的任意任务返回一个 [`Disposable`]；`dispose` 之后任务要么
//!   根本不会运行，要么已经在运行中完成，不会有第三种状态。
//! - [`Worker::dispose`]（取消整个工作者）必须能够阻止其后的所有待调度任务执行。
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::time::Duration;

use crate::disposable::Disposable;

/// 以相对时间刻度表达的单调时钟读数。
///
/// # 设计背景（Why）
/// - `std::time::Instant` 在 `no_std` 场景不可用；本结构提供与其等价的基本能力，
///   以满足跨平台调度需求。
///
/// # 逻辑解析（How）
/// - 内部以自某个调度器自身起点以来的偏移量（`Duration`）表示，避免依赖壁钟时间；
///   不同 [`Scheduler`] 实例的读数互不可比。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonotonicTimePoint(Duration);

impl MonotonicTimePoint {
    pub fn from_offset(offset: Duration) -> Self {
        MonotonicTimePoint(offset)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn saturating_duration_since(&self, earlier: MonotonicTimePoint) -> Duration {
        self.0.checked_sub(earlier.0).unwrap_or(Duration::ZERO)
    }

    pub fn saturating_add(&self, delta: Duration) -> MonotonicTimePoint {
        MonotonicTimePoint(self.0.saturating_add(delta))
    }
}

/// 统一的计时与任务调度接口。
///
/// # 逻辑解析（How）
/// - `now`：返回单调时钟读数，供操作符计算相对截止时间。
/// - `create_worker`：创建一个顺序执行任务的工作者；多次调用得到相互独立的
///   工作者，彼此互不阻塞（镜像教师仓库"每个执行器实例独立" 的理念）。
pub trait Scheduler: Send + Sync + 'static {
    fn now(&self) -> MonotonicTimePoint;

    fn create_worker(&self) -> Box<dyn Worker>;
}

/// 在某个调度器上按序执行任务的工作者。
pub trait Worker: Send + Sync {
    /// 立即调度一次性任务。
    fn schedule(&self, task: Box<dyn FnOnce() + Send>) -> Arc<dyn Disposable>;

    /// 延时 `delay` 后调度一次性任务。
    fn schedule_delay(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> Arc<dyn Disposable>;

    /// 首次延时 `initial` 后开始，随后每隔 `period` 调度一次，直到被取消。
    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        task: Box<dyn FnMut() + Send>,
    ) -> Arc<dyn Disposable>;

    /// 取消该工作者上所有待执行（尚未开始）的任务。
    fn dispose(&self);
}

/// 在调用线程上同步执行任务的调度器。
///
/// # 设计背景（Why）
/// - 用于测试断言、`Schedulers::trampoline()` 风格的默认值，以及 `no_std` 环境下
///   没有线程可用时的退路：延时被忽略，任务立即同步运行。
#[derive(Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn now(&self) -> MonotonicTimePoint {
        MonotonicTimePoint::from_offset(Duration::from_secs(0))
    }

    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(ImmediateWorker)
    }
}

struct ImmediateWorker;

impl Worker for ImmediateWorker {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>) -> Arc<dyn Disposable> {
        task();
        Arc::new(crate::disposable::EmptyDisposable)
    }

    fn schedule_delay(
        &self,
        _delay: Duration,
        task: Box<dyn FnOnce() + Send>,
    ) -> Arc<dyn Disposable> {
        task();
        Arc::new(crate::disposable::EmptyDisposable)
    }

    fn schedule_periodic(
        &self,
        _initial: Duration,
        _period: Duration,
        mut task: Box<dyn FnMut() + Send>,
    ) -> Arc<dyn Disposable> {
        task();
        Arc::new(crate::disposable::EmptyDisposable)
    }

    fn dispose(&self) {}
}

#[cfg(feature = "std")]
pub use thread_scheduler::ThreadScheduler;

#[cfg(feature = "std")]
mod thread_scheduler {
    use super::{Disposable, MonotonicTimePoint, Scheduler, Worker};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::time::Duration;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;
    use std::time::Instant;

    /// 在工作者线程上运行任务，捕获 panic 并上报到全局不可投递错误槽，而不是让
    /// panic 悄悄杀死这个一次性线程（spec §10 要求调度器任务失败可观测）。
    fn run_catching_panics(task: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<alloc::string::String>().cloned())
                .unwrap_or_else(|| "scheduler task panicked with a non-string payload".into());
            tracing::error!(target: "reactor_core::scheduler", detail = %detail, "scheduled task panicked");
            crate::plugins::report_undeliverable(
                crate::error::ReactorError::new(
                    crate::error::codes::SCHEDULER_TASK_PANICKED,
                    crate::error::ReactorErrorKind::Source,
                    detail,
                ),
            );
        }
    }

    /// 每次调度都派生一个操作系统线程的调度器。
    ///
    /// # 风险提示（Trade-offs）
    /// - 面向正确性优先的小规模场景；高频调度（如每毫秒心跳）会产生明显的线程创建
    ///   开销，生产环境可替换为自定义的线程池 `Scheduler` 实现。
    pub struct ThreadScheduler {
        epoch: Instant,
    }

    impl Default for ThreadScheduler {
        fn default() -> Self {
            Self { epoch: Instant::now() }
        }
    }

    impl Scheduler for ThreadScheduler {
        fn now(&self) -> MonotonicTimePoint {
            MonotonicTimePoint::from_offset(self.epoch.elapsed())
        }

        fn create_worker(&self) -> Box<dyn Worker> {
            Box::new(ThreadWorker {
                disposed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    struct ThreadWorker {
        disposed: Arc<AtomicBool>,
    }

    struct JoinDisposable {
        cancelled: Arc<AtomicBool>,
    }

    impl Disposable for JoinDisposable {
        fn dispose(&self) {
            self.cancelled.store(true, Ordering::Release);
        }

        fn is_disposed(&self) -> bool {
            self.cancelled.load(Ordering::Acquire)
        }
    }

    impl Worker for ThreadWorker {
        fn schedule(&self, task: Box<dyn FnOnce() + Send>) -> Arc<dyn Disposable> {
            self.schedule_delay(Duration::from_secs(0), task)
        }

        fn schedule_delay(
            &self,
            delay: Duration,
            task: Box<dyn FnOnce() + Send>,
        ) -> Arc<dyn Disposable> {
            let worker_disposed = self.disposed.clone();
            let task_cancelled = Arc::new(AtomicBool::new(false));
            let disposable = Arc::new(JoinDisposable {
                cancelled: task_cancelled.clone(),
            });
            thread::spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if !worker_disposed.load(Ordering::Acquire) && !task_cancelled.load(Ordering::Acquire) {
                    run_catching_panics(task);
                }
            });
            disposable
        }

        fn schedule_periodic(
            &self,
            initial: Duration,
            period: Duration,
            mut task: Box<dyn FnMut() + Send>,
        ) -> Arc<dyn Disposable> {
            let worker_disposed = self.disposed.clone();
            let task_cancelled = Arc::new(AtomicBool::new(false));
            let disposable = Arc::new(JoinDisposable {
                cancelled: task_cancelled.clone(),
            });
            thread::spawn(move || {
                if !initial.is_zero() {
                    thread::sleep(initial);
                }
                loop {
                    if worker_disposed.load(Ordering::Acquire) || task_cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    run_catching_panics(|| task());
                    if period.is_zero() {
                        return;
                    }
                    thread::sleep(period);
                }
            });
            disposable
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::Release);
        }
    }
}

/// 测试专用的虚拟时间调度器。
///
/// # 设计背景（Why）
/// - 验证 `debounce`/`sample`/`timeout`/`retryWhen` 退避等依赖时间的操作符，而不受
///   真实挂钟抖动影响，也不需要测试本身挂起数百毫秒。
///
/// # 契约说明（What）
/// - 任务在 `advance_by`/`advance_to` 被调用之前不会运行；到期任务按截止时间升序、
///   同一时刻内按提交顺序执行。
#[cfg(any(test, feature = "test-util"))]
pub mod virtual_scheduler {
    use super::{Disposable, MonotonicTimePoint, Scheduler, Worker};
    use alloc::boxed::Box;
    use alloc::collections::BinaryHeap;
    use alloc::sync::Arc;
    use core::cmp::Ordering as CmpOrdering;
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::time::Duration;

    #[cfg(feature = "std")]
    use std::sync::Mutex;

    #[cfg(not(feature = "std"))]
    use spin::Mutex;

    struct ScheduledTask {
        due: Duration,
        sequence: u64,
        cancelled: Arc<AtomicBool>,
        kind: TaskKind,
    }

    enum TaskKind {
        Once(Box<dyn FnOnce() + Send>),
        Periodic {
            period: Duration,
            task: Box<dyn FnMut() + Send>,
        },
    }

    impl PartialEq for ScheduledTask {
        fn eq(&self, other: &Self) -> bool {
            self.due == other.due && self.sequence == other.sequence
        }
    }
    impl Eq for ScheduledTask {}
    impl PartialOrd for ScheduledTask {
        fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for ScheduledTask {
        fn cmp(&self, other: &Self) -> CmpOrdering {
            // `BinaryHeap` 是最大堆，取反实现按截止时间最小优先。
            other
                .due
                .cmp(&self.due)
                .then_with(|| other.sequence.cmp(&self.sequence))
        }
    }

    /// 见模块文档。
    pub struct VirtualScheduler {
        inner: Arc<Mutex<Inner>>,
    }

    struct Inner {
        now: Duration,
        sequence: u64,
        queue: BinaryHeap<ScheduledTask>,
    }

    impl Default for VirtualScheduler {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VirtualScheduler {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    now: Duration::from_secs(0),
                    sequence: 0,
                    queue: BinaryHeap::new(),
                })),
            }
        }

        fn lock(&self) -> impl core::ops::DerefMut<Target = Inner> + '_ {
            #[cfg(feature = "std")]
            {
                self.inner.lock().unwrap_or_else(|p| p.into_inner())
            }
            #[cfg(not(feature = "std"))]
            {
                self.inner.lock()
            }
        }

        pub fn current_time(&self) -> Duration {
            self.lock().now
        }

        /// 将虚拟时钟向前推进 `amount`，运行期间到期的所有任务（包括周期任务的多次
        /// 触发）。
        pub fn advance_by(&self, amount: Duration) {
            let target = self.lock().now.saturating_add(amount);
            self.advance_to(target);
        }

        /// 将虚拟时钟推进到绝对偏移 `target`，依次运行所有到期任务。
        pub fn advance_to(&self, target: Duration) {
            loop {
                let next_task = {
                    let mut guard = self.lock();
                    match guard.queue.peek() {
                        Some(task) if task.due <= target => {
                            let task = guard.queue.pop().unwrap();
                            guard.now = task.due;
                            Some(task)
                        }
                        _ => {
                            guard.now = target;
                            None
                        }
                    }
                };
                let Some(next_task) = next_task else { break };
                let ScheduledTask { cancelled, kind, .. } = next_task;
                if cancelled.load(Ordering::Acquire) {
                    continue;
                }
                match kind {
                    TaskKind::Once(f) => f(),
                    TaskKind::Periodic { period, mut task } => {
                        task();
                        if !period.is_zero() && !cancelled.load(Ordering::Acquire) {
                            let mut guard = self.lock();
                            let due = guard.now.saturating_add(period);
                            let sequence = guard.sequence;
                            guard.sequence += 1;
                            guard.queue.push(ScheduledTask {
                                due,
                                sequence,
                                cancelled,
                                kind: TaskKind::Periodic { period, task },
                            });
                        }
                    }
                }
            }
        }
    }

    impl Scheduler for VirtualScheduler {
        fn now(&self) -> MonotonicTimePoint {
            MonotonicTimePoint::from_offset(self.current_time())
        }

        fn create_worker(&self) -> Box<dyn Worker> {
            Box::new(VirtualWorker {
                inner: self.inner.clone(),
                disposed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    struct VirtualWorker {
        inner: Arc<Mutex<Inner>>,
        disposed: Arc<AtomicBool>,
    }

    struct CancelToken(Arc<AtomicBool>);
    impl Disposable for CancelToken {
        fn dispose(&self) {
            self.0.store(true, Ordering::Release);
        }
        fn is_disposed(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    impl VirtualWorker {
        fn lock(&self) -> impl core::ops::DerefMut<Target = Inner> + '_ {
            #[cfg(feature = "std")]
            {
                self.inner.lock().unwrap_or_else(|p| p.into_inner())
            }
            #[cfg(not(feature = "std"))]
            {
                self.inner.lock()
            }
        }
    }

    impl Worker for VirtualWorker {
        fn schedule(&self, task: Box<dyn FnOnce() + Send>) -> Arc<dyn Disposable> {
            self.schedule_delay(Duration::from_secs(0), task)
        }

        fn schedule_delay(
            &self,
            delay: Duration,
            task: Box<dyn FnOnce() + Send>,
        ) -> Arc<dyn Disposable> {
            let cancelled = Arc::new(AtomicBool::new(false));
            let mut guard = self.lock();
            let due = guard.now.saturating_add(delay);
            let sequence = guard.sequence;
            guard.sequence += 1;
            guard.queue.push(ScheduledTask {
                due,
                sequence,
                cancelled: cancelled.clone(),
                kind: TaskKind::Once(task),
            });
            Arc::new(CancelToken(cancelled))
        }

        fn schedule_periodic(
            &self,
            initial: Duration,
            period: Duration,
            task: Box<dyn FnMut() + Send>,
        ) -> Arc<dyn Disposable> {
            let cancelled = Arc::new(AtomicBool::new(false));
            let mut guard = self.lock();
            let due = guard.now.saturating_add(initial);
            let sequence = guard.sequence;
            guard.sequence += 1;
            guard.queue.push(ScheduledTask {
                due,
                sequence,
                cancelled: cancelled.clone(),
                kind: TaskKind::Periodic { period, task },
            });
            Arc::new(CancelToken(cancelled))
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::Release);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use alloc::sync::Arc as StdArc;
        use core::sync::atomic::AtomicUsize;

        #[test]
        fn runs_delayed_task_only_after_advance() {
            let scheduler = VirtualScheduler::new();
            let worker = scheduler.create_worker();
            let ran = StdArc::new(AtomicUsize::new(0));
            let ran_clone = ran.clone();
            worker.schedule_delay(Duration::from_millis(100), Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }));
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            scheduler.advance_by(Duration::from_millis(50));
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            scheduler.advance_by(Duration::from_millis(50));
            assert_eq!(ran.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn cancelled_task_does_not_run() {
            let scheduler = VirtualScheduler::new();
            let worker = scheduler.create_worker();
            let ran = StdArc::new(AtomicUsize::new(0));
            let ran_clone = ran.clone();
            let handle = worker.schedule_delay(Duration::from_millis(10), Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }));
            handle.dispose();
            scheduler.advance_by(Duration::from_secs(1));
            assert_eq!(ran.load(Ordering::SeqCst), 0);
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use virtual_scheduler::VirtualScheduler;
