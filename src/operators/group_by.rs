//! `groupBy`（spec §4.8、§3「多播」相邻语义）：按 key 把源流拆分成多条子流。
//!
//! # 设计背景（Why）
//! - 外层流向下游发射的是 `(key, 子流)` 配对，子流本身又是一个完整的 `FlowStream`，
//!   可以被下游各自独立订阅、独立背压；这与教师仓库里路由表按 key 分派到独立
//!   `Channel` 的思路一致，只是这里分派的是"一条流"而非"一条消息"。
//! - key 的集合在运行前未知，所以用 `BTreeMap<K, _>` 保存分组状态（`K: Ord` 而非
//!   `Hash`，以便在 `no_std + alloc` 下沿用同一份实现，不必在 std/no_std 之间切换
//!   哈希表类型）。
//! - 为了让整个拆分保持简单可推理，上游以无限需求（`i64::MAX`）被拉取——按 key
//!   分流之后，真正的背压体现在每条子流各自的需求计数上；子流各自维护一个无界
//!   缓冲区，直到下游订阅并开始消费。
use alloc::collections::{BTreeMap, VecDeque};
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

/// `ReactorError` 不可 `Clone`（因果链是类型擦除的 trait object）；向多个分组
/// 广播同一个源错误时，退化为只保留码/分类/消息的浅拷贝。
fn shallow_copy(error: &ReactorError) -> ReactorError {
    ReactorError::new(error.code(), error.kind(), error.message())
}

/// 一个分组：`key` 加上这个分组自己的（可重复订阅一次）子流。
pub struct Grouped<K, T> {
    pub key: K,
    pub stream: FlowStream<T>,
}

impl<T> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    /// `group_by(key_selector)`（spec §4.8「groupBy」）。
    pub fn group_by<K, F>(&self, key_selector: F) -> FlowStream<Grouped<K, T>>
    where
        K: Ord + Clone + Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(GroupByFlow {
            source: self.clone(),
            key_selector: Arc::new(key_selector),
        }))
    }
}

struct GroupByFlow<T, K, F> {
    source: FlowStream<T>,
    key_selector: Arc<F>,
}

impl<T, K, F> Flow<Grouped<K, T>> for GroupByFlow<T, K, F>
where
    T: Send + Sync + 'static,
    K: Ord + Clone + Send + Sync + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<Grouped<K, T>>>) {
        let state = Arc::new(GroupByState {
            downstream: observer.clone(),
            groups: Mutex::new(BTreeMap::new()),
            new_group_queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            upstream: Mutex::new(None),
            done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(GroupBySubscription { state: state.clone() }));
        let outer = Arc::new(GroupByOuterObserver {
            state,
            key_selector: self.key_selector.clone(),
        });
        self.source.subscribe(outer);
    }
}

struct GroupByState<K, T> {
    downstream: Arc<dyn FlowObserver<Grouped<K, T>>>,
    groups: Mutex<BTreeMap<K, Arc<GroupState<T>>>>,
    new_group_queue: Mutex<VecDeque<Grouped<K, T>>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    done: AtomicBool,
    terminated: AtomicBool,
}

impl<K, T> GroupByState<K, T>
where
    K: Ord + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if self.terminated.load(Ordering::Acquire) {
                lock(&self.new_group_queue).clear();
                return;
            }
            loop {
                if self.requested.current() <= 0 {
                    break;
                }
                let next = lock(&self.new_group_queue).pop_front();
                match next {
                    Some(group) => {
                        self.requested.produced(1);
                        self.downstream.on_next(group);
                    }
                    None => break,
                }
            }
            let finish_now = self.done.load(Ordering::Acquire) && lock(&self.new_group_queue).is_empty();
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
        lock(&self.new_group_queue).clear();
        for group in lock(&self.groups).values() {
            group.fail(shallow_copy(&error));
        }
        self.downstream.on_error(error);
    }
}

struct GroupBySubscription<K, T> {
    state: Arc<GroupByState<K, T>>,
}
impl<K, T> Subscription for GroupBySubscription<K, T>
where
    K: Ord + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
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
        if let Some(sub) = lock(&self.state.upstream).as_ref() {
            sub.cancel();
        }
        for group in lock(&self.state.groups).values() {
            group.cancel();
        }
    }
}

struct GroupByOuterObserver<T, K, F> {
    state: Arc<GroupByState<K, T>>,
    key_selector: Arc<F>,
}
impl<T, K, F> FlowObserver<T> for GroupByOuterObserver<T, K, F>
where
    T: Send + Sync + 'static,
    K: Ord + Clone + Send + Sync + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
        *lock(&self.state.upstream) = Some(subscription);
    }
    fn on_next(&self, value: T) {
        let key = (self.key_selector)(&value);
        let is_new = !lock(&self.state.groups).contains_key(&key);
        let group = lock(&self.state.groups)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(GroupState::new()))
            .clone();
        if is_new {
            // A cancelled group is removed from the map so that a later value for the
            // same key opens a fresh group rather than reusing a dead one (spec §4.8:
            // "the group is removed and subsequent values for that key create a new
            // group"). The closure holds only a weak back-reference to avoid a
            // GroupByState <-> GroupState reference cycle.
            let parent = Arc::downgrade(&self.state);
            let cancelled_key = key.clone();
            group.set_on_cancel(Arc::new(move || {
                if let Some(parent) = parent.upgrade() {
                    lock(&parent.groups).remove(&cancelled_key);
                }
            }));
            lock(&self.state.new_group_queue).push_back(Grouped {
                key,
                stream: FlowStream::new(group.clone() as Arc<dyn Flow<T>>),
            });
        }
        group.push(value);
        self.state.drain();
    }
    fn on_error(&self, error: ReactorError) {
        self.state.fail(error);
    }
    fn on_complete(&self) {
        self.state.done.store(true, Ordering::Release);
        let groups: Vec<Arc<GroupState<T>>> = lock(&self.state.groups).values().cloned().collect();
        for group in groups {
            group.complete();
        }
        self.state.drain();
    }
}

/// 单个分组自己的子流状态：对每个订阅者而言是一条普通的背压流，但内部缓冲是
/// 共享的（只允许第一个订阅者真正消费，后续订阅按 spec §4.1 第二条被拒绝）。
struct GroupState<T> {
    queue: Mutex<VecDeque<T>>,
    requested: RequestCounter,
    wip: AtomicUsize,
    observer: Mutex<Option<Arc<dyn FlowObserver<T>>>>,
    done: AtomicBool,
    error: Mutex<Option<ReactorError>>,
    terminated: AtomicBool,
    subscribed: AtomicBool,
    /// Invoked exactly once, the first time this group is cancelled by its
    /// downstream while upstream is still live; reclaims the group's slot in the
    /// enclosing `groupBy`'s key map (spec §4.8).
    on_cancel: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl<T: Send + Sync + 'static> GroupState<T> {
    fn new() -> Self {
        GroupState {
            queue: Mutex::new(VecDeque::new()),
            requested: RequestCounter::new(),
            wip: AtomicUsize::new(0),
            observer: Mutex::new(None),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            on_cancel: Mutex::new(None),
        }
    }

    fn set_on_cancel(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        *lock(&self.on_cancel) = Some(callback);
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

    /// Terminal reclamation: the enclosing stream completed/errored, every live
    /// group is torn down alongside it. Does not reopen the key in the parent map
    /// (there is no parent map left to reopen it in).
    fn cancel(self: &Arc<Self>) {
        self.terminated.store(true, Ordering::Release);
        lock(&self.queue).clear();
    }

    /// Downstream-initiated cancellation: the group's own subscriber walked away
    /// while upstream may still be producing values for this key. Reclaims the
    /// group's key slot so a later value starts a fresh group.
    fn cancel_from_downstream(self: &Arc<Self>) {
        self.cancel();
        if let Some(callback) = lock(&self.on_cancel).take() {
            callback();
        }
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

impl<T: Send + Sync + 'static> Flow<T> for GroupState<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            let subscription = Arc::new(crate::observer::NoopSubscription);
            observer.on_subscribe(subscription.clone());
            crate::observer::reject_second_subscription(subscription.as_ref());
            return;
        }
        *lock(&self.observer) = Some(observer.clone());
        observer.on_subscribe(Arc::new(GroupSubscription { state: self.clone() }));
        self.drain();
    }
}

struct GroupSubscription<T> {
    state: Arc<GroupState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for GroupSubscription<T> {
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
        self.state.cancel_from_downstream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::from_iterable;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct CollectingObserver<T> {
        values: StdMutex<Vec<T>>,
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
    fn group_by_routes_values_into_separate_keyed_substreams() {
        let source = from_iterable(|| [1i64, 2, 3, 4, 5, 6].into_iter());
        let grouped = source.group_by(|n| n % 2);

        let groups_observer = Arc::new(CollectingObserver::<Grouped<i64, i64>> {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        grouped.subscribe(groups_observer.clone());
        assert!(groups_observer.completed.load(Ordering::SeqCst));

        let mut groups = groups_observer.values.lock().unwrap();
        assert_eq!(groups.len(), 2);
        let evens = groups.remove(
            groups
                .iter()
                .position(|g| g.key == 0)
                .expect("even-key group present"),
        );
        let odds_index = 0;
        let odds = groups.remove(odds_index);

        let evens_observer = Arc::new(CollectingObserver::<i64> {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        evens.stream.subscribe(evens_observer.clone());
        assert_eq!(*evens_observer.values.lock().unwrap(), alloc::vec![2, 4, 6]);

        let odds_observer = Arc::new(CollectingObserver::<i64> {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        odds.stream.subscribe(odds_observer.clone());
        assert_eq!(*odds_observer.values.lock().unwrap(), alloc::vec![1, 3, 5]);
    }

    /// A manual, synchronously-driven source so the test can interleave a group's
    /// downstream cancellation with further upstream emissions for the same key.
    struct ManualSource<T> {
        observer: StdMutex<Option<Arc<dyn FlowObserver<T>>>>,
    }
    impl<T: Send + Sync + 'static> Flow<T> for ManualSource<T> {
        fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
            observer.on_subscribe(Arc::new(NoopUpstreamSubscription));
            *self.observer.lock().unwrap() = Some(observer);
        }
    }
    struct NoopUpstreamSubscription;
    impl Subscription for NoopUpstreamSubscription {
        fn request(&self, _n: i64) {}
        fn cancel(&self) {}
    }

    /// Captures the [`Subscription`] handed to it so the test can cancel it
    /// directly rather than relying on timing.
    struct CancellableObserver<T> {
        values: StdMutex<Vec<T>>,
        subscription: StdMutex<Option<Arc<dyn Subscription>>>,
    }
    impl<T: Send + Sync + 'static> FlowObserver<T> for CancellableObserver<T> {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(i64::MAX);
            *self.subscription.lock().unwrap() = Some(subscription);
        }
        fn on_next(&self, value: T) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {}
    }

    #[test]
    fn cancelling_a_group_lets_a_later_value_for_the_same_key_open_a_fresh_group() {
        let source = Arc::new(ManualSource::<i64> {
            observer: StdMutex::new(None),
        });
        let flow = FlowStream::new(source.clone() as Arc<dyn Flow<i64>>);
        let grouped = flow.group_by(|n| n % 2);

        let groups_observer = Arc::new(CollectingObserver::<Grouped<i64, i64>> {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        grouped.subscribe(groups_observer.clone());

        let upstream = source.observer.lock().unwrap().clone().unwrap();
        upstream.on_next(1);

        let first_odd_group = {
            let groups = groups_observer.values.lock().unwrap();
            assert_eq!(groups.len(), 1);
            groups[0].stream.clone()
        };
        let first_subscriber = Arc::new(CancellableObserver::<i64> {
            values: StdMutex::new(Vec::new()),
            subscription: StdMutex::new(None),
        });
        first_odd_group.subscribe(first_subscriber.clone());
        first_subscriber
            .subscription
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .cancel();

        // Upstream is still live; the next odd value must open a fresh group
        // rather than feed the now-cancelled one.
        upstream.on_next(3);
        upstream.on_complete();

        let groups = groups_observer.values.lock().unwrap();
        assert_eq!(groups.len(), 2, "a fresh group must be opened for key 1");
        assert_eq!(*first_subscriber.values.lock().unwrap(), alloc::vec![1]);

        let second_odd_observer = Arc::new(CollectingObserver::<i64> {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        groups[1].stream.subscribe(second_odd_observer.clone());
        assert_eq!(*second_odd_observer.values.lock().unwrap(), alloc::vec![3]);
    }
}
