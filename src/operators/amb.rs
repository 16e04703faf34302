//! `amb`（spec §4.8）：首个产生任何通知的源胜出，其余源被取消。
//!
//! # 设计背景（Why）
//! - 胜负判定发生在"首个通知"而非"首个订阅"：所有候选源都先被订阅并获得同样的
//!   下游需求广播（否则谁都不会发射任何值），直到有人真正发出第一个通知——
//!   值、错误或完成皆可——才决出胜者，随后其余候选被取消，下游之后只与胜者对话。
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicIsize, Ordering};

use crate::error::ReactorError;
use crate::flow::{Flow, FlowStream};
use crate::observer::{FlowObserver, Subscription};
use crate::request::validate_request_amount;

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

const NONE: isize = -1;

/// 订阅所有 `sources`，首个发出通知的源胜出。
pub fn amb_streams<T>(sources: Vec<FlowStream<T>>) -> FlowStream<T>
where
    T: Send + Sync + 'static,
{
    FlowStream::new(Arc::new(AmbFlow { sources }))
}

struct AmbFlow<T> {
    sources: Vec<FlowStream<T>>,
}
impl<T: Send + Sync + 'static> Flow<T> for AmbFlow<T> {
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>) {
        let count = self.sources.len();
        let state = Arc::new(AmbState {
            downstream: observer.clone(),
            winner: AtomicIsize::new(NONE),
            inner_subs: Mutex::new(alloc::vec![None; count]),
            winner_sub: Mutex::new(None),
            broadcast_requested: AtomicI64::new(0),
            terminated: AtomicBool::new(false),
        });
        observer.on_subscribe(Arc::new(AmbSubscription { state: state.clone() }));
        for (index, source) in self.sources.iter().enumerate() {
            let observer = Arc::new(AmbInnerObserver {
                state: state.clone(),
                index,
            });
            source.subscribe(observer);
        }
        if count == 0 {
            observer.on_complete();
        }
    }
}

struct AmbState<T> {
    downstream: Arc<dyn FlowObserver<T>>,
    winner: AtomicIsize,
    inner_subs: Mutex<Vec<Option<Arc<dyn Subscription>>>>,
    winner_sub: Mutex<Option<Arc<dyn Subscription>>>,
    broadcast_requested: AtomicI64,
    terminated: AtomicBool,
}

impl<T: Send + Sync + 'static> AmbState<T> {
    /// 确认（或确认自己已经是）给定索引的胜者；若是第一次决出胜者，取消其余候选。
    fn claim_or_confirm_winner(&self, index: usize) -> bool {
        if self
            .winner
            .compare_exchange(NONE, index as isize, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut subs = lock(&self.inner_subs);
            let winner_sub = subs[index].clone();
            *lock(&self.winner_sub) = winner_sub;
            for (i, slot) in subs.iter_mut().enumerate() {
                if i != index {
                    if let Some(sub) = slot.take() {
                        sub.cancel();
                    }
                }
            }
            true
        } else {
            self.winner.load(Ordering::Acquire) == index as isize
        }
    }
}

struct AmbSubscription<T> {
    state: Arc<AmbState<T>>,
}
impl<T: Send + Sync + 'static> Subscription for AmbSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request_amount(n) {
            self.state.terminated.store(true, Ordering::Release);
            self.state.downstream.on_error(err);
            return;
        }
        if let Some(sub) = lock(&self.state.winner_sub).as_ref() {
            sub.request(n);
            return;
        }
        add_saturating(&self.state.broadcast_requested, n);
        for sub in lock(&self.state.inner_subs).iter().flatten() {
            sub.request(n);
        }
    }
    fn cancel(&self) {
        self.state.terminated.store(true, Ordering::Release);
        if let Some(sub) = lock(&self.state.winner_sub).take() {
            sub.cancel();
            return;
        }
        for sub in lock(&self.state.inner_subs).iter_mut() {
            if let Some(sub) = sub.take() {
                sub.cancel();
            }
        }
    }
}

fn add_saturating(counter: &AtomicI64, n: i64) {
    loop {
        let current = counter.load(Ordering::Acquire);
        let next = current.saturating_add(n);
        if counter
            .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

struct AmbInnerObserver<T> {
    state: Arc<AmbState<T>>,
    index: usize,
}
impl<T: Send + Sync + 'static> FlowObserver<T> for AmbInnerObserver<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.state.terminated.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        let already_lost = {
            let mut subs = lock(&self.state.inner_subs);
            subs[self.index] = Some(subscription.clone());
            let winner = self.state.winner.load(Ordering::Acquire);
            winner != NONE && winner != self.index as isize
        };
        if already_lost {
            subscription.cancel();
            return;
        }
        let pending = self.state.broadcast_requested.load(Ordering::Acquire);
        if pending > 0 {
            subscription.request(pending);
        }
    }
    fn on_next(&self, value: T) {
        if self.state.claim_or_confirm_winner(self.index) {
            self.state.downstream.on_next(value);
        }
    }
    fn on_error(&self, error: ReactorError) {
        if self.state.claim_or_confirm_winner(self.index) {
            self.state.downstream.on_error(error);
        }
    }
    fn on_complete(&self) {
        if self.state.claim_or_confirm_winner(self.index) {
            self.state.downstream.on_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factories::{just, never};
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
    fn amb_becomes_transparent_to_the_first_source_to_emit() {
        let winner = just(alloc::vec![1i64, 2, 3]);
        let loser = never();
        let combined = amb_streams(alloc::vec![loser, winner]);
        let observer = Arc::new(CollectingObserver {
            values: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        combined.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![1, 2, 3]);
        assert!(observer.completed.load(Ordering::SeqCst));
    }
}
