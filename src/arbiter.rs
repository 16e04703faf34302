//! 订阅仲裁者（Subscription Arbiter，spec §4.4）。
//!
//! # 设计背景（Why）
//! - `retry`/`repeat`/`onErrorResumeNext`/`delaySubscription`/`switchMap` 都需要在
//!   同一个对外订阅背后，依次挂接多个上游订阅（重试的每次尝试、`switchMap` 的每个
//!   内层流）。如果每个操作符各写一套"请求量结转"逻辑，容易在重入或并发替换时出错。
//! - 仲裁者把"当前上游订阅"和"尚未转发的已请求量"打包成一个可以原子替换的状态，
//!   对外表现为单一 [`crate::observer::Subscription`]。
//!
//! # 契约说明（What）
//! - `set_subscription`：替换当前上游；若有结转的正请求量，立即转发给新上游；
//!   若仲裁者已取消，转而取消参数本身。
//! - `request(n)`：若已有上游，原子地转发；否则累加进结转量。
//! - `produced(n)`：从结转量中扣减（不会小于零），用于 `switchMap` 等需要自行
//!   跟踪"这一批上游已经交付了多少"的场景。
//! - `cancel()`：切换为已取消态并取消当前上游；此后 `set_subscription` 直接取消
//!   传入的新订阅。
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use crate::error::{ArbiterError, ReactorError};
use crate::observer::Subscription;

#[cfg(feature = "std")]
use std::sync::Mutex;

#[cfg(not(feature = "std"))]
use spin::Mutex;

const STATE_ACTIVE: u8 = 0;
const STATE_CANCELLED: u8 = 1;

/// 参见模块文档。
pub struct SubscriptionArbiter {
    current: Mutex<Option<Arc<dyn Subscription>>>,
    carry_over: AtomicI64,
    state: AtomicU8,
}

impl Default for SubscriptionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionArbiter {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            carry_over: AtomicI64::new(0),
            state: AtomicU8::new(STATE_ACTIVE),
        }
    }

    fn lock(&self) -> impl core::ops::DerefMut<Target = Option<Arc<dyn Subscription>>> + '_ {
        #[cfg(feature = "std")]
        {
            self.current.lock().unwrap_or_else(|p| p.into_inner())
        }
        #[cfg(not(feature = "std"))]
        {
            self.current.lock()
        }
    }

    /// 是否已经取消。
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    /// 替换当前上游订阅，结转任何尚未转发的请求量。
    pub fn set_subscription(&self, subscription: Arc<dyn Subscription>) {
        if self.is_cancelled() {
            self.reject_late_subscription(&subscription);
            return;
        }
        *self.lock() = Some(subscription.clone());
        // 重新检查：`cancel()` 可能在我们写入 `current` 之后、读取之前发生。
        if self.is_cancelled() {
            self.reject_late_subscription(&subscription);
            *self.lock() = None;
            return;
        }
        let carried = self.carry_over.swap(0, Ordering::AcqRel);
        if carried > 0 {
            subscription.request(carried);
        }
    }

    /// 请求 `n` 个元素：有上游则直接转发，否则累加进结转量。
    pub fn request(&self, n: i64) {
        if n <= 0 || self.is_cancelled() {
            return;
        }
        let guard = self.lock();
        match guard.as_ref() {
            Some(sub) => sub.request(n),
            None => {
                drop(guard);
                add_saturating(&self.carry_over, n);
            }
        }
    }

    /// 从结转量中扣减已交付数量；饱和于零，绝不下溢。
    pub fn produced(&self, n: i64) {
        if n <= 0 {
            return;
        }
        loop {
            let current = self.carry_over.load(Ordering::Acquire);
            let next = (current - n).max(0);
            if self
                .carry_over
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// 取消仲裁者：此后任何 `set_subscription` 都会立即取消传入的新订阅。
    pub fn cancel(&self) {
        tracing::trace!(target: "reactor_core::arbiter", "arbiter cancelled");
        self.state.store(STATE_CANCELLED, Ordering::Release);
        if let Some(sub) = self.lock().take() {
            sub.cancel();
        }
    }

    /// 仲裁者已取消之后又收到一个新上游订阅：取消该订阅，并把这次竞态上报给全局
    /// 不可投递错误槽（spec 不变式 2），因为这个订阅此后再也没有别的地方可以报告。
    fn reject_late_subscription(&self, subscription: &Arc<dyn Subscription>) {
        subscription.cancel();
        let error = ReactorError::arbiter_cancelled(ArbiterError::AlreadyCancelled);
        tracing::warn!(
            target: "reactor_core::arbiter",
            code = error.code(),
            "rejected a subscription attached after the arbiter was already cancelled"
        );
        crate::plugins::report_undeliverable(error);
    }
}

impl Subscription for SubscriptionArbiter {
    fn request(&self, n: i64) {
        SubscriptionArbiter::request(self, n);
    }

    fn cancel(&self) {
        SubscriptionArbiter::cancel(self);
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

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicI64 as _AI64;

    struct RecordingSubscription {
        requested: Arc<_AI64>,
        cancelled: Arc<core::sync::atomic::AtomicBool>,
    }

    impl Subscription for RecordingSubscription {
        fn request(&self, n: i64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn carries_demand_across_subscription_swap() {
        let arbiter = SubscriptionArbiter::new();
        arbiter.request(7);

        let requested = Arc::new(_AI64::new(0));
        let cancelled = Arc::new(core::sync::atomic::AtomicBool::new(false));
        let sub = Arc::new(RecordingSubscription {
            requested: requested.clone(),
            cancelled: cancelled.clone(),
        });
        arbiter.set_subscription(sub);
        assert_eq!(requested.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn cancel_then_set_subscription_cancels_the_new_one() {
        let arbiter = SubscriptionArbiter::new();
        arbiter.cancel();

        let requested = Arc::new(_AI64::new(0));
        let cancelled = Arc::new(core::sync::atomic::AtomicBool::new(false));
        let sub = Arc::new(RecordingSubscription {
            requested,
            cancelled: cancelled.clone(),
        });
        arbiter.set_subscription(sub);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
