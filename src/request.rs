//! 背压请求记账（spec §4.3）。
//!
//! # 设计背景（Why）
//! - 每个 [`crate::observer::Subscription`] 实现都需要把"累计请求量"和"已投递量"
//!   做无锁记账；如果每个操作符各写一遍 CAS 循环，容易在饱和、下溢、取消哨兵
//!   三件事上出错。抽成一个共享工具类后，只需要在一处验证这些边界情况。
//!
//! # 契约说明（What）
//! - 计数器以 `i64` 表示，视为 spec 所称的“63 位可表示范围”（符号位恒为 0，与
//!   `Long.MAX_VALUE` 对齐）。
//! - [`RequestCounter::CANCELLED`]：哨兵值，一旦写入即吸收所有后续 `add`/`produced`。
//! - `add(n)`：饱和递增，CAS 循环实现。
//! - `produced(n)`：饱和递减；若会导致下溢（产出多于请求），视为契约违反并 `panic`
//!   （spec：“underflow indicates a bug and must fail fast”）。
use core::sync::atomic::{AtomicI64, Ordering};

/// 共享的无锁请求计数器，见模块文档。
#[derive(Debug, Default)]
pub struct RequestCounter {
    value: AtomicI64,
}

impl RequestCounter {
    /// 代表"已取消"的吸收态哨兵：可表示范围内的最小值。
    pub const CANCELLED: i64 = i64::MIN;

    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// 读取当前累计请求量；若已取消返回 0（不把哨兵值泄露给调用方）。
    pub fn current(&self) -> i64 {
        let v = self.value.load(Ordering::Acquire);
        if v == Self::CANCELLED { 0 } else { v }
    }

    pub fn is_cancelled(&self) -> bool {
        self.value.load(Ordering::Acquire) == Self::CANCELLED
    }

    /// 原子地切换到取消态；吸收之后的一切 `add`/`produced`。
    pub fn cancel(&self) {
        self.value.store(Self::CANCELLED, Ordering::Release);
    }

    /// 饱和递增 `n`（`n` 必须为正，调用方负责在协议层校验 `n <= 0` 的情形）。
    ///
    /// 返回递增前的值；若当前处于取消态，返回 [`Self::CANCELLED`] 且不做任何修改。
    pub fn add(&self, n: i64) -> i64 {
        debug_assert!(n > 0, "RequestCounter::add requires a positive amount");
        loop {
            let current = self.value.load(Ordering::Acquire);
            if current == Self::CANCELLED {
                return Self::CANCELLED;
            }
            let next = current.saturating_add(n);
            if self
                .value
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return current;
            }
        }
    }

    /// 饱和递减 `n`（已投递量）。若计数器已取消则为无操作。
    ///
    /// # Panics
    /// 若 `n` 大于当前累计请求量（下溢），按照契约视为实现缺陷并 panic。
    pub fn produced(&self, n: i64) {
        if n == 0 {
            return;
        }
        loop {
            let current = self.value.load(Ordering::Acquire);
            if current == Self::CANCELLED {
                return;
            }
            let next = current
                .checked_sub(n)
                .expect("RequestCounter::produced underflowed the outstanding request count");
            assert!(
                next >= 0,
                "produced({n}) exceeded outstanding requests ({current})"
            );
            if self
                .value
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// 将一个 `request(n)` 调用中的非正数参数合成为协议违规错误。
///
/// spec §4.1：“`n <= 0` 是协议错误，需在违规处合成 `error(IllegalArgument)` 并取消
/// 上游”。集中实现一次，避免每个操作符各写一条错误信息。
pub fn validate_request_amount(n: i64) -> Result<(), crate::error::ReactorError> {
    if n > 0 {
        Ok(())
    } else {
        Err(crate::error::ReactorError::protocol_violation(
            crate::error::codes::SUBSCRIPTION_NON_POSITIVE_REQUEST,
            alloc::format!("request(n) called with non-positive n = {n}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_saturates_at_i64_max() {
        let counter = RequestCounter::new();
        counter.add(i64::MAX - 1);
        counter.add(10);
        assert_eq!(counter.current(), i64::MAX);
    }

    #[test]
    fn produced_tracks_outstanding_demand() {
        let counter = RequestCounter::new();
        counter.add(5);
        counter.produced(3);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    #[should_panic(expected = "exceeded outstanding requests")]
    fn produced_more_than_requested_panics() {
        let counter = RequestCounter::new();
        counter.add(1);
        counter.produced(2);
    }

    #[test]
    fn cancel_absorbs_further_operations() {
        let counter = RequestCounter::new();
        counter.add(5);
        counter.cancel();
        assert!(counter.is_cancelled());
        assert_eq!(counter.add(10), RequestCounter::CANCELLED);
        counter.produced(1_000); // must not panic: cancelled state absorbs
        assert_eq!(counter.current(), 0);
    }
}
