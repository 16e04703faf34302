//! `Timed<T>`：携带时间戳的值（spec §3「Timed<T>」）。
use core::time::Duration;

use crate::scheduler::MonotonicTimePoint;

/// `(value, timestamp, unit)`——本 crate 统一以 [`Duration`] 表达时间单位，
/// 因此时间戳与单位合一为 [`MonotonicTimePoint`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timed<T> {
    pub value: T,
    pub timestamp: MonotonicTimePoint,
}

impl<T> Timed<T> {
    pub fn new(value: T, timestamp: MonotonicTimePoint) -> Self {
        Timed { value, timestamp }
    }

    pub fn elapsed_since(&self, earlier: MonotonicTimePoint) -> Duration {
        self.timestamp.saturating_duration_since(earlier)
    }
}
