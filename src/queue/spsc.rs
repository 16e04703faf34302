//! 单生产者单消费者有界队列。
//!
//! # 设计背景（Why）
//! - `observe_on`、`buffer`/`window` 的单一上游场景不需要 MPSC 的多占位 CAS 开销；
//!   专用的 SPSC 环形队列去掉了生产者侧的 CAS 竞争，只需一次 `load`/`store`。
use alloc::{boxed::Box, vec::Vec};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 有界 SPSC 队列，见模块文档。容量内部向上取整为 `requested_capacity + 1`，
/// 以便用"头尾相遇"区分满/空而不必额外维护计数字段。
pub struct BoundedSpscQueue<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for BoundedSpscQueue<T> {}
unsafe impl<T: Send> Sync for BoundedSpscQueue<T> {}

impl<T> BoundedSpscQueue<T> {
    pub fn with_capacity(requested_capacity: usize) -> Self {
        let capacity = requested_capacity.max(1) + 1;
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            buffer: cells.into_boxed_slice(),
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity - 1
    }

    /// 生产者专用：入队，满则原样交还。
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.capacity;
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe {
            (*self.buffer[tail].get()).write(value);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// 消费者专用：出队，空则 `None`。
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*self.buffer[head].get()).assume_init_read() };
        self.head.store((head + 1) % self.capacity, Ordering::Release);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            self.capacity - head + tail
        }
    }
}

impl<T> Drop for BoundedSpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q: BoundedSpscQueue<i32> = BoundedSpscQueue::with_capacity(3);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert!(q.push(3).is_ok());
        assert_eq!(q.push(4), Err(4));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(4).is_ok());
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn len_tracks_occupancy() {
        let q: BoundedSpscQueue<i32> = BoundedSpscQueue::with_capacity(4);
        assert_eq!(q.len(), 0);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.len(), 2);
        q.pop();
        assert_eq!(q.len(), 1);
    }
}
