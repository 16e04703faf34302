//! 多生产者单消费者有界队列。
//!
//! # 设计背景（Why）
//! - `merge`/`flatMap`/`publish` 的分发循环需要让任意数量的内层来源并发 `push`，
//!   同时只有一个消费者（漏loop/分发循环）在 `pop`。
//!
//! # 实现（How）
//! - 采用 Dmitry Vyukov 的有界 MPMC 环形队列算法：每个槽位携带一个与其"代"对齐的
//!   序列号；生产者/消费者各自通过一次 CAS 占位再写入/读出，不需要互斥锁。
//!   本实现只使用其单消费者子集（`pop` 不要求并发安全于多个消费者）。
//! - 容量向上取整为 2 的幂，便于用位掩码代替取模。
use alloc::{boxed::Box, vec::Vec};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// 有界 MPSC 队列，见模块文档。
pub struct BoundedMpscQueue<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl<T: Send> Send for BoundedMpscQueue<T> {}
unsafe impl<T: Send> Sync for BoundedMpscQueue<T> {}

impl<T> BoundedMpscQueue<T> {
    /// 构造容量至少为 `requested_capacity` 的队列（实际容量向上取整为 2 的幂，
    /// 最小为 2）。
    pub fn with_capacity(requested_capacity: usize) -> Self {
        let capacity = requested_capacity.max(2).next_power_of_two();
        let mut cells = Vec::with_capacity(capacity);
        for i in 0..capacity {
            cells.push(Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        Self {
            buffer: cells.into_boxed_slice(),
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// 尝试入队；队列已满时返回 `Err(value)` 原样交还给调用方。
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*cell.value.get()).write(value);
                        }
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// 尝试出队；队列为空返回 `None`。调用方需保证任意时刻只有一个消费者。
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos as isize + 1);
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dequeue_pos.load(Ordering::Acquire) == self.enqueue_pos.load(Ordering::Acquire)
    }
}

impl<T> Drop for BoundedMpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_fifo() {
        let q: BoundedMpscQueue<i32> = BoundedMpscQueue::with_capacity(4);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn rejects_when_full() {
        let q: BoundedMpscQueue<i32> = BoundedMpscQueue::with_capacity(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
    }

    #[test]
    fn concurrent_producers_deliver_all_items() {
        let q = Arc::new(BoundedMpscQueue::<usize>::with_capacity(1024));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let mut value = p * 100 + i;
                        loop {
                            match q.push(value) {
                                Ok(()) => break,
                                Err(back) => value = back,
                            }
                        }
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut count = 0;
        while q.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 400);
    }
}
