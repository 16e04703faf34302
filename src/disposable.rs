//! `Disposable` 与组合资源注册表（spec §3「Disposable」、§4.2「CR」）。
//!
//! # 设计背景（Why）
//! - 每个操作符实例拥有一组需要在终止/取消时释放的资源（定时器句柄、内部订阅等）。
//!   把它们散落在各操作符里各自管理容易遗漏；统一的组合容器（CR）把“幂等释放”
//!   这一点集中实现一次。
//! - 并发访问：`add`/`remove`/`dispose` 可能来自不同线程（例如取消发生在另一个
//!   线程），因此内部用锁保护成员集合，而不是依赖调用方做外部同步。
use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "std")]
use std::sync::Mutex;

#[cfg(not(feature = "std"))]
use spin::Mutex;

/// 具备幂等释放语义的资源句柄。
///
/// `dispose` 必须可以被调用任意次而只产生一次实际效果；`is_disposed` 用于旁路
/// 查询，不应有副作用。
pub trait Disposable: Send + Sync {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

/// 将任意 `FnOnce` 包装为一次性 [`Disposable`]，用于临时资源（如取消一个定时器）。
pub struct CallbackDisposable<F: Fn() + Send + Sync> {
    action: F,
    disposed: AtomicBool,
}

impl<F: Fn() + Send + Sync> CallbackDisposable<F> {
    pub fn new(action: F) -> Self {
        Self {
            action,
            disposed: AtomicBool::new(false),
        }
    }
}

impl<F: Fn() + Send + Sync> Disposable for CallbackDisposable<F> {
    fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (self.action)();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// 永远不会被释放的哨兵（用于表示"未设置任何资源"而非 `Option` 的空洞语义）。
pub struct EmptyDisposable;

impl Disposable for EmptyDisposable {
    fn dispose(&self) {}
    fn is_disposed(&self) -> bool {
        false
    }
}

enum Members {
    Live(Vec<Box<dyn Disposable>>),
    Disposed,
}

/// 组合资源注册表（CR）：持有一组 [`Disposable`]，支持批量/原子释放。
///
/// 语义完全对应 spec §4.2：
/// - `add`：已释放则立即释放参数并返回 `false`；否则纳入集合并返回 `true`。
/// - `clear`：释放当前所有成员，但容器本身仍可继续使用。
/// - `dispose`：标记为已释放并释放所有当前成员；幂等。
pub struct CompositeDisposable {
    members: Mutex<Members>,
}

impl Default for CompositeDisposable {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeDisposable {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Members::Live(Vec::new())),
        }
    }

    /// 纳入一个资源；若容器已释放，立即释放该资源并返回 `false`。
    pub fn add(&self, disposable: Box<dyn Disposable>) -> bool {
        let mut guard = lock(&self.members);
        match &mut *guard {
            Members::Live(members) => {
                members.push(disposable);
                true
            }
            Members::Disposed => {
                drop(guard);
                disposable.dispose();
                false
            }
        }
    }

    /// 释放当前全部成员并清空集合；容器本身保持"未释放"状态，可继续 `add`。
    pub fn clear(&self) {
        let taken = {
            let mut guard = lock(&self.members);
            match &mut *guard {
                Members::Live(members) => core::mem::take(members),
                Members::Disposed => Vec::new(),
            }
        };
        for member in taken {
            member.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(&*lock(&self.members), Members::Disposed)
    }

    pub fn size(&self) -> usize {
        match &*lock(&self.members) {
            Members::Live(members) => members.len(),
            Members::Disposed => 0,
        }
    }
}

impl Disposable for CompositeDisposable {
    fn dispose(&self) {
        let taken = {
            let mut guard = lock(&self.members);
            match core::mem::replace(&mut *guard, Members::Disposed) {
                Members::Live(members) => members,
                Members::Disposed => return,
            }
        };
        for member in taken {
            member.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        CompositeDisposable::is_disposed(self)
    }
}

#[cfg(feature = "std")]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(not(feature = "std"))]
fn lock<T>(mutex: &Mutex<T>) -> spin::MutexGuard<'_, T> {
    mutex.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn counting_disposable(counter: &alloc::sync::Arc<AtomicUsize>) -> Box<dyn Disposable> {
        let counter = counter.clone();
        Box::new(CallbackDisposable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn dispose_is_idempotent() {
        let counter = alloc::sync::Arc::new(AtomicUsize::new(0));
        let cr = CompositeDisposable::new();
        cr.add(counting_disposable(&counter));
        cr.add(counting_disposable(&counter));
        cr.dispose();
        cr.dispose();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(cr.is_disposed());
    }

    #[test]
    fn add_after_dispose_disposes_immediately() {
        let counter = alloc::sync::Arc::new(AtomicUsize::new(0));
        let cr = CompositeDisposable::new();
        cr.dispose();
        let accepted = cr.add(counting_disposable(&counter));
        assert!(!accepted);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_disposes_members_but_keeps_container_usable() {
        let counter = alloc::sync::Arc::new(AtomicUsize::new(0));
        let cr = CompositeDisposable::new();
        cr.add(counting_disposable(&counter));
        cr.clear();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!cr.is_disposed());
        assert!(cr.add(counting_disposable(&counter)));
    }
}
