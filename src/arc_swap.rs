//! 进程级全局槽位：`ArcSwapSlot<T>`。
//!
//! # 设计初衷（Why）
//! - `no_std` 下 [`::arc_swap::ArcSwapOption`] 不可用；回退实现用 `spin::RwLock`
//!   提供相同契约，正确性优先于极致的锁自由（教师仓库 `arc_swap.rs` 同样的取舍）。
//! - 槽位允许 `const fn` 构造空值（便于 `static` 初始化），首次读取时才惰性创建默认值，
//!   用于 [`crate::plugins`] 的进程级错误处理器单例。
//!
//! # 契约说明（What）
//! - `empty()`：构造尚未写入任何值的槽位。
//! - `load_full()`：返回当前快照（`Arc` 克隆），若为空返回 `None`。
//! - `load_or_init(f)`：若为空则以 `f()` 的结果原子地填充，返回最终快照。
//! - `store(value)`：无条件替换当前快照。
use alloc::sync::Arc;

#[cfg(feature = "std")]
mod backend {
    use super::Arc;
    use ::arc_swap::ArcSwapOption;

    pub struct Slot<T: ?Sized>(ArcSwapOption<T>);

    impl<T: ?Sized> Slot<T> {
        pub const fn empty() -> Self {
            Self(ArcSwapOption::const_empty())
        }

        pub fn load_full(&self) -> Option<Arc<T>> {
            self.0.load_full()
        }

        pub fn store(&self, value: Arc<T>) {
            self.0.store(Some(value));
        }
    }
}

#[cfg(not(feature = "std"))]
mod backend {
    use super::Arc;
    use spin::RwLock;

    pub struct Slot<T: ?Sized>(RwLock<Option<Arc<T>>>);

    impl<T: ?Sized> Slot<T> {
        pub const fn empty() -> Self {
            Self(RwLock::new(None))
        }

        pub fn load_full(&self) -> Option<Arc<T>> {
            self.0.read().clone()
        }

        pub fn store(&self, value: Arc<T>) {
            *self.0.write() = Some(value);
        }
    }
}

/// 惰性初始化的进程级全局槽位，见模块文档。
pub struct ArcSwapSlot<T: ?Sized>(backend::Slot<T>);

impl<T: ?Sized> ArcSwapSlot<T> {
    pub const fn empty() -> Self {
        Self(backend::Slot::empty())
    }

    pub fn load_full(&self) -> Option<Arc<T>> {
        self.0.load_full()
    }

    pub fn store(&self, value: Arc<T>) {
        self.0.store(value);
    }

    /// 若槽位为空，以 `f()` 填充；返回填充后（或已存在）的快照。
    ///
    /// 竞态下可能有多个线程各自调用一次 `f()`，最后一次 `store` 胜出——对于
    /// “默认处理器”这种幂等构造，这个取舍是可以接受的（教师仓库 `arc_swap`
    /// 回退实现同样不追求严格的一次性初始化）。
    pub fn load_or_init(&self, f: impl FnOnce() -> Arc<T>) -> Arc<T> {
        match self.load_full() {
            Some(existing) => existing,
            None => {
                let created = f();
                self.store(created.clone());
                created
            }
        }
    }
}

/// 简易的 `Arc` 快照容器，`std` 下直接复用 [`::arc_swap::ArcSwap`]，`no_std` 下
/// 退化为 `spin::RwLock` 封装；用于持有“一定存在初始值”的可交换共享状态（例如
/// 多播操作符的连接状态机）。
#[cfg(feature = "std")]
pub use ::arc_swap::ArcSwap;

#[cfg(not(feature = "std"))]
pub mod fallback {
    use super::Arc;
    use core::fmt;
    use spin::RwLock;

    pub struct ArcSwap<T> {
        inner: RwLock<Arc<T>>,
    }

    impl<T> ArcSwap<T> {
        pub fn new(initial: Arc<T>) -> Self {
            Self {
                inner: RwLock::new(initial),
            }
        }

        pub fn from_pointee(value: T) -> Self {
            Self::new(Arc::new(value))
        }

        pub fn load_full(&self) -> Arc<T> {
            self.inner.read().clone()
        }

        pub fn store(&self, value: Arc<T>) {
            *self.inner.write() = value;
        }
    }

    impl<T: fmt::Debug> fmt::Debug for ArcSwap<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ArcSwap")
                .field("inner", &self.inner.read())
                .finish()
        }
    }
}

#[cfg(not(feature = "std"))]
pub use fallback::ArcSwap;
