//! 背压流基类（SB，spec §3「Stream (S)」、§4.6）。
//!
//! # 设计背景（Why）
//! - 教师仓库的 [`crate::pipeline::Pipeline`]/[`crate::pipeline::ChainBuilder`] 把一条
//!   处理链表达为"包装下游、再转交上游"的对象链；本模块把同样的包装链思路应用到
//!   背压流的 `subscribe`/`lift` 上：每个操作符都是一个包着下一个 [`FlowObserver`]
//!   的薄对象，订阅时从下游往上游逐层构造包装观察者，再整体转交最上游源。
//!
//! # 契约说明（What）
//! - `Flow<T>` 是订阅动作的对象安全核心：`subscribe_flow` 接收一个已经装配好的
//!   观察者。[`FlowStream<T>`] 是面向使用者的句柄，封装了 `Arc<dyn Flow<T>>` 并提供
//!   `subscribe`/`lift` 等组合方法。
//! - 一个 `FlowStream` 实例是不可变且可重复订阅的：每次 `subscribe` 都创建一条全新
//!   的操作符链状态（spec §3「Lifecycles」）。
use alloc::sync::Arc;
use core::marker::PhantomData;

use crate::observer::FlowObserver;

/// 背压流的对象安全核心。
pub trait Flow<T>: Send + Sync {
    /// 以 `Arc<Self>` 为接收者，使得 trait object 可以在不复制流状态的前提下
    /// 反复订阅（每次订阅各自构造独立的操作符链状态）。
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<T>>);
}

/// 面向使用者的背压流句柄；见模块文档。
#[derive(Clone)]
pub struct FlowStream<T>(Arc<dyn Flow<T>>);

impl<T> FlowStream<T> {
    pub fn new(inner: Arc<dyn Flow<T>>) -> Self {
        FlowStream(inner)
    }

    pub fn as_flow(&self) -> Arc<dyn Flow<T>> {
        self.0.clone()
    }

    /// 订阅该流（spec §4.6）：`subscribe` 本身不做任何重试或异常包装——
    /// `on_subscribe` 中抛出的异常被视为致命错误，由调用方的运行时处理。
    pub fn subscribe(&self, observer: Arc<dyn FlowObserver<T>>) {
        self.0.clone().subscribe_flow(observer);
    }

    /// 通用操作符构造：`factory` 接收下游观察者，返回一个包装后的、面向上游的
    /// 观察者（spec §4.6「lift」）。
    pub fn lift<U, F>(&self, factory: F) -> FlowStream<U>
    where
        T: 'static,
        U: 'static,
        F: Fn(Arc<dyn FlowObserver<U>>) -> Arc<dyn FlowObserver<T>> + Send + Sync + 'static,
    {
        FlowStream::new(Arc::new(LiftedFlow {
            source: self.0.clone(),
            factory,
            _marker: PhantomData,
        }))
    }
}

struct LiftedFlow<T, U, F> {
    source: Arc<dyn Flow<T>>,
    factory: F,
    _marker: PhantomData<fn(U)>,
}

impl<T, U, F> Flow<U> for LiftedFlow<T, U, F>
where
    T: 'static,
    U: 'static,
    F: Fn(Arc<dyn FlowObserver<U>>) -> Arc<dyn FlowObserver<T>> + Send + Sync,
{
    fn subscribe_flow(self: Arc<Self>, observer: Arc<dyn FlowObserver<U>>) {
        let wrapped = (self.factory)(observer);
        self.source.clone().subscribe_flow(wrapped);
    }
}
