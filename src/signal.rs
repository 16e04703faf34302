//! 非背压流基类（SN，spec §3「Stream (S)」）。
//!
//! 与 [`crate::flow`] 同构，只是下游句柄从 [`crate::observer::Subscription`]
//! 换成了 [`crate::disposable::Disposable`]：上游自由推送，下游只能取消，不能调节速率。
use alloc::sync::Arc;
use core::marker::PhantomData;

use crate::observer::SignalObserver;

/// 非背压流的对象安全核心。
pub trait Signal<T>: Send + Sync {
    fn subscribe_signal(self: Arc<Self>, observer: Arc<dyn SignalObserver<T>>);
}

/// 面向使用者的非背压流句柄。
#[derive(Clone)]
pub struct SignalStream<T>(Arc<dyn Signal<T>>);

impl<T> SignalStream<T> {
    pub fn new(inner: Arc<dyn Signal<T>>) -> Self {
        SignalStream(inner)
    }

    pub fn as_signal(&self) -> Arc<dyn Signal<T>> {
        self.0.clone()
    }

    pub fn subscribe(&self, observer: Arc<dyn SignalObserver<T>>) {
        self.0.clone().subscribe_signal(observer);
    }

    pub fn lift<U, F>(&self, factory: F) -> SignalStream<U>
    where
        T: 'static,
        U: 'static,
        F: Fn(Arc<dyn SignalObserver<U>>) -> Arc<dyn SignalObserver<T>> + Send + Sync + 'static,
    {
        SignalStream::new(Arc::new(LiftedSignal {
            source: self.0.clone(),
            factory,
            _marker: PhantomData,
        }))
    }
}

struct LiftedSignal<T, U, F> {
    source: Arc<dyn Signal<T>>,
    factory: F,
    _marker: PhantomData<fn(U)>,
}

impl<T, U, F> Signal<U> for LiftedSignal<T, U, F>
where
    T: 'static,
    U: 'static,
    F: Fn(Arc<dyn SignalObserver<U>>) -> Arc<dyn SignalObserver<T>> + Send + Sync,
{
    fn subscribe_signal(self: Arc<Self>, observer: Arc<dyn SignalObserver<U>>) {
        let wrapped = (self.factory)(observer);
        self.source.clone().subscribe_signal(wrapped);
    }
}
