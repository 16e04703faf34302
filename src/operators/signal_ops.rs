//! SN 侧逐值变换操作符（spec §3「Stream (S)」，对齐 §11 给 SB 侧提供的同名操作符）。
//!
//! SN 没有 `request`，下游只能 `cancel`；因此这里没有 SB 侧 `filter`/`skip` 等操作符
//! 里"丢弃一个值就补发一次 request"的动作——上游本来就是自由推送的，没有需求额度
//! 需要找补。结构上仍然复用 [`SignalStream::lift`]：工厂闭包包一个新的
//! [`SignalObserver`] 接在上游前面，和 [`crate::operators::simple`] 的 `FlowObserver`
//! 包装是同一种写法。
use alloc::sync::Arc;

use crate::disposable::Disposable;
use crate::error::ReactorError;
use crate::observer::SignalObserver;
use crate::signal::SignalStream;

impl<T> SignalStream<T>
where
    T: Send + Sync + 'static,
{
    /// `map(f)`：对每个值应用 `f`。
    pub fn map<U, F>(&self, f: F) -> SignalStream<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(T) -> U + Send + Sync> = Arc::new(f);
        self.lift(move |downstream: Arc<dyn SignalObserver<U>>| {
            Arc::new(MapObserver {
                downstream,
                f: f.clone(),
            }) as Arc<dyn SignalObserver<T>>
        })
    }

    /// `filter(predicate)`：丢弃不满足谓词的值。
    pub fn filter<F>(&self, predicate: F) -> SignalStream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<dyn Fn(&T) -> bool + Send + Sync> = Arc::new(predicate);
        self.lift(move |downstream: Arc<dyn SignalObserver<T>>| {
            Arc::new(FilterObserver {
                downstream,
                predicate: predicate.clone(),
            }) as Arc<dyn SignalObserver<T>>
        })
    }

    /// `do_on_next`：副作用钩子，不改变通知本身。
    pub fn do_on_next<F>(&self, action: F) -> SignalStream<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let action: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(action);
        self.lift(move |downstream: Arc<dyn SignalObserver<T>>| {
            Arc::new(DoOnNextObserver {
                downstream,
                action: action.clone(),
            }) as Arc<dyn SignalObserver<T>>
        })
    }

    /// `do_on_error`：副作用钩子，不改变通知本身。
    pub fn do_on_error<F>(&self, action: F) -> SignalStream<T>
    where
        F: Fn(&ReactorError) + Send + Sync + 'static,
    {
        let action: Arc<dyn Fn(&ReactorError) + Send + Sync> = Arc::new(action);
        self.lift(move |downstream: Arc<dyn SignalObserver<T>>| {
            Arc::new(DoOnErrorObserver {
                downstream,
                action: action.clone(),
            }) as Arc<dyn SignalObserver<T>>
        })
    }

    /// `do_on_complete`：副作用钩子，不改变通知本身。
    pub fn do_on_complete<F>(&self, action: F) -> SignalStream<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let action: Arc<dyn Fn() + Send + Sync> = Arc::new(action);
        self.lift(move |downstream: Arc<dyn SignalObserver<T>>| {
            Arc::new(DoOnCompleteObserver {
                downstream,
                action: action.clone(),
            }) as Arc<dyn SignalObserver<T>>
        })
    }
}

struct MapObserver<T, U> {
    downstream: Arc<dyn SignalObserver<U>>,
    f: Arc<dyn Fn(T) -> U + Send + Sync>,
}
impl<T, U> SignalObserver<T> for MapObserver<T, U> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        self.downstream.on_subscribe(disposable);
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next((self.f)(value));
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct FilterObserver<T> {
    downstream: Arc<dyn SignalObserver<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}
impl<T> SignalObserver<T> for FilterObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        self.downstream.on_subscribe(disposable);
    }
    fn on_next(&self, value: T) {
        if (self.predicate)(&value) {
            self.downstream.on_next(value);
        }
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DoOnNextObserver<T> {
    downstream: Arc<dyn SignalObserver<T>>,
    action: Arc<dyn Fn(&T) + Send + Sync>,
}
impl<T> SignalObserver<T> for DoOnNextObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        self.downstream.on_subscribe(disposable);
    }
    fn on_next(&self, value: T) {
        (self.action)(&value);
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DoOnErrorObserver<T> {
    downstream: Arc<dyn SignalObserver<T>>,
    action: Arc<dyn Fn(&ReactorError) + Send + Sync>,
}
impl<T> SignalObserver<T> for DoOnErrorObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        self.downstream.on_subscribe(disposable);
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        (self.action)(&error);
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct DoOnCompleteObserver<T> {
    downstream: Arc<dyn SignalObserver<T>>,
    action: Arc<dyn Fn() + Send + Sync>,
}
impl<T> SignalObserver<T> for DoOnCompleteObserver<T> {
    fn on_subscribe(&self, disposable: Arc<dyn Disposable>) {
        self.downstream.on_subscribe(disposable);
    }
    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }
    fn on_error(&self, error: ReactorError) {
        self.downstream.on_error(error);
    }
    fn on_complete(&self) {
        (self.action)();
        self.downstream.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::disposable::EmptyDisposable;
    use crate::signal::Signal;

    struct PushAll<T> {
        values: Mutex<Vec<T>>,
    }
    impl<T: Send + Sync + 'static> Signal<T> for PushAll<T> {
        fn subscribe_signal(self: Arc<Self>, observer: Arc<dyn SignalObserver<T>>) {
            observer.on_subscribe(Arc::new(EmptyDisposable));
            for value in core::mem::take(&mut *self.values.lock().unwrap()) {
                observer.on_next(value);
            }
            observer.on_complete();
        }
    }

    struct CollectingObserver {
        values: Mutex<Vec<i64>>,
        completed: AtomicUsize,
    }
    impl SignalObserver<i64> for CollectingObserver {
        fn on_subscribe(&self, _disposable: Arc<dyn Disposable>) {}
        fn on_next(&self, value: i64) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _error: ReactorError) {}
        fn on_complete(&self) {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn map_transforms_every_pushed_value() {
        let source = SignalStream::new(Arc::new(PushAll {
            values: Mutex::new(alloc::vec![1, 2, 3]),
        }));
        let doubled = source.map(|v| v * 2);
        let observer = Arc::new(CollectingObserver {
            values: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        });
        doubled.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![2, 4, 6]);
        assert_eq!(observer.completed.load(Ordering::Acquire), 1);
    }

    #[test]
    fn filter_drops_values_failing_the_predicate() {
        let source = SignalStream::new(Arc::new(PushAll {
            values: Mutex::new(alloc::vec![1, 2, 3, 4, 5]),
        }));
        let evens = source.filter(|v| v % 2 == 0);
        let observer = Arc::new(CollectingObserver {
            values: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        });
        evens.subscribe(observer.clone());
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![2, 4]);
    }

    #[test]
    fn do_on_next_observes_without_altering_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let source = SignalStream::new(Arc::new(PushAll {
            values: Mutex::new(alloc::vec![10, 20]),
        }));
        let tapped = source.do_on_next(move |v| seen_clone.lock().unwrap().push(*v));
        let observer = Arc::new(CollectingObserver {
            values: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        });
        tapped.subscribe(observer.clone());
        assert_eq!(*seen.lock().unwrap(), alloc::vec![10, 20]);
        assert_eq!(*observer.values.lock().unwrap(), alloc::vec![10, 20]);
    }
}
