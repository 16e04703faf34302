#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::result_large_err)]
#![doc = "reactor-core：基于推送的响应式流运行时契约。"]
#![doc = ""]
#![doc = "== 内存分配依赖 =="]
#![doc = "本 crate 定位于 `no_std + alloc` 场景：核心契约大量依赖 [`alloc`] 中的"]
#![doc = "`Box`/`Arc`/`Vec` 支撑操作符链的对象安全分发与资源登记。纯 `no_std`（无"]
#![doc = "分配器）环境不受支持；`std` feature 额外开启线程调度器、`arc-swap` 后端"]
#![doc = "与标准错误输出的默认不可投递错误处理器。"]

extern crate alloc;

pub mod arbiter;
pub mod arc_swap;
pub mod config;
pub mod disposable;
pub mod error;
pub mod factories;
pub mod flow;
pub mod future;
pub mod observer;
pub mod operators;
pub mod plugins;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod signal;
pub mod timed;

pub use arbiter::SubscriptionArbiter;
pub use disposable::{CallbackDisposable, CompositeDisposable, Disposable, EmptyDisposable};
pub use error::{ErrorCause, ReactorError, ReactorErrorKind, codes};
pub use flow::{Flow, FlowStream};
pub use future::{BoxFuture, LocalBoxFuture};
pub use observer::{FlowObserver, NoopSubscription, SignalObserver, Subscription};
pub use plugins::{UndeliverableErrorHandler, report_undeliverable, reset_error_handler, set_error_handler};
pub use queue::{BoundedMpscQueue, BoundedSpscQueue};
pub use request::{RequestCounter, validate_request_amount};
pub use scheduler::{ImmediateScheduler, MonotonicTimePoint, Scheduler, Worker};
pub use signal::{Signal, SignalStream};
pub use timed::Timed;

#[cfg(feature = "std")]
pub use scheduler::ThreadScheduler;

#[cfg(any(test, feature = "test-util"))]
pub use scheduler::VirtualScheduler;

pub use factories::{
    defer, empty, error, from_callable, from_iterable, generate, interval, just, never, range, timer,
};
