//! 订阅协议的两套小型虚表（spec §3「Observer/Subscription」、§4.1、§6.3）。
//!
//! - SB（背压）侧：[`FlowObserver`] + [`Subscription`]（`request`/`cancel`）。
//! - SN（非背压）侧：[`SignalObserver`] + [`crate::disposable::Disposable`]（仅 `cancel`）。
//!
//! 两侧都要求实现者 `Send + Sync + 'static`，因为订阅可能被包装进 `Arc<dyn _>` 并
//! 跨线程共享（教师仓库 `Channel: Send + Sync + 'static` 的同一取舍）；所有回调都
//! 以 `&self` 接收，可变状态由实现者自行通过原子量/锁管理，从而让操作符链可以在
//! 不同线程间安全地持有同一个观察者引用。
use alloc::sync::Arc;

use crate::error::ReactorError;

/// SB 侧的订阅句柄。
///
/// 契约（spec §3,§4.1）：
/// - `request(n)` 是累加且饱和的；`n <= 0` 必须在调用点合成协议错误并取消上游，
///   而不是静默忽略（由各 `Subscription` 实现通过 [`crate::request::validate_request_amount`]
///   完成）。
/// - `cancel()` 幂等；取消之后不得再向下游触发任何回调。
pub trait Subscription: Send + Sync {
    fn request(&self, n: i64);
    fn cancel(&self);
}

/// 永不产生任何通知、且 `cancel` 为空操作的订阅，用于已经以其他方式终止的场景
/// （例如在 `on_subscribe` 之后立即发现参数非法）。
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: i64) {}
    fn cancel(&self) {}
}

/// SB 侧观察者：必须先收到且仅收到一次 `on_subscribe`，随后零或多个 `on_next`，
/// 最终至多一个终止通知（`on_error` 异或 `on_complete`）。
pub trait FlowObserver<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, value: T);
    fn on_error(&self, error: ReactorError);
    fn on_complete(&self);
}

/// SN 侧观察者：等价的通知序列，但下游只能 `cancel`，没有 `request`。
pub trait SignalObserver<T>: Send + Sync {
    fn on_subscribe(&self, disposable: Arc<dyn crate::disposable::Disposable>);
    fn on_next(&self, value: T);
    fn on_error(&self, error: ReactorError);
    fn on_complete(&self);
}

/// 重复 `on_subscribe` 时的处理：取消新订阅并上报插件错误槽，保持下游状态不变
/// （spec §4.1 第二条）。
pub fn reject_second_subscription(subscription: &dyn Subscription) {
    subscription.cancel();
    crate::plugins::report_undeliverable(ReactorError::protocol_violation(
        crate::error::codes::SUBSCRIPTION_DOUBLE,
        "on_subscribe called a second time on an already-subscribed observer",
    ));
}
