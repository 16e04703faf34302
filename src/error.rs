//! 统一错误域。
//!
//! # 设计背景（Why）
//! - 下游操作符需要在“可恢复的源错误”“协议违规”“背压溢出”“超时”之间做出不同响应
//!   （参见 spec §7），因此不能用一个裸的 `String` 或 `Box<dyn Error>` 了事。
//! - 延续教师仓库 `SparkError` 的做法：稳定错误码 + 人类可读消息 + 可选因果链，
//!   在 `no_std + alloc` 下同样可用。
//!
//! # 契约说明（What）
//! - [`ReactorError`] 是跨越整个 crate 传播的错误类型；[`ReactorErrorKind`] 区分
//!   协议违规、背压溢出、超时、用户函数异常等分类，供操作符决定传播还是本地恢复。
//! - [`codes`] 收录稳定字符串码，便于日志/测试按码匹配。
//! - [`TimeoutError`]、[`MissingBackpressureError`]、[`ArbiterError`] 是三组不打算
//!   再长出新字符串码的封闭错误集合，用 `thiserror` 派生 `Display`（在 `std` 下同时
//!   派生 `Error`），与教师仓库 `spark-switch::error::SwitchError` 对 `#[derive(Error)]`
//!   按 `std` 特性开关的做法一致；它们作为 [`ReactorError::cause`] 挂在对应构造器上，
//!   而不是取代 `ReactorError` 本身——后者仍然是跨操作符传播的统一载体。
use alloc::{boxed::Box, string::String, vec::Vec};
use core::fmt;

#[cfg(feature = "std")]
use thiserror::Error;

/// 错误原因的类型擦除包装，要求 `Send + Sync + 'static` 以便跨线程传播。
pub type ErrorCause = Box<dyn core::error::Error + Send + Sync + 'static>;

/// 错误分类，供操作符决定传播、恢复或转发到插件错误槽。
///
/// 对应 spec §7 的错误分类表：源错误原样转发；协议违规在违规处合成；
/// 背压溢出视为源错误的一种特化；超时是独立分类，便于 `timeout`/`retryWhen`
/// 识别并决定是否切换到 fallback。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReactorErrorKind {
    /// 上游或用户函数产生的普通错误，原样转发。
    Source,
    /// 协议违规：重复 `on_subscribe`、非正数 `request(n)`、mapper 返回 null 等。
    ProtocolViolation,
    /// 背压溢出：`onBackpressureError` 策略下队列容量耗尽。
    MissingBackpressure,
    /// 超时：`timeout`/`debounce` 等时间操作符的计时器到期。
    Timeout,
    /// 多个错误聚合（`delayError` 路径、`onErrorResumeNext` 回退同样失败）。
    Composite,
}

/// `reactor-core` 统一错误类型。
///
/// 构造方式是 builder 风格的链式方法（`with_cause`），与教师仓库的
/// `SparkError::with_cause`/`with_trace` 一致，保证可以在 `no_std` 下运行而不依赖
/// `std::error::Error` 的动态分发开销。
#[derive(Debug)]
pub struct ReactorError {
    code: &'static str,
    kind: ReactorErrorKind,
    message: String,
    cause: Option<ErrorCause>,
    composite: Vec<ReactorError>,
}

impl ReactorError {
    /// 使用稳定错误码与分类构造错误。
    pub fn new(code: &'static str, kind: ReactorErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            cause: None,
            composite: Vec::new(),
        }
    }

    /// 协议违规的便捷构造：非正数 `request(n)`、重复订阅等。
    pub fn protocol_violation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ReactorErrorKind::ProtocolViolation, message)
    }

    /// 背压溢出（`MissingBackpressure`）的便捷构造，`reason` 取自封闭枚举
    /// [`MissingBackpressureError`]，其 `Display` 输出同时作为 `message` 与
    /// `cause`。
    pub fn missing_backpressure(reason: MissingBackpressureError) -> Self {
        Self::new(
            codes::BACKPRESSURE_MISSING,
            ReactorErrorKind::MissingBackpressure,
            alloc::format!("{reason}"),
        )
        .with_cause(reason)
    }

    /// 超时错误的便捷构造，`reason` 取自封闭枚举 [`TimeoutError`]。
    pub fn timeout(reason: TimeoutError) -> Self {
        Self::new(codes::TIME_TIMEOUT, ReactorErrorKind::Timeout, alloc::format!("{reason}")).with_cause(reason)
    }

    /// 仲裁者在已取消之后收到迟到的上游订阅（`SubscriptionArbiter::set_subscription`）
    /// 时的便捷构造，`reason` 取自封闭枚举 [`ArbiterError`]。
    pub fn arbiter_cancelled(reason: ArbiterError) -> Self {
        Self::new(codes::ARBITER_CANCELLED, ReactorErrorKind::ProtocolViolation, alloc::format!("{reason}"))
            .with_cause(reason)
    }

    /// 将多个错误聚合为一个复合错误（`delayError` 路径）。
    ///
    /// 若只有一个元素，直接返回该元素本身而不做包装，避免无意义的嵌套。
    pub fn composite(mut errors: Vec<ReactorError>) -> Self {
        if errors.len() == 1 {
            return errors.pop().unwrap();
        }
        let message = alloc::format!("{} errors occurred", errors.len());
        Self {
            code: codes::COMPOSITE,
            kind: ReactorErrorKind::Composite,
            message,
            cause: None,
            composite: errors,
        }
    }

    pub fn with_cause(mut self, cause: impl core::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn kind(&self) -> ReactorErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 若为复合错误，返回其成员列表；否则返回空切片。
    pub fn composite_errors(&self) -> &[ReactorError] {
        &self.composite
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ReactorErrorKind::Timeout)
    }

    pub fn is_missing_backpressure(&self) -> bool {
        matches!(self.kind, ReactorErrorKind::MissingBackpressure)
    }
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.composite.is_empty() {
            write!(f, " ({} causes)", self.composite.len())?;
        }
        Ok(())
    }
}

impl core::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn core::error::Error + 'static))
    }
}

/// 稳定错误码常量，遵循 `domain.reason` 命名，与教师仓库的 `error::codes` 同构。
pub mod codes {
    pub const SUBSCRIPTION_DOUBLE: &str = "subscription.double_subscribe";
    pub const SUBSCRIPTION_NON_POSITIVE_REQUEST: &str = "subscription.non_positive_request";
    pub const MAPPER_NULL_RESULT: &str = "mapper.null_result";
    pub const MAPPER_THREW: &str = "mapper.threw";
    pub const BACKPRESSURE_MISSING: &str = "backpressure.missing";
    pub const TIME_TIMEOUT: &str = "time.timeout";
    pub const ARBITER_CANCELLED: &str = "arbiter.cancelled";
    pub const COMPOSITE: &str = "composite";
    pub const SCHEDULER_TASK_PANICKED: &str = "scheduler.task_panicked";
}

/// `timeout`（spec §4.11）产生的封闭超时原因集合。
///
/// 与需要不断长出新字符串码的 [`ReactorErrorKind::Source`] 传播路径不同，`timeout`
/// 只有两种互斥的失败方式，枚举在这里是封闭的（不带 `#[non_exhaustive]`）。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutError {
    /// 上游在超时窗口内没有发射任何值，调用方也没有配置 `fallback`。
    #[cfg_attr(
        feature = "std",
        error("no value or fallback arrived before the timeout elapsed")
    )]
    NoFallback,
    /// 已经切换到 `fallback` 流，但 `fallback` 自己也没能在超时窗口内发射值。
    #[cfg_attr(
        feature = "std",
        error("fallback stream did not produce a value before the timeout elapsed")
    )]
    FallbackTimedOut,
}

#[cfg(not(feature = "std"))]
impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutError::NoFallback => "no value or fallback arrived before the timeout elapsed",
            TimeoutError::FallbackTimedOut => {
                "fallback stream did not produce a value before the timeout elapsed"
            }
        })
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for TimeoutError {}

/// `MissingBackpressure`（spec §4.7,§4.11）产生的封闭溢出原因集合，区分三类结构上
/// 不同的"下游没有请求量却有新值到达"的情形。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingBackpressureError {
    /// `observe_on` 的环形队列已满：上游发射的值超过了已转发的请求量。
    #[cfg_attr(
        feature = "std",
        error("observe_on received a value with no queue capacity and no outstanding request")
    )]
    ObserveOnQueueFull,
    /// `onBackpressureError` 桥接：下游请求量为零时源头仍发射了值。
    #[cfg_attr(
        feature = "std",
        error("onBackpressureError: a value arrived with zero outstanding downstream demand")
    )]
    BridgeOverflow,
    /// `debounce`/`throttle_first`/`sample` 等计时驱动的发射：定时器触发时下游
    /// 请求量为零。
    #[cfg_attr(
        feature = "std",
        error("timed emission arrived with no outstanding downstream request")
    )]
    TimedEmissionOverflow,
}

#[cfg(not(feature = "std"))]
impl fmt::Display for MissingBackpressureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MissingBackpressureError::ObserveOnQueueFull => {
                "observe_on received a value with no queue capacity and no outstanding request"
            }
            MissingBackpressureError::BridgeOverflow => {
                "onBackpressureError: a value arrived with zero outstanding downstream demand"
            }
            MissingBackpressureError::TimedEmissionOverflow => {
                "timed emission arrived with no outstanding downstream request"
            }
        })
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for MissingBackpressureError {}

/// [`crate::arbiter::SubscriptionArbiter`] 产生的封闭错误集合。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbiterError {
    /// 仲裁者已经取消之后，又收到一个新的上游订阅（`retry`/`switchMap` 等在竞态下
    /// 替换当前上游时可能发生）；新订阅会被立即取消，这里只负责让调用方据此上报。
    #[cfg_attr(
        feature = "std",
        error("a subscription was attached to an already-cancelled arbiter")
    )]
    AlreadyCancelled,
}

#[cfg(not(feature = "std"))]
impl fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a subscription was attached to an already-cancelled arbiter")
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for ArbiterError {}
