//! 进程级插件错误槽（spec §6.5,§9「全局状态」）。
//!
//! # 设计背景（Why）
//! - 当错误已无法投递给下游（已取消/已终止之后到达）时，丢弃它会让问题静默消失；
//!   教师仓库对所有“仅一次、启动时设置”的全局能力都采用 `ArcSwap<Arc<dyn T>>`
//!   而非 `lazy_static!`/`OnceCell` 宏，这里沿用同一模式。
//! - 默认实现把不可投递错误打印到标准错误（`std` 下）或直接丢弃（`no_std` 下），
//!   与 spec §7「default sink 打印到标准错误」一致。
//!
//! # 契约说明（What）
//! - [`set_error_handler`] 在进程启动时调用一次，可重复调用以整体替换（例如测试中
//!   安装捕获型 sink）；[`report_undeliverable`] 是框架内部各操作符的统一入口。
use alloc::sync::Arc;

use crate::arc_swap::ArcSwapSlot;
use crate::error::ReactorError;

/// 不可投递错误的处理器契约。
pub trait UndeliverableErrorHandler: Send + Sync + 'static {
    fn on_undeliverable_error(&self, error: ReactorError);
}

struct DefaultHandler;

impl UndeliverableErrorHandler for DefaultHandler {
    fn on_undeliverable_error(&self, error: ReactorError) {
        #[cfg(feature = "std")]
        {
            eprintln!("reactor-core: undeliverable error: {error}");
        }
        #[cfg(not(feature = "std"))]
        {
            let _ = error;
        }
    }
}

static HANDLER: ArcSwapSlot<dyn UndeliverableErrorHandler> = ArcSwapSlot::empty();

fn default_handler() -> Arc<dyn UndeliverableErrorHandler> {
    Arc::new(DefaultHandler)
}

/// 设置（或替换）全局不可投递错误处理器。
pub fn set_error_handler(handler: Arc<dyn UndeliverableErrorHandler>) {
    HANDLER.store(handler);
}

/// 恢复默认处理器（打印到标准错误 / 丢弃）。
pub fn reset_error_handler() {
    HANDLER.store(default_handler());
}

/// 报告一个无法投递给任何下游的错误：已取消之后到达的上游错误、`dispose` 路径中
/// 发生的次生异常等（spec 不变式 2）。
pub fn report_undeliverable(error: ReactorError) {
    tracing::error!(
        target: "reactor_core::plugins",
        code = error.code(),
        kind = ?error.kind(),
        "undeliverable error reported to the global plugin sink: {error}"
    );
    HANDLER.load_or_init(default_handler).on_undeliverable_error(error);
}
