//! 操作符集合（spec §4.7-§4.12、§11）。
//!
//! 每个子模块都以 `impl<T> FlowStream<T> { ... }`（或 `SignalStream<T>`）追加方法的
//! 形式提供操作符，而不是自由函数——与教师仓库 `pipeline::ChainBuilder` 把每一步
//! 都表达成对构建器的方法调用是同一种编排方式。
pub mod amb;
pub mod buffer;
pub mod combine_latest;
pub mod concat_map;
pub mod group_by;
pub mod merge;
pub mod observe_on;
pub mod publish;
pub mod replay;
pub mod retry;
pub mod signal_ops;
pub mod simple;
pub mod switch_map;
pub mod time_ops;
pub mod window;
pub mod zip;
