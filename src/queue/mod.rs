//! 有界队列（spec §2「Bounded queues」、§4.8、§4.9）。
//!
//! 每个跨线程操作符（`observe_on`、`merge`、`publish`、`zip` 的每源队列等）都需要
//! 一个"单生产者单消费者"或"多生产者单消费者"的有界队列。两者都采用 Dmitry
//! Vyukov 风格的有界环形队列算法（每个槽位自带序列号，生产/消费各自占用 CAS 一次），
//! 这是业界对“有界、无锁、不依赖 GC”的标准解法，且不需要额外的第三方队列 crate。
pub mod mpsc;
pub mod spsc;

pub use mpsc::BoundedMpscQueue;
pub use spsc::BoundedSpscQueue;
