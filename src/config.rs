//! 操作符默认调优参数（spec §6.2，SPEC_FULL §10.3）。
//!
//! # 设计背景（Why）
//! - 背压相关的可调参数（缓冲区大小、预取量、最大并发度）都作为操作符构造函数的显式
//!   参数传入，而不是走一个全局配置层——这里只是把各处重复出现的"没有显式指定时
//!   用什么值"集中到一处常量，供调用方在不确定合适取值时直接引用，类似教师仓库
//!   `limits::ResourceKind::default_limit` 给每类资源一个集中维护的缺省值。
/// `observe_on`/`merge`/`zip` 等操作符在未显式指定缓冲区大小时使用的默认值。
pub const DEFAULT_BUFFER_SIZE: usize = 128;

/// `concatMap`/`flatMap` 未显式指定预取量时使用的默认值。
pub const DEFAULT_PREFETCH: usize = 128;

/// `merge`/`flatMap` 未显式指定最大并发度时使用的默认值；`0` 按既有约定表示不设上限。
pub const DEFAULT_MAX_CONCURRENCY: usize = 0;
