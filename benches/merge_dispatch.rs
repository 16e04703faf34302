use criterion::{Criterion, black_box};
use reactor_core::error::ReactorError;
use reactor_core::observer::{FlowObserver, Subscription};
use reactor_core::operators::merge::merge_streams;
use reactor_core::{FlowStream, factories};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{env, time::Duration};

/// 对 `merge_streams` 的并发分发路径（drain loop + `wip` 计数器）做吞吐基准测试。
///
/// # 设计背景（Why）
/// - `merge`/`flat_map` 的 drain loop 是本 crate 里被复用次数最多的并发原语
///   （`switch_map`/`zip`/`observe_on` 等都衍生自同一个 `wip` 计数器思路），
///   因此单独量化它在多路内层流下的分发开销。
///
/// # 逻辑解析（How）
/// - 构造若干个 `just([...])` 冷流作为内层来源，`merge_streams` 不设并发上限，
///   用一个只计数、立刻索取 `i64::MAX` 需求的观察者订阅，衡量全部值投递完成的成本。
fn bench_merge_dispatch(c: &mut Criterion) {
    c.bench_function("merge_dispatch_16_sources", |b| {
        b.iter(|| {
            let sources: Vec<FlowStream<u64>> = (0..16)
                .map(|_| factories::just((0..64).collect()))
                .collect();
            let merged = merge_streams(sources, 0, false);
            let observer = Arc::new(CountingObserver::default());
            merged.subscribe(observer.clone());
            black_box(observer.count.load(Ordering::Acquire))
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_merge_dispatch(&mut criterion);
    criterion.final_summary();
}

#[derive(Default)]
struct CountingObserver {
    count: AtomicU64,
}
impl FlowObserver<u64> for CountingObserver {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(i64::MAX);
    }
    fn on_next(&self, _value: u64) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }
    fn on_error(&self, _error: ReactorError) {}
    fn on_complete(&self) {}
}
