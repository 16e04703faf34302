use criterion::{Criterion, black_box};
use reactor_core::RequestCounter;
use std::{env, time::Duration};

/// 对 [`RequestCounter`] 的 `add`/`produced` CAS 循环做往返成本基准测试。
///
/// # 设计背景（Why）
/// - 每个背压操作符的 `Subscription::request`/`produced` 都落在这一个共享计数器上，
///   它的 CAS 往返成本直接决定了高吞吐场景下的上限，因此单独度量。
///
/// # 逻辑解析（How）
/// - 基准循环执行：`add(n)` 累积需求，随后分批 `produced` 消费掉同等数量，
///   模拟上游持续发射、下游持续消费的稳态。
fn bench_request_accounting(c: &mut Criterion) {
    c.bench_function("request_accounting_add_produced", |b| {
        b.iter(|| {
            let counter = RequestCounter::new();
            for _ in 0..64 {
                counter.add(black_box(8));
            }
            for _ in 0..64 {
                counter.produced(black_box(8));
            }
            black_box(counter.current())
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

    bench_request_accounting(&mut criterion);
    criterion.final_summary();
}
