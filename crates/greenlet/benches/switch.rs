use criterion::{black_box, criterion_group, criterion_main, Criterion};
use greenlet::{getcurrent, Args, Greenlet};
use std::time::Duration;

fn bench_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("switch");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("self_switch", |b| {
        let me = getcurrent().unwrap();
        b.iter(|| me.switch(black_box(Args::new())).unwrap());
    });

    // One round trip: main -> greenlet -> main.
    group.bench_function("ping_pong", |b| {
        let main = getcurrent().unwrap();
        let echo = Greenlet::new(move |mut args| loop {
            args = main.switch(args)?;
        })
        .unwrap();
        b.iter(|| echo.switch(black_box(Args::new().arg(1i64))).unwrap());
    });

    group.bench_function("spawn_and_finish", |b| {
        b.iter(|| {
            let g = Greenlet::new(|args| Ok(args)).unwrap();
            g.switch(black_box(Args::new())).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_switch);
criterion_main!(benches);
