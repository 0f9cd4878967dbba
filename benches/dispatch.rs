use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use simcard::{
    translate, GatewayConfig, InMemoryGateway, NativeStatus, Sim, SimGateway, SimState,
    StateCallback, UserData,
};

fn make_sim(queue_capacity: usize) -> (Arc<InMemoryGateway>, Sim) {
    let cfg = GatewayConfig {
        notification_queue_capacity: queue_capacity,
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(InMemoryGateway::new(&cfg, simcard::CardProfile::default()));
    let sim = Sim::new(Arc::clone(&gateway) as Arc<dyn SimGateway>);
    (gateway, sim)
}

fn bench_translate(c: &mut Criterion) {
    let codes: Vec<NativeStatus> = (0..=u8::MAX).map(NativeStatus::from_code).collect();

    let mut group = c.benchmark_group("translate");
    group.throughput(Throughput::Elements(codes.len() as u64));
    group.bench_function("all_codes", |b| {
        b.iter(|| {
            for status in &codes {
                black_box(translate(*status));
            }
        });
    });
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    // Alternating states so every event reaches the callback.
    group.bench_function("state_change", |b| {
        b.iter_custom(|iters| {
            let (gateway, sim) = make_sim(4096);
            let fired = Arc::new(AtomicU64::new(0));
            let cb_fired = Arc::clone(&fired);
            let callback: StateCallback = Arc::new(move |_: SimState, _: &UserData| {
                cb_fired.fetch_add(1, Ordering::Relaxed);
            });
            sim.subscribe(Some(callback), Arc::new(())).unwrap();

            let start = Instant::now();
            for i in 0..iters {
                let status = if i % 2 == 0 {
                    NativeStatus::SimPinRequired
                } else {
                    NativeStatus::SimInitCompleted
                };
                gateway.inject_event(status);
                if i % 1024 == 1023 {
                    gateway.flush().unwrap();
                }
            }
            gateway.flush().unwrap();
            let elapsed = start.elapsed();

            sim.unsubscribe().unwrap();
            black_box(fired.load(Ordering::Relaxed));
            elapsed
        });
    });

    // Repeated identical states are filtered before the callback.
    group.bench_function("duplicate_suppressed", |b| {
        b.iter_custom(|iters| {
            let (gateway, sim) = make_sim(4096);
            let callback: StateCallback = Arc::new(|_: SimState, _: &UserData| {});
            sim.subscribe(Some(callback), Arc::new(())).unwrap();

            let start = Instant::now();
            for i in 0..iters {
                gateway.inject_event(NativeStatus::SimInitCompleted);
                if i % 1024 == 1023 {
                    gateway.flush().unwrap();
                }
            }
            gateway.flush().unwrap();
            let elapsed = start.elapsed();

            sim.unsubscribe().unwrap();
            elapsed
        });
    });

    group.finish();
}

fn bench_field_read(c: &mut Criterion) {
    let (_gateway, sim) = make_sim(1024);
    c.bench_function("field/get_icc_id", |b| {
        b.iter(|| black_box(sim.get_icc_id().unwrap()));
    });
    c.bench_function("field/get_state", |b| {
        b.iter(|| black_box(sim.get_state().unwrap()));
    });
}

criterion_group!(dispatch, bench_translate, bench_dispatch, bench_field_read);
criterion_main!(dispatch);
