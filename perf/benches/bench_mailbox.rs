use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use strata_mbox::{Arena, ComponentId, MailboxSet, MboxError, Mid, SendMode};
use strata_perf::{bench_config, cleanup};

const SENDER: ComponentId = ComponentId(48);
const OWNER: ComponentId = ComponentId(7);

fn bench_send_receive(c: &mut Criterion) {
    let arena = Arena::create_all(&bench_config("send_recv")).expect("create arena");
    arena.create_mailbox(OWNER, OWNER, 64, 128).expect("mailbox");
    let mid = Mid::local(SENDER);
    let payload = [0x42u8; 64];
    let mut out = [0u8; 128];

    let mut group = c.benchmark_group("mailbox");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send+receive (same thread)", |b| {
        b.iter(|| {
            arena
                .send(SENDER, OWNER, SendMode::NonBlocking, &mid, &[black_box(&payload[..])])
                .expect("send");
            black_box(arena.receive(OWNER, &mut out).expect("receive"));
        });
    });

    group.bench_function("receive (empty)", |b| {
        b.iter(|| black_box(arena.receive(OWNER, &mut out).expect("receive")));
    });

    group.finish();
    // receives posted the owner's semaphore; nobody drains it here
    arena.delete_all().expect("delete arena");
}

fn bench_cross_thread(c: &mut Criterion) {
    let arena = Arena::create_all(&bench_config("cross_thread")).expect("create arena");
    arena.create_mailbox(OWNER, OWNER, 16, 64).expect("mailbox");
    let mut set = MailboxSet::new(OWNER);
    set.add(OWNER);

    let mut group = c.benchmark_group("mailbox");
    group.throughput(Throughput::Elements(1));

    group.bench_function("blocking send -> wait_one -> receive", |b| {
        b.iter_custom(|iters| {
            let done = AtomicBool::new(false);
            std::thread::scope(|s| {
                s.spawn(|| {
                    let mid = Mid::local(SENDER);
                    for i in 0..iters {
                        arena
                            .send(SENDER, OWNER, SendMode::Blocking, &mid, &[&i.to_le_bytes()])
                            .expect("send");
                    }
                    done.store(true, Ordering::Release);
                });

                let start = Instant::now();
                let mut out = [0u8; 64];
                let mut received = 0u64;
                while received < iters {
                    match arena.wait_one(OWNER, &set, Some(Duration::from_millis(10))) {
                        Ok(()) | Err(MboxError::TimedOut) => {}
                        Err(e) => panic!("wait failed: {e}"),
                    }
                    while arena.receive(OWNER, &mut out).expect("receive").is_some() {
                        received += 1;
                    }
                }
                let elapsed = start.elapsed();
                while !done.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                elapsed
            })
        });
    });

    group.finish();
    arena.delete_all().expect("delete arena");
    cleanup();
}

criterion_group!(benches, bench_send_receive, bench_cross_thread);
criterion_main!(benches);
