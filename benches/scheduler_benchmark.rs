use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use pixel_saturn_rust::cdb::{Cdb, MemoryDisc};
use pixel_saturn_rust::scheduler::{EventQueue, Timestamp, Unit, UnitDispatch, UnitId};

/// Unités factices à pas fixes
struct Fixed;

impl UnitDispatch for Fixed {
    fn dispatch(&mut self, unit: UnitId, timestamp: Timestamp) -> Timestamp {
        match unit {
            UnitId::Cdb => timestamp + 37,
            UnitId::Vdp2 => timestamp + 1820,
        }
    }
}

fn benchmark_event_queue(c: &mut Criterion) {
    c.bench_function("event_queue_one_frame", |b| {
        b.iter(|| {
            let mut queue = EventQueue::new();
            queue.advance_to(black_box(1820 * 263), &mut Fixed)
        })
    });

    c.bench_function("event_queue_reschedule", |b| {
        let mut queue = EventQueue::new();
        let mut ts = 0;
        b.iter(|| {
            ts = (ts + 7) % 100_000;
            queue.schedule(UnitId::Cdb, black_box(ts));
            queue.schedule(UnitId::Vdp2, black_box(100_000 - ts));
        })
    });
}

fn benchmark_cdb_update(c: &mut Criterion) {
    c.bench_function("cdb_power_on_and_spin_up", |b| {
        b.iter(|| {
            let mut cdb = Cdb::default();
            cdb.set_disc(false, Some(Arc::new(MemoryDisc::data_disc(64))));

            let mut ts: Timestamp = 0;
            while ts < 60_000_000 {
                ts = cdb.update(ts).max(ts + 1);
            }
            black_box(cdb.hirq())
        })
    });
}

criterion_group!(benches, benchmark_event_queue, benchmark_cdb_update);
criterion_main!(benches);
