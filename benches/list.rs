use criterion::{black_box, criterion_group, criterion_main, Criterion};

use railyard::{Attachment, Event, EventList, Priority, WaitMode};

fn batch(n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| {
            let mut ev = Event::new(i as i32, 64, 1);
            if i % 4 == 0 {
                ev.set_priority(Priority::High);
            }
            ev
        })
        .collect()
}

fn bench_put_drain(c: &mut Criterion) {
    let list = EventList::new();
    c.bench_function("list_put_drain_64", |b| {
        b.iter(|| {
            list.put(batch(64));
            black_box(list.drain_all());
        })
    });
}

fn bench_put_all_merge(c: &mut Criterion) {
    let list = EventList::new();
    c.bench_function("list_put_all_merge_64", |b| {
        b.iter(|| {
            // conductor batches arrive pre-sorted, highs first
            let mut events = batch(64);
            events.sort_by_key(|ev| ev.priority() != Priority::High);
            list.put_all(events);
            black_box(list.drain_all());
        })
    });
}

fn bench_get_async(c: &mut Criterion) {
    let list = EventList::new();
    let att = Attachment::new(1, 1, "bench".into(), -1);
    c.bench_function("list_get_async_64", |b| {
        b.iter(|| {
            list.put(batch(64));
            let taken = list
                .get(&att, WaitMode::Async, 64)
                .expect("list was just filled");
            black_box(taken);
        })
    });
}

criterion_group!(benches, bench_put_drain, bench_put_all_merge, bench_get_async);
criterion_main!(benches);
