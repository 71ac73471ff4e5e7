// benches/mpmc.rs

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

use weft::mpmc::{BoundedQueue, GrowableQueue};

const BATCH: u64 = 1024;

fn bench_bounded_single_thread(c: &mut Criterion) {
  let mut group = c.benchmark_group("bounded_single_thread");
  group.throughput(Throughput::Elements(BATCH));

  group.bench_function("push_pop_cycle", |b| {
    let queue = BoundedQueue::new(128);
    b.iter(|| {
      for i in 0..BATCH {
        queue.try_push(i).unwrap();
        std::hint::black_box(queue.try_pop().unwrap());
      }
    });
  });

  group.bench_function("fill_then_drain", |b| {
    let queue = BoundedQueue::new(BATCH as usize);
    b.iter(|| {
      for i in 0..BATCH {
        queue.try_push(i).unwrap();
      }
      for _ in 0..BATCH {
        std::hint::black_box(queue.try_pop().unwrap());
      }
    });
  });

  group.finish();
}

fn bench_growable_single_thread(c: &mut Criterion) {
  let mut group = c.benchmark_group("growable_single_thread");
  group.throughput(Throughput::Elements(BATCH));

  group.bench_function("push_pop_cycle", |b| {
    let queue = GrowableQueue::new(128, 1024, 2);
    b.iter(|| {
      for i in 0..BATCH {
        queue.try_push(i).unwrap();
        std::hint::black_box(queue.try_pop().unwrap());
      }
    });
  });

  group.finish();
}

fn bench_bounded_threaded(c: &mut Criterion) {
  let mut group = c.benchmark_group("bounded_threaded");
  group.throughput(Throughput::Elements(BATCH * 4));
  group.sample_size(20);

  group.bench_function("2p_2c_spin", |b| {
    b.iter(|| {
      let queue = Arc::new(BoundedQueue::new(64));
      let per_producer = BATCH * 2;

      let producers: Vec<_> = (0..2)
        .map(|_| {
          let queue = Arc::clone(&queue);
          thread::spawn(move || {
            for i in 0..per_producer {
              let mut item = i;
              loop {
                match queue.try_push(item) {
                  Ok(()) => break,
                  Err(err) => {
                    item = err.into_inner();
                    std::hint::spin_loop();
                  }
                }
              }
            }
          })
        })
        .collect();

      let consumers: Vec<_> = (0..2)
        .map(|_| {
          let queue = Arc::clone(&queue);
          thread::spawn(move || {
            let mut seen = 0;
            while seen < per_producer {
              if queue.try_pop().is_ok() {
                seen += 1;
              } else {
                std::hint::spin_loop();
              }
            }
          })
        })
        .collect();

      for handle in producers {
        handle.join().unwrap();
      }
      for handle in consumers {
        handle.join().unwrap();
      }
    });
  });

  group.finish();
}

criterion_group!(
  benches,
  bench_bounded_single_thread,
  bench_growable_single_thread,
  bench_bounded_threaded
);
criterion_main!(benches);
