// benches/channel.rs

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use weft::channel::Channel;

const BATCH: u64 = 1024;

fn bench_channel_try_ops(c: &mut Criterion) {
  let mut group = c.benchmark_group("channel_try_ops");
  group.throughput(Throughput::Elements(BATCH));

  group.bench_function("push_pop_cycle", |b| {
    let channel = Channel::new(128);
    b.iter(|| {
      for i in 0..BATCH {
        channel.try_push(i).unwrap();
        std::hint::black_box(channel.try_pop().unwrap());
      }
    });
  });

  group.finish();
}

fn bench_channel_close(c: &mut Criterion) {
  c.bench_function("channel_close", |b| {
    b.iter(|| {
      let channel = Channel::<u64>::new(16);
      std::hint::black_box(channel.close());
    });
  });
}

criterion_group!(benches, bench_channel_try_ops, bench_channel_close);
criterion_main!(benches);
