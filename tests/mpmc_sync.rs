mod common;
use common::*;

use weft::error::{TryPopError, TryPushError};
use weft::mpmc::{BoundedQueue, GrowableQueue};

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

/// N producers and M consumers hammer the queue with `try_` operations; the
/// multiset of popped values must equal the multiset of pushed values.
fn run_sync_mpmc_test(num_producers: usize, num_consumers: usize, items_per_producer: usize, capacity: usize) {
  let queue = Arc::new(BoundedQueue::new(capacity));
  let total_items = num_producers * items_per_producer;

  let mut producer_handles = Vec::new();
  for producer_id in 0..num_producers {
    let queue = Arc::clone(&queue);
    producer_handles.push(thread::spawn(move || {
      for i in 0..items_per_producer {
        let mut item = producer_id * items_per_producer + i;
        loop {
          match queue.try_push(item) {
            Ok(()) => break,
            Err(TryPushError::Full(returned)) => {
              item = returned;
              thread::yield_now();
            }
            Err(other) => panic!("unexpected push error: {:?}", other),
          }
        }
      }
    }));
  }

  let mut consumer_handles = Vec::new();
  let per_consumer = total_items / num_consumers;
  for consumer_id in 0..num_consumers {
    let queue = Arc::clone(&queue);
    // The last consumer also takes the remainder.
    let quota = if consumer_id == num_consumers - 1 {
      total_items - per_consumer * (num_consumers - 1)
    } else {
      per_consumer
    };
    consumer_handles.push(thread::spawn(move || {
      let mut received = Vec::with_capacity(quota);
      while received.len() < quota {
        match queue.try_pop() {
          Ok(item) => received.push(item),
          Err(TryPopError::Empty) => thread::yield_now(),
          Err(other) => panic!("unexpected pop error: {:?}", other),
        }
      }
      received
    }));
  }

  for handle in producer_handles {
    handle.join().expect("producer panicked");
  }
  let mut all_received = HashSet::new();
  for handle in consumer_handles {
    for item in handle.join().expect("consumer panicked") {
      assert!(all_received.insert(item), "duplicate item {}", item);
    }
  }
  assert_eq!(all_received.len(), total_items);
  assert!(queue.is_empty());
  assert_eq!(queue.try_pop(), Err(TryPopError::Empty));
}

#[test]
fn sync_1p_1c() {
  run_sync_mpmc_test(1, 1, ITEMS_HIGH, 16);
}

#[test]
fn sync_mp_1c() {
  run_sync_mpmc_test(4, 1, ITEMS_MEDIUM, 16);
}

#[test]
fn sync_1p_mc() {
  run_sync_mpmc_test(1, 4, ITEMS_HIGH, 16);
}

#[test]
fn sync_mp_mc_contention() {
  run_sync_mpmc_test(4, 4, ITEMS_HIGH, 4);
}

#[test]
fn sync_non_pow2_capacity() {
  run_sync_mpmc_test(2, 2, ITEMS_MEDIUM, 7);
}

#[test]
fn growable_multiset_under_contention() {
  let queue = Arc::new(GrowableQueue::new(4, 64, 2));
  let num_producers = 4;
  let items_per_producer = ITEMS_MEDIUM;
  let total_items = num_producers * items_per_producer;

  let mut handles = Vec::new();
  for producer_id in 0..num_producers {
    let queue = Arc::clone(&queue);
    handles.push(thread::spawn(move || {
      for i in 0..items_per_producer {
        let mut item = producer_id * items_per_producer + i;
        loop {
          match queue.try_push(item) {
            Ok(()) => break,
            Err(TryPushError::Full(returned)) => {
              item = returned;
              thread::yield_now();
            }
            Err(other) => panic!("unexpected push error: {:?}", other),
          }
        }
      }
    }));
  }

  let consumer = {
    let queue = Arc::clone(&queue);
    thread::spawn(move || {
      let mut received = HashSet::new();
      while received.len() < total_items {
        match queue.try_pop() {
          Ok(item) => {
            assert!(received.insert(item), "duplicate item {}", item);
          }
          Err(TryPopError::Empty) => thread::yield_now(),
          Err(other) => panic!("unexpected pop error: {:?}", other),
        }
      }
      received
    })
  };

  for handle in handles {
    handle.join().unwrap();
  }
  let received = consumer.join().unwrap();
  assert_eq!(received.len(), total_items);
  assert!(queue.approximate_depth() <= queue.max_capacity());
  assert!(queue.is_empty());
}
