mod common;
use common::*;

use weft::error::ErrorCode;
use weft::mpmc::{BoundedQueue, GrowableQueue};
use weft::StopSource;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

// --- Helper for async MPMC tests ---
async fn run_async_mpmc_test(
  num_producers: usize,
  num_consumers: usize,
  items_per_producer: usize,
  capacity: usize,
) {
  let queue = Arc::new(BoundedQueue::new(capacity));
  let total_items = num_producers * items_per_producer;
  let received_set = Arc::new(tokio::sync::Mutex::new(HashSet::new()));
  let received_count = Arc::new(AtomicUsize::new(0));

  let mut consumer_handles = Vec::new();
  let per_consumer = total_items / num_consumers;
  for consumer_id in 0..num_consumers {
    let queue = Arc::clone(&queue);
    let received_set = Arc::clone(&received_set);
    let received_count = Arc::clone(&received_count);
    let quota = if consumer_id == num_consumers - 1 {
      total_items - per_consumer * (num_consumers - 1)
    } else {
      per_consumer
    };

    consumer_handles.push(tokio::spawn(async move {
      for _ in 0..quota {
        let item = queue.pop().await.unwrap();
        assert!(received_set.lock().await.insert(item), "duplicate item received");
        received_count.fetch_add(1, AtomicOrdering::Relaxed);
      }
    }));
  }

  let mut producer_handles = Vec::new();
  for producer_id in 0..num_producers {
    let queue = Arc::clone(&queue);
    producer_handles.push(tokio::spawn(async move {
      for i in 0..items_per_producer {
        let item = producer_id * items_per_producer + i;
        queue.push(item).await.unwrap();
      }
    }));
  }

  for handle in producer_handles {
    handle.await.expect("producer task panicked");
  }
  for handle in consumer_handles {
    handle.await.expect("consumer task panicked");
  }

  assert_eq!(received_count.load(AtomicOrdering::Relaxed), total_items);
  assert_eq!(received_set.lock().await.len(), total_items);
  assert!(queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_1p_1c_basic() {
  run_async_mpmc_test(1, 1, ITEMS_HIGH, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_mp_1c_basic() {
  run_async_mpmc_test(4, 1, ITEMS_MEDIUM, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_1p_mc_basic() {
  run_async_mpmc_test(1, 4, ITEMS_HIGH, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_mp_mc_contention() {
  run_async_mpmc_test(4, 4, ITEMS_HIGH, 2).await; // tiny ring, heavy parking
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_push_suspends_until_a_slot_frees() {
  let queue = Arc::new(BoundedQueue::new(1));
  queue.try_push(1).unwrap();

  let pusher = {
    let queue = Arc::clone(&queue);
    tokio::spawn(async move {
      queue.push(2).await.unwrap();
    })
  };

  // The push cannot have completed: the ring has one slot and it is taken.
  tokio::time::sleep(SHORT_TIMEOUT).await;
  assert!(!pusher.is_finished());

  assert_eq!(queue.try_pop().unwrap(), 1);
  pusher.await.unwrap();
  assert_eq!(queue.try_pop().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_pop_suspends_until_a_value_arrives() {
  let queue = Arc::new(BoundedQueue::<u32>::new(4));

  let popper = {
    let queue = Arc::clone(&queue);
    tokio::spawn(async move { queue.pop().await.unwrap() })
  };

  tokio::time::sleep(SHORT_TIMEOUT).await;
  assert!(!popper.is_finished());

  queue.try_push(17).unwrap();
  assert_eq!(popper.await.unwrap(), 17);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_races_value() {
  let queue = Arc::new(BoundedQueue::new(1));
  queue.try_push(1).unwrap();

  let deadline = Instant::now() + SHORT_TIMEOUT;
  assert_eq!(queue.push_until(2, deadline).await, Err(ErrorCode::Timeout));
  assert_eq!(queue.pop_until(deadline).await, Ok(1));

  // The ring is healthy afterwards.
  queue.push(9).await.unwrap();
  assert_eq!(queue.pop().await.unwrap(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pop_until_returns_early_when_a_value_exists() {
  let queue = Arc::new(BoundedQueue::new(4));
  queue.try_push(5).unwrap();
  let started = Instant::now();
  assert_eq!(queue.pop_until(Instant::now() + LONG_TIMEOUT).await, Ok(5));
  assert!(started.elapsed() < LONG_TIMEOUT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn growable_async_round_trip() {
  let queue = Arc::new(GrowableQueue::new(2, 16, 2));

  let consumer = {
    let queue = Arc::clone(&queue);
    tokio::spawn(async move {
      let mut received = HashSet::new();
      for _ in 0..ITEMS_MEDIUM {
        assert!(received.insert(queue.pop().await.unwrap()));
      }
      received
    })
  };

  for i in 0..ITEMS_MEDIUM {
    queue.push(i).await.unwrap();
  }
  let received = consumer.await.unwrap();
  assert_eq!(received.len(), ITEMS_MEDIUM);
}

// --- Detached callback surface ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_push_and_pop_invoke_their_handlers() {
  let queue = Arc::new(BoundedQueue::new(4));
  let (sender, receiver) = std::sync::mpsc::channel();

  let push_done = sender.clone();
  queue.push_detached(42u32, weft::StopToken::never(), move |result| {
    push_done.send(result.map(|()| 0)).unwrap();
  });
  assert_eq!(receiver.recv_timeout(LONG_TIMEOUT).unwrap(), Ok(0));

  queue.pop_detached(weft::StopToken::never(), move |result| {
    sender.send(result).unwrap();
  });
  assert_eq!(receiver.recv_timeout(LONG_TIMEOUT).unwrap(), Ok(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_op_with_stopped_token_reports_canceled() {
  let queue = Arc::new(BoundedQueue::<u32>::new(4));
  let source = StopSource::new();
  source.request_stop();

  let (sender, receiver) = std::sync::mpsc::channel();
  queue.pop_detached(source.token(), move |result| {
    sender.send(result).unwrap();
  });
  assert_eq!(receiver.recv_timeout(LONG_TIMEOUT).unwrap(), Err(ErrorCode::Canceled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_pending_op_is_canceled_by_stop() {
  // An empty queue parks the detached pop; the stop must wake and cancel it.
  let queue = Arc::new(BoundedQueue::<u32>::new(4));
  let source = StopSource::new();

  let (sender, receiver) = std::sync::mpsc::channel();
  queue.pop_detached(source.token(), move |result| {
    sender.send(result).unwrap();
  });
  assert!(receiver.try_recv().is_err(), "pop completed with nothing queued");

  source.request_stop();
  assert_eq!(receiver.recv_timeout(LONG_TIMEOUT).unwrap(), Err(ErrorCode::Canceled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_pop_until_times_out() {
  let queue = Arc::new(BoundedQueue::<u32>::new(4));
  let (sender, receiver) = std::sync::mpsc::channel();
  queue.pop_until_detached(Instant::now() + SHORT_TIMEOUT, weft::StopToken::never(), move |result| {
    sender.send(result).unwrap();
  });
  assert_eq!(receiver.recv_timeout(LONG_TIMEOUT).unwrap(), Err(ErrorCode::Timeout));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_a_pending_future_releases_its_waiter() {
  // Mirrors select-style usage: a pop future is polled once, dropped, and
  // the queue must still deliver to later operations.
  let queue = Arc::new(BoundedQueue::<u32>::new(2));

  {
    let pop = queue.pop();
    tokio::pin!(pop);
    let poll = futures_util::poll!(pop.as_mut());
    assert!(poll.is_pending());
    // Dropped here while armed.
  }

  queue.try_push(3).unwrap();
  assert_eq!(queue.pop().await.unwrap(), 3);
}
