use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use pagedtopic::{BatchingOperationsQueue, OnErrorAction, TriggerState};

/// Doubles every value, one batch at a time, on spawned tasks.
struct Doubler {
    queue: BatchingOperationsQueue<u64, u64>,
    in_batch: AtomicUsize,
    max_in_batch: AtomicUsize,
    batches: AtomicUsize,
}

impl Doubler {
    fn new(max_batch: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Doubler>| {
            let weak = weak.clone();
            Doubler {
                queue: BatchingOperationsQueue::new(max_batch, move |_| {
                    if let Some(doubler) = weak.upgrade() {
                        tokio::spawn(doubler.drain());
                    }
                }),
                in_batch: AtomicUsize::new(0),
                max_in_batch: AtomicUsize::new(0),
                batches: AtomicUsize::new(0),
            }
        })
    }

    async fn drain(self: Arc<Self>) {
        while self.queue.fill_current_batch(16) {
            let now = self.in_batch.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_batch.fetch_max(now, Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);

            let values = self.queue.get_current_batch_values();
            tokio::task::yield_now().await;
            self.queue
                .complete_elements(values.into_iter().map(|v| Ok(v * 2)).collect());

            self.in_batch.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_share_one_consumer() {
    let doubler = Doubler::new(16);

    let mut producers = Vec::new();
    for producer in 0..8u64 {
        let doubler = Arc::clone(&doubler);
        producers.push(tokio::spawn(async move {
            for i in 0..100u64 {
                let value = producer * 1000 + i;
                let doubled = doubler.queue.add(value).unwrap().await.unwrap();
                assert_eq!(doubled, value * 2);
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(producers))
        .await
        .expect("producers finished")
        .into_iter()
        .for_each(|r| r.unwrap());

    assert_eq!(doubler.max_in_batch.load(Ordering::SeqCst), 1);
    assert_eq!(doubler.queue.backlog(), 0);
    assert!(doubler.batches.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn flush_covers_everything_submitted_before_it() {
    let doubler = Doubler::new(4);
    let completions: Vec<_> = (0..10).map(|v| doubler.queue.add(v).unwrap()).collect();

    tokio::time::timeout(Duration::from_secs(5), doubler.queue.flush())
        .await
        .expect("flush finished");
    assert!(completions.iter().all(|c| c.is_done()));
    assert!(doubler.queue.is_batch_complete());
}

#[tokio::test]
async fn retry_keeps_submission_order() {
    // No consumer: the test drives the queue by hand.
    let queue: BatchingOperationsQueue<u64, u64> = BatchingOperationsQueue::new(4, |_| {});
    let completions: Vec<_> = (0..4).map(|v| queue.add(v).unwrap()).collect();

    assert!(queue.fill_current_batch(2));
    queue.handle_error(pagedtopic::Error::Batch("transient".into()), Some(OnErrorAction::Retry));
    assert_eq!(queue.trigger_state(), TriggerState::Closed);

    assert!(queue.fill_current_batch(10));
    let values = queue.get_current_batch_values();
    assert_eq!(values, vec![0, 1, 2, 3]);
    queue.complete_elements(values.iter().map(|v| Ok(v + 100)).collect());

    for (i, completion) in completions.into_iter().enumerate() {
        assert_eq!(completion.await.unwrap(), i as u64 + 100);
    }
}
