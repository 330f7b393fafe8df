//! # Partition Actors
//!
//! Each partition's [`PartitionEngine`] lives on its own OS thread, the only
//! owner of its SQLite connection and its in-memory records. Async callers
//! talk to it over a channel and await a oneshot reply:
//!
//! ```text
//!  async tasks                         dedicated thread per partition
//!  ┌────────┐                          ┌──────────────────────────────┐
//!  │ offer  │─┐                        │  current_thread runtime      │
//!  │ poll   │─┼─ mpsc ────────────────►│  select! {                   │
//!  │ commit │─┘  PartitionRequest      │    request  => engine.step   │
//!  └────────┘◄──────── oneshot ────────│    sweep tick => expire      │
//!                                      │  }                           │
//!                                      └──────────────────────────────┘
//! ```
//!
//! Requests are executed strictly in arrival order, one step at a time,
//! which is what makes every engine operation serially ordered per
//! partition without any locking.
//!
//! ## Rust Concepts
//!
//! - **`Box<dyn FnOnce(&mut PartitionEngine) + Send>`**: control-plane
//!   operations are shipped to the actor as closures, so adding an engine
//!   operation does not need a new request variant.
//! - **`tokio::select!`**: the actor waits on its inbox and on the
//!   notification sweep timer at the same time.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::partition::{OfferResult, PartitionEngine, PollRequest, PollResult};
use crate::types::{ChannelId, NotifierId, PageId, PartitionId};

// =============================================================================
// Configuration
// =============================================================================

/// Size of each partition's request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

/// Lower bound on the notification sweep interval.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Requests
// =============================================================================

/// An offer, as sent to a partition.
#[derive(Debug, Clone)]
pub struct OfferRequest {
    pub channel: ChannelId,
    pub page: PageId,
    pub values: Vec<Vec<u8>>,
    pub notify_on_full: Option<NotifierId>,
    pub seal: bool,
}

type Job = Box<dyn FnOnce(&mut PartitionEngine) + Send>;

/// Messages understood by a partition actor.
pub enum PartitionRequest {
    Offer {
        request: OfferRequest,
        response: oneshot::Sender<Result<OfferResult>>,
    },

    Poll {
        request: PollRequest,
        response: oneshot::Sender<Result<PollResult>>,
    },

    /// Any other engine operation. The closure sends its own reply.
    Execute(Job),

    /// Stop after the requests already queued. `done` fires once the
    /// engine (and its connection) has been dropped.
    Shutdown { done: oneshot::Sender<()> },
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable async handle to one partition actor.
#[derive(Debug, Clone)]
pub struct PartitionHandle {
    partition: PartitionId,
    tx: mpsc::Sender<PartitionRequest>,
}

impl PartitionHandle {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub async fn offer(&self, request: OfferRequest) -> Result<OfferResult> {
        let (response, rx) = oneshot::channel();
        self.send(PartitionRequest::Offer { request, response }).await?;
        self.receive(rx).await
    }

    pub async fn poll(&self, request: PollRequest) -> Result<PollResult> {
        let (response, rx) = oneshot::channel();
        self.send(PartitionRequest::Poll { request, response }).await?;
        self.receive(rx).await
    }

    /// Runs `op` on the actor thread and returns its result.
    pub async fn execute<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut PartitionEngine) -> Result<R> + Send + 'static,
    {
        let (response, rx) = oneshot::channel();
        let job: Job = Box::new(move |engine| {
            let _ = response.send(op(engine));
        });
        self.send(PartitionRequest::Execute(job)).await?;
        self.receive(rx).await
    }

    /// Stops the actor and waits until it has released its database.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(PartitionRequest::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, request: PartitionRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Closed(format!("partition {} has shut down", self.partition)))
    }

    async fn receive<R>(&self, rx: oneshot::Receiver<Result<R>>) -> Result<R> {
        rx.await
            .map_err(|_| Error::Closed(format!("partition {} dropped the response", self.partition)))?
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Spawns the actor thread that owns `engine`.
pub fn spawn_partition(engine: PartitionEngine, sweep_interval: Duration) -> Result<PartitionHandle> {
    let partition = engine.partition();
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let sweep_interval = sweep_interval.max(MIN_SWEEP_INTERVAL);

    std::thread::Builder::new()
        .name(format!("pagedtopic-partition-{}", partition.as_raw()))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();
            match runtime {
                Ok(rt) => rt.block_on(run_partition(engine, rx, sweep_interval)),
                Err(e) => error!(partition = partition.as_raw(), error = %e, "failed to build partition runtime"),
            }
        })
        .map_err(|e| Error::Io(format!("failed to spawn partition thread: {e}")))?;

    Ok(PartitionHandle { partition, tx })
}

async fn run_partition(
    mut engine: PartitionEngine,
    mut rx: mpsc::Receiver<PartitionRequest>,
    sweep_interval: Duration,
) {
    let partition = engine.partition();
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(partition = partition.as_raw(), "partition actor started");

    let done = loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(PartitionRequest::Offer { request, response }) => {
                    let result = engine.offer(
                        request.channel,
                        request.page,
                        request.values,
                        request.notify_on_full,
                        request.seal,
                    );
                    let _ = response.send(result);
                }
                Some(PartitionRequest::Poll { request, response }) => {
                    let _ = response.send(engine.poll(&request));
                }
                Some(PartitionRequest::Execute(job)) => job(&mut engine),
                Some(PartitionRequest::Shutdown { done }) => break Some(done),
                None => break None,
            },
            _ = sweep.tick() => {
                let expired = engine.sweep_notifications();
                if expired > 0 {
                    debug!(partition = partition.as_raw(), expired, "notifier registrations expired");
                }
            }
        }
    };

    drop(engine);
    debug!(partition = partition.as_raw(), "partition actor stopped");
    if let Some(done) = done {
        let _ = done.send(());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::partition::{engine_for_tests, OfferStatus};

    fn handle(config: TopicConfig) -> PartitionHandle {
        spawn_partition(engine_for_tests(config), Duration::from_millis(20)).unwrap()
    }

    fn offer(values: Vec<Vec<u8>>) -> OfferRequest {
        OfferRequest {
            channel: ChannelId::ZERO,
            page: PageId::from_raw(0),
            values,
            notify_on_full: None,
            seal: false,
        }
    }

    #[tokio::test]
    async fn test_requests_run_in_order() {
        let handle = handle(TopicConfig {
            retain_consumed: true,
            channel_count: 1,
            ..TopicConfig::default()
        });

        for i in 0..5u8 {
            let result = handle.offer(offer(vec![vec![i]])).await.unwrap();
            assert_eq!(result.status, OfferStatus::Success);
            assert_eq!(result.first_offset, i as i32);
        }

        let tail = handle
            .execute(|engine| Ok(engine.page(ChannelId::ZERO, PageId::from_raw(0)).map(|p| p.tail)))
            .await
            .unwrap();
        assert_eq!(tail, Some(4));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_propagates_errors() {
        let handle = handle(TopicConfig::default());
        let err = handle
            .execute(|engine| engine.remove_page(ChannelId::from_raw(999), PageId::from_raw(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannel { .. }));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let handle = handle(TopicConfig::default());
        handle.shutdown().await;
        let err = handle.offer(offer(vec![vec![1]])).await.unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }
}
