//! # Publisher
//!
//! A [`Publisher`] turns single `publish` calls into batched offers against
//! each channel's tail page. Each channel has its own
//! [`BatchingOperationsQueue`], costed by value size, and at most one drain
//! task:
//!
//! ```text
//!  publish(v) ─► channel queue ─► drain task ─► offer(tail page)
//!                                     │
//!                 Success ────────────┼─► complete with Position
//!                 PageSealed ─────────┼─► tail page + 1, offer again
//!                 TopicFull ──────────┴─► wait for removal notifier, Retry
//! ```
//!
//! Tail pages only move forward. A page the engine has sealed or removed
//! never accepts values again, so the publisher follows the chain one page
//! at a time.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::actor::OfferRequest;
use crate::api::PagedTopic;
use crate::batching::{BatchingOperationsQueue, Completion, OnErrorAction};
use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::partition::OfferStatus;
use crate::types::{ChannelId, NotifierId, PageId, Position};

/// Where a published value ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStatus {
    pub channel: ChannelId,
    /// `None` when the value was accepted but dropped because nobody
    /// subscribes to the channel.
    pub position: Option<Position>,
}

// =============================================================================
// Publisher
// =============================================================================

/// Batched, flow-controlled publishing to a topic.
#[derive(Debug)]
pub struct Publisher {
    channels: Vec<Arc<ChannelPublisher>>,
    next_channel: AtomicUsize,
}

impl Publisher {
    /// Creates a publisher over every channel the topic has now.
    pub async fn new(topic: PagedTopic, config: PublisherConfig) -> Result<Self> {
        let runtime = Handle::current();
        let mut channels = Vec::new();

        for channel in ChannelId::all(topic.channel_count()) {
            let tail = topic.tail_page(channel).await?.max(topic.base_page());
            channels.push(ChannelPublisher::new(
                topic.clone(),
                channel,
                tail,
                config.clone(),
                runtime.clone(),
            ));
        }

        debug!(channels = channels.len(), "publisher created");
        Ok(Self {
            channels,
            next_channel: AtomicUsize::new(0),
        })
    }

    /// Publishes to the next channel in round-robin order.
    pub fn publish(&self, value: Vec<u8>) -> Result<Completion<PublishStatus>> {
        if self.channels.is_empty() {
            return Err(Error::QueueInactive);
        }
        let index = self.next_channel.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        self.channels[index].queue.add(value)
    }

    pub fn publish_to(&self, channel: ChannelId, value: Vec<u8>) -> Result<Completion<PublishStatus>> {
        let publisher = self
            .channels
            .get(channel.index())
            .ok_or(Error::InvalidChannel {
                channel,
                channel_count: self.channels.len() as u32,
            })?;
        publisher.queue.add(value)
    }

    /// Waits until every value published so far has resolved.
    pub async fn flush(&self) {
        join_all(self.channels.iter().map(|c| c.queue.flush())).await;
    }

    /// Stops accepting values and waits for the ones already queued.
    pub async fn close(&self) {
        for channel in &self.channels {
            channel.queue.close();
        }
        self.flush().await;
    }

    /// Bytes queued and not yet handed to an offer.
    pub fn backlog(&self) -> u64 {
        self.channels.iter().map(|c| c.queue.backlog()).sum()
    }
}

// =============================================================================
// Per-Channel Publisher
// =============================================================================

struct ChannelPublisher {
    topic: PagedTopic,
    channel: ChannelId,
    config: PublisherConfig,
    queue: BatchingOperationsQueue<Vec<u8>, PublishStatus>,
    tail_page: AtomicI64,
    full_notifier: NotifierId,
    drain_lock: tokio::sync::Mutex<()>,
}

/// What the drain task does after one batch.
enum BatchOutcome {
    Published,
    RetryAfterFull,
}

impl ChannelPublisher {
    fn new(
        topic: PagedTopic,
        channel: ChannelId,
        tail: PageId,
        config: PublisherConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        let full_notifier = topic.new_notifier_id();
        Arc::new_cyclic(|weak: &Weak<ChannelPublisher>| {
            let weak = weak.clone();
            let queue = BatchingOperationsQueue::with_size_fn(
                1,
                move |_| {
                    if let Some(publisher) = weak.upgrade() {
                        runtime.spawn(publisher.drain());
                    }
                },
                |value: &Vec<u8>| value.len() as u64,
            );
            Self {
                topic,
                channel,
                config,
                queue,
                tail_page: AtomicI64::new(tail.as_raw()),
                full_notifier,
                drain_lock: tokio::sync::Mutex::new(()),
            }
        })
    }

    fn tail_page(&self) -> PageId {
        PageId::from_raw(self.tail_page.load(Ordering::SeqCst))
    }

    fn advance_past(&self, page: PageId) {
        self.tail_page.fetch_max(page.next().as_raw(), Ordering::SeqCst);
    }

    async fn drain(self: Arc<Self>) {
        let _drain = self.drain_lock.lock().await;

        while self.queue.fill_current_batch(self.config.batch_bytes) {
            let values = self.queue.get_current_batch_values();
            if values.is_empty() {
                continue;
            }

            match self.publish_batch(values).await {
                Ok(BatchOutcome::Published) => {}
                Ok(BatchOutcome::RetryAfterFull) => {
                    self.queue.handle_error(
                        Error::Timeout("waiting for topic space".into()),
                        Some(OnErrorAction::Retry),
                    );
                    return;
                }
                Err(err) => {
                    warn!(channel = self.channel.as_raw(), error = %err, "publish failed");
                    self.queue
                        .handle_error(err, Some(OnErrorAction::CompleteWithException));
                    return;
                }
            }
        }
    }

    async fn publish_batch(&self, mut values: Vec<Vec<u8>>) -> Result<BatchOutcome> {
        while !values.is_empty() {
            let page = self.tail_page();
            let mut listener = self.topic.listen();
            let result = self
                .topic
                .offer(OfferRequest {
                    channel: self.channel,
                    page,
                    values: values.clone(),
                    notify_on_full: Some(self.full_notifier),
                    seal: false,
                })
                .await?;

            let accepted = (result.accepted as usize).min(values.len());
            match result.status {
                OfferStatus::Success => {
                    let statuses = (0..accepted)
                        .map(|i| {
                            Ok(PublishStatus {
                                channel: self.channel,
                                position: Some(Position::new(page, result.first_offset + i as i32)),
                            })
                        })
                        .collect();
                    self.queue.complete_elements(statuses);
                    values.drain(..accepted);
                    if result.page_sealed || !values.is_empty() {
                        self.advance_past(page);
                    }
                }
                OfferStatus::PageSealed => {
                    let dropped = (0..accepted)
                        .map(|_| {
                            Ok(PublishStatus {
                                channel: self.channel,
                                position: None,
                            })
                        })
                        .collect();
                    self.queue.complete_elements(dropped);
                    values.drain(..accepted);
                    self.advance_past(page);
                }
                OfferStatus::TopicFull => {
                    debug!(channel = self.channel.as_raw(), page = %page, "topic full, waiting for space");
                    listener
                        .wait_for(self.full_notifier, self.config.full_wait)
                        .await;
                    return Ok(BatchOutcome::RetryAfterFull);
                }
            }
        }
        Ok(BatchOutcome::Published)
    }
}

impl std::fmt::Debug for ChannelPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPublisher")
            .field("channel", &self.channel)
            .field("tail_page", &self.tail_page())
            .field("queue", &self.queue)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
