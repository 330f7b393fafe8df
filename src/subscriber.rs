//! # Subscriber
//!
//! A [`Subscriber`] joins a group, then serves `receive` requests by polling
//! the channels it owns.
//!
//! ## Joining a Group
//!
//! ```text
//!   INQUIRE all partitions
//!      │
//!      ├── every partition initialised ──► head[ch] = min(resume pages)
//!      │
//!      └── otherwise, under the group lock:
//!             PIN all partitions      (create subscriptions, pin pages)
//!             head[ch] = max of pinned pages (min when retaining)
//!             ADVANCE all partitions  (move cursors to head[ch])
//! ```
//!
//! Every page is clamped to the topic's base page first. PIN and ADVANCE are
//! both safe to repeat, so a crash between them is repaired by the next
//! subscriber that joins.
//!
//! Joining then rewinds each owned channel to just after the group's
//! committed position: anything read but not committed is delivered again.
//!
//! ## Receiving
//!
//! Receive requests go through a [`BatchingOperationsQueue`]. One drain task
//! at a time polls the owned channels round robin from their head pages.
//! An exhausted page moves the head to the next page. When every owned
//! channel is drained to its open tail, the drain waits for the
//! subscriber's insertion notifier (or `empty_wait`) and polls again.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::api::PagedTopic;
use crate::batching::{BatchingOperationsQueue, Completion, OnErrorAction};
use crate::config::SubscriberConfig;
use crate::error::{Error, Result};
use crate::model::Element;
use crate::notify::NotificationListener;
use crate::partition::{PollRequest, PollStatus};
use crate::subscription::{CommitResult, SeekResult, SeekStatus, SubscribePhase};
use crate::types::{ChannelId, NotifierId, PageId, Position, SubscriberGroupId, SubscriberId};

// =============================================================================
// Subscriber
// =============================================================================

/// A member of a subscriber group.
#[derive(Debug, Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    topic: PagedTopic,
    id: SubscriberId,
    group: SubscriberGroupId,
    config: SubscriberConfig,
    channel_count: u32,
    notifier: NotifierId,
    queue: BatchingOperationsQueue<(), Element>,
    /// Cursor state. Holding the lock is what makes a task the drain task.
    state: Mutex<ReceiveState>,
    wakeup: Notify,
}

struct ReceiveState {
    channels: Vec<ChannelCursor>,
    next: usize,
    listener: NotificationListener,
}

#[derive(Debug, Clone, Copy)]
struct ChannelCursor {
    channel: ChannelId,
    head: PageId,
    /// Drained to an open tail on the last poll.
    empty: bool,
}

impl Subscriber {
    /// Joins (creating if needed) the configured group.
    pub async fn connect(topic: PagedTopic, config: SubscriberConfig) -> Result<Self> {
        let id = config.id.unwrap_or_else(SubscriberId::random);
        let group = config.group.clone().unwrap_or_else(|| {
            SubscriberGroupId::from_parts(format!("$anonymous-{id}"), topic.member_id())
        });
        let channel_count = topic.channel_count();

        let heads = initialise_group(&topic, &group, &config).await?;

        let owned: Vec<ChannelId> = match &config.channels {
            Some(channels) => channels.clone(),
            None => ChannelId::all(channel_count).collect(),
        };
        let mut allocations = BTreeMap::new();
        allocations.insert(id, owned.clone());
        topic.update_channel_allocation(&group, allocations).await?;

        let mut cursors: Vec<ChannelCursor> = owned
            .iter()
            .map(|&channel| ChannelCursor {
                channel,
                head: heads
                    .get(channel.index())
                    .copied()
                    .unwrap_or_else(|| topic.base_page()),
                empty: false,
            })
            .collect();
        rewind_to_committed(&topic, &group, id, &mut cursors).await?;

        let runtime = Handle::current();
        let listener = topic.listen();
        let notifier = topic.new_notifier_id();
        let batch_size = config.batch_size.max(1) as usize;

        let inner = Arc::new_cyclic(|weak: &Weak<SubscriberInner>| {
            let weak = weak.clone();
            SubscriberInner {
                queue: BatchingOperationsQueue::new(batch_size, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        runtime.spawn(inner.drain());
                    }
                }),
                topic,
                id,
                group,
                config,
                channel_count,
                notifier,
                state: Mutex::new(ReceiveState {
                    channels: cursors,
                    next: 0,
                    listener,
                }),
                wakeup: Notify::new(),
            }
        });

        info!(group = %inner.group, subscriber = %id, channels = owned.len(), "subscriber connected");
        Ok(Self { inner })
    }

    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    pub fn group(&self) -> &SubscriberGroupId {
        &self.inner.group
    }

    /// Next head page of each owned channel.
    pub async fn heads(&self) -> Vec<(ChannelId, PageId)> {
        let state = self.inner.state.lock().await;
        state.channels.iter().map(|c| (c.channel, c.head)).collect()
    }

    /// Requests the next element from any owned channel.
    pub fn receive(&self) -> Result<Completion<Element>> {
        self.inner.queue.add(())
    }

    /// Receive requests not yet picked up by the drain task.
    pub fn backlog(&self) -> u64 {
        self.inner.queue.backlog()
    }

    /// Commits the group's progress in `channel` up to `position`.
    pub async fn commit(&self, channel: ChannelId, position: Position) -> Result<CommitResult> {
        self.inner
            .topic
            .commit(channel, &self.inner.group, self.inner.id, position)
            .await
    }

    /// Moves the group's cursor in `channel` to just after `position`.
    pub async fn seek(&self, channel: ChannelId, position: Position) -> Result<SeekResult> {
        let inner = &self.inner;
        self.while_paused(channel, || {
            inner
                .topic
                .seek_position(channel, &inner.group, inner.id, position)
        })
        .await
    }

    /// Moves the group's cursor in `channel` to the first element published
    /// after `timestamp_ms`.
    pub async fn seek_timestamp(&self, channel: ChannelId, timestamp_ms: i64) -> Result<SeekResult> {
        let inner = &self.inner;
        self.while_paused(channel, || {
            inner
                .topic
                .seek_timestamp(channel, &inner.group, inner.id, timestamp_ms)
        })
        .await
    }

    /// Runs a seek with the drain task stopped, then points the channel's
    /// head at the seek result.
    async fn while_paused<F, Fut>(&self, channel: ChannelId, seek: F) -> Result<SeekResult>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SeekResult>>,
    {
        let inner = &self.inner;
        inner.queue.pause();
        inner.wakeup.notify_one();

        let result = {
            let mut state = inner.state.lock().await;
            let result = seek().await;
            if let Ok(seeked) = &result {
                if seeked.status == SeekStatus::Seeked {
                    if let Some(cursor) = state.channels.iter_mut().find(|c| c.channel == channel) {
                        cursor.head = seeked
                            .head
                            .or(seeked.seeked_to)
                            .map_or(cursor.head, |p| p.page.max(inner.topic.base_page()));
                        cursor.empty = false;
                    }
                }
            }
            result
        };

        inner.queue.resume();
        result
    }

    /// Cancels outstanding receives and leaves the group. Anonymous groups
    /// are removed with their last subscriber.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.queue.cancel_all_and_close();
        inner.wakeup.notify_one();

        if inner.group.is_anonymous() {
            inner.topic.remove_subscription(&inner.group).await?;
        } else {
            inner.topic.remove_subscriber(&inner.group, inner.id).await?;
        }
        debug!(group = %inner.group, subscriber = %inner.id, "subscriber closed");
        Ok(())
    }
}

// =============================================================================
// Group Initialisation
// =============================================================================

/// Runs the three-phase join and returns the head page of every channel.
async fn initialise_group(
    topic: &PagedTopic,
    group: &SubscriberGroupId,
    config: &SubscriberConfig,
) -> Result<Vec<PageId>> {
    let filter = config.filter.as_deref();
    let transform = config.transform.as_deref();
    let base = topic.base_page();
    let channel_count = topic.channel_count() as usize;

    let inquired = topic
        .ensure_subscription(group, SubscribePhase::Inquire, filter, transform)
        .await?;
    if inquired.iter().all(Option::is_some) {
        let pages: Vec<Vec<PageId>> = inquired.into_iter().flatten().collect();
        let heads = combine_heads(&pages, channel_count, base, true);
        debug!(group = %group, "group already initialised");
        return Ok(heads);
    }

    let lock = topic.group_lock(group);
    let _guard = lock.lock().await;

    topic.cleanup_anonymous_groups(vec![topic.member_id()]).await?;

    let pinned = topic
        .ensure_subscription(group, SubscribePhase::Pin, filter, transform)
        .await?;
    let pages: Vec<Vec<PageId>> = pinned.into_iter().flatten().collect();
    let heads = combine_heads(&pages, channel_count, base, topic.config().retain_consumed);

    topic
        .ensure_subscription(group, SubscribePhase::Advance(heads.clone()), filter, transform)
        .await?;

    info!(group = %group, "group initialised");
    Ok(heads)
}

/// Points each cursor just after the group's committed position, so
/// elements read but never committed are delivered again.
async fn rewind_to_committed(
    topic: &PagedTopic,
    group: &SubscriberGroupId,
    subscriber: SubscriberId,
    cursors: &mut [ChannelCursor],
) -> Result<()> {
    for head in topic.heads(group).await? {
        let Some(committed) = head.committed.filter(Position::is_valid) else {
            continue;
        };
        let Some(cursor) = cursors.iter_mut().find(|c| c.channel == head.channel) else {
            continue;
        };
        let seeked = topic
            .seek_position(head.channel, group, subscriber, committed)
            .await?;
        if seeked.status == SeekStatus::Seeked {
            cursor.head = seeked
                .head
                .or(seeked.seeked_to)
                .map_or(cursor.head, |p| p.page.max(topic.base_page()));
        }
    }
    Ok(())
}

/// Combines per-partition pages into one head per channel. Pages are
/// clamped to `base` first.
fn combine_heads(pages: &[Vec<PageId>], channel_count: usize, base: PageId, take_min: bool) -> Vec<PageId> {
    (0..channel_count)
        .map(|channel| {
            let candidates = pages
                .iter()
                .filter_map(|partition| partition.get(channel))
                .map(|page| (*page).max(base));
            let combined = if take_min {
                candidates.min()
            } else {
                candidates.max()
            };
            combined.unwrap_or(base)
        })
        .collect()
}

// =============================================================================
// Drain Task
// =============================================================================

impl SubscriberInner {
    async fn drain(self: Arc<Self>) {
        let mut state = self.state.lock().await;

        while self.queue.fill_current_batch(self.config.batch_size.max(1)) {
            let wanted = self.queue.get_current_batch_values().len();
            if wanted == 0 {
                continue;
            }

            match self.poll_channels(&mut state, wanted).await {
                Ok(elements) if !elements.is_empty() => {
                    self.queue
                        .complete_unresolved(elements.into_iter().map(Ok).collect());
                }
                Ok(_) => {
                    if state.channels.iter().all(|c| c.empty) {
                        let notifier = self.notifier;
                        let empty_wait = self.config.empty_wait;
                        tokio::select! {
                            _ = state.listener.wait_for(notifier, empty_wait) => {}
                            _ = self.wakeup.notified() => {}
                        }
                        for cursor in &mut state.channels {
                            cursor.empty = false;
                        }
                    }
                }
                Err(err) => {
                    warn!(group = %self.group, error = %err, "receive failed");
                    self.queue
                        .handle_error(err, Some(OnErrorAction::CompleteWithException));
                    return;
                }
            }
        }
    }

    /// One round-robin pass over the owned channels.
    async fn poll_channels(&self, state: &mut ReceiveState, wanted: usize) -> Result<Vec<Element>> {
        let mut received = Vec::new();
        let count = state.channels.len();

        for _ in 0..count {
            if received.len() >= wanted {
                break;
            }
            let index = state.next % count;
            state.next = (index + 1) % count;

            let cursor = &mut state.channels[index];
            if cursor.empty {
                continue;
            }
            self.poll_channel(cursor, wanted - received.len(), &mut received)
                .await?;
        }
        Ok(received)
    }

    async fn poll_channel(
        &self,
        cursor: &mut ChannelCursor,
        wanted: usize,
        received: &mut Vec<Element>,
    ) -> Result<()> {
        let target = received.len() + wanted;
        loop {
            let result = self
                .topic
                .poll(PollRequest {
                    channel: cursor.channel,
                    page: cursor.head,
                    max_elements: (target - received.len()) as u32,
                    notifier: Some(self.notifier),
                    subscriber: self.id,
                    group: self.group.clone(),
                    channel_count: self.channel_count,
                })
                .await?;

            match result.status {
                PollStatus::Remaining(left) => {
                    received.extend(result.elements);
                    if left == 0 {
                        cursor.empty = true;
                    }
                    return Ok(());
                }
                PollStatus::Exhausted => {
                    received.extend(result.elements);
                    cursor.head = cursor.head.next();
                    if received.len() >= target {
                        return Ok(());
                    }
                }
                PollStatus::NotAllocated => {
                    debug!(channel = cursor.channel.as_raw(), "channel owned by another subscriber");
                    cursor.empty = true;
                    return Ok(());
                }
                PollStatus::UnknownSubscriber => {
                    return Err(Error::UnknownGroup(self.group.name().to_string()));
                }
            }
        }
    }
}

impl std::fmt::Debug for SubscriberInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberInner")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("queue", &self.queue)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: i64) -> PageId {
        PageId::from_raw(raw)
    }

    #[test]
    fn test_combine_heads_takes_max_clamped_to_base() {
        let pages = vec![vec![p(3), PageId::NULL], vec![p(7), PageId::NULL]];
        let heads = combine_heads(&pages, 2, p(5), false);
        assert_eq!(heads, vec![p(7), p(5)]);
    }

    #[test]
    fn test_combine_heads_takes_min_when_retaining() {
        let pages = vec![vec![p(9), p(6)], vec![p(7), p(8)]];
        let heads = combine_heads(&pages, 2, p(5), true);
        assert_eq!(heads, vec![p(7), p(6)]);
    }

    #[test]
    fn test_combine_heads_without_partitions_uses_base() {
        assert_eq!(combine_heads(&[], 3, p(2), true), vec![p(2); 3]);
    }
}
