//! # Async API for Paged Topics
//!
//! [`PagedTopic`] is the public async face of a topic. It owns one actor per
//! partition and routes every operation either to the single partition that
//! holds a page, or to all partitions at once:
//!
//! ```text
//!                       ┌────────────────────────────┐
//!   offer(ch, page) ───►│ (page + ch) % partitions   │──► one partition
//!   poll(ch, page)  ───►│                            │
//!                       └────────────────────────────┘
//!
//!   ensure_subscription ┐
//!   commit / seek       ├──► join_all over every partition ──► aggregate
//!   remove_subscription ┘
//! ```
//!
//! ## Shared State
//!
//! - the topic-wide stored byte count (partitions check it on offer),
//! - the notification hub every partition publishes fired notifiers to,
//! - per-group initialisation locks,
//! - the notifier id counter.
//!
//! `PagedTopic` is `Clone`; clones share all of it.
//!
//! ## Rust Concepts
//!
//! - **`futures::future::join_all`**: fan-out to every partition actor
//!   concurrently, then aggregate in partition order.
//! - **`tokio::sync::Mutex` behind `Arc`**: group locks are held across
//!   `.await` points, which a `std::sync::Mutex` guard must never be.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{debug, info};

use crate::actor::{spawn_partition, OfferRequest, PartitionHandle};
use crate::config::TopicConfig;
use crate::error::{Error, Result};
use crate::functions::FunctionRegistry;
use crate::notify::{NotificationHub, NotificationListener};
use crate::partition::{OfferResult, PartitionEngine, PartitionStats, PollRequest, PollResult};
use crate::schema::Database;
use crate::subscription::{
    CommitResult, GroupHead, SeekResult, SeekStatus, SeekTarget, SubscribePhase,
};
use crate::types::{
    ChannelId, NotifierId, PageId, PartitionId, Position, SubscriberGroupId, SubscriberId,
};

// =============================================================================
// Statistics
// =============================================================================

/// Topic-wide statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Counters summed over all partitions.
    pub totals: PartitionStats,
    pub stored_bytes: u64,
    pub channel_count: u32,
}

// =============================================================================
// PagedTopic
// =============================================================================

/// Async handle to a paged topic.
#[derive(Debug, Clone)]
pub struct PagedTopic {
    inner: Arc<TopicInner>,
}

#[derive(Debug)]
struct TopicInner {
    config: Arc<TopicConfig>,
    partitions: Vec<PartitionHandle>,
    hub: NotificationHub,
    storage_bytes: Arc<AtomicU64>,
    channel_count: AtomicU32,
    group_locks: Mutex<HashMap<SubscriberGroupId, Arc<tokio::sync::Mutex<()>>>>,
    next_notifier: AtomicU32,
    member_id: u64,
    base_page: PageId,
}

impl PagedTopic {
    /// Opens (or creates) a topic stored under `dir`, one database file per
    /// partition.
    pub async fn open(
        dir: impl AsRef<Path>,
        config: TopicConfig,
        functions: FunctionRegistry,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let databases = (0..config.partition_count)
            .map(|i| Database::open(dir.join(format!("partition-{i:04}.db"))))
            .collect::<Result<Vec<_>>>()?;

        info!(path = %dir.display(), partitions = config.partition_count, "opening topic");
        Self::start(config, functions, databases).await
    }

    /// Creates a topic whose state is lost when it shuts down.
    pub async fn open_in_memory(config: TopicConfig, functions: FunctionRegistry) -> Result<Self> {
        let databases = (0..config.partition_count)
            .map(|_| Database::open_in_memory())
            .collect::<Result<Vec<_>>>()?;
        Self::start(config, functions, databases).await
    }

    async fn start(
        config: TopicConfig,
        functions: FunctionRegistry,
        databases: Vec<Database>,
    ) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let functions = Arc::new(functions);
        let hub = NotificationHub::new();
        let storage_bytes = Arc::new(AtomicU64::new(0));
        let sweep_interval = config.notification_expiry / 4;

        let mut partitions = Vec::with_capacity(databases.len());
        for (i, db) in databases.into_iter().enumerate() {
            let engine = PartitionEngine::open(
                PartitionId::from_raw(i as u32),
                Arc::clone(&config),
                Arc::clone(&functions),
                db,
                hub.clone(),
                Arc::clone(&storage_bytes),
            )?;
            partitions.push(spawn_partition(engine, sweep_interval)?);
        }

        let topic = Self {
            inner: Arc::new(TopicInner {
                base_page: config.base_page(),
                channel_count: AtomicU32::new(config.channel_count),
                config,
                partitions,
                hub,
                storage_bytes,
                group_locks: Mutex::new(HashMap::new()),
                next_notifier: AtomicU32::new(1),
                member_id: SubscriberId::random().as_raw().max(1),
            }),
        };

        // Partitions persist the channel count; a previous run may have grown it.
        let counts = topic.fan_out(|engine| Ok(engine.channel_count())).await?;
        let stored = counts.into_iter().max().unwrap_or(0);
        if stored > topic.channel_count() {
            topic.increase_channel_count(stored).await?;
        }

        info!(
            topic = %topic.inner.config.name,
            partitions = topic.partition_count(),
            channels = topic.channel_count(),
            "topic opened"
        );
        Ok(topic)
    }

    // =========================================================================
    // Topic Shape
    // =========================================================================

    pub fn config(&self) -> &TopicConfig {
        &self.inner.config
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    pub fn channel_count(&self) -> u32 {
        self.inner.channel_count.load(Ordering::SeqCst)
    }

    /// First page of every channel.
    pub fn base_page(&self) -> PageId {
        self.inner.base_page
    }

    /// Identity of this process; anonymous groups created here carry it.
    pub fn member_id(&self) -> u64 {
        self.inner.member_id
    }

    /// Topic-wide stored value bytes.
    pub fn stored_bytes(&self) -> u64 {
        self.inner.storage_bytes.load(Ordering::SeqCst)
    }

    fn partition_for(&self, channel: ChannelId, page: PageId) -> &PartitionHandle {
        let index = page.partition(channel, self.partition_count()).index();
        &self.inner.partitions[index]
    }

    fn check_channel(&self, channel: ChannelId) -> Result<()> {
        let channel_count = self.channel_count();
        if channel.as_raw() >= channel_count {
            return Err(Error::InvalidChannel {
                channel,
                channel_count,
            });
        }
        Ok(())
    }

    async fn fan_out<R, F>(&self, op: F) -> Result<Vec<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut PartitionEngine) -> Result<R> + Clone + Send + 'static,
    {
        let calls = self
            .inner
            .partitions
            .iter()
            .map(|partition| partition.execute(op.clone()));
        join_all(calls).await.into_iter().collect()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// A fresh notifier id, unique within this process.
    pub fn new_notifier_id(&self) -> NotifierId {
        NotifierId::from_raw(self.inner.next_notifier.fetch_add(1, Ordering::SeqCst))
    }

    /// Listens for fired notifiers. Call before the request that registers
    /// the notifier.
    pub fn listen(&self) -> NotificationListener {
        self.inner.hub.listen()
    }

    // =========================================================================
    // Storage Engine
    // =========================================================================

    /// Offers values to the tail of one page.
    pub async fn offer(&self, request: OfferRequest) -> Result<OfferResult> {
        self.check_channel(request.channel)?;
        self.partition_for(request.channel, request.page)
            .offer(request)
            .await
    }

    /// Polls one page for the group.
    pub async fn poll(&self, request: PollRequest) -> Result<PollResult> {
        self.check_channel(request.channel)?;
        self.partition_for(request.channel, request.page)
            .poll(request)
            .await
    }

    pub async fn remove_page(&self, channel: ChannelId, page: PageId) -> Result<bool> {
        self.partition_for(channel, page)
            .execute(move |engine| engine.remove_page(channel, page))
            .await
    }

    pub async fn remove_page_if_not_retaining(&self, channel: ChannelId, page: PageId) -> Result<bool> {
        self.partition_for(channel, page)
            .execute(move |engine| engine.remove_page_if_not_retaining(channel, page))
            .await
    }

    /// Highest page ever created in `channel`, NULL if none.
    pub async fn tail_page(&self, channel: ChannelId) -> Result<PageId> {
        self.check_channel(channel)?;
        let tails = self.fan_out(move |engine| Ok(engine.usage(channel).max)).await?;
        Ok(tails.into_iter().max().unwrap_or(PageId::NULL))
    }

    /// Grows the topic to `count` channels. Shrinking is not supported.
    pub async fn increase_channel_count(&self, count: u32) -> Result<u32> {
        let counts = self
            .fan_out(move |engine| engine.increase_channel_count(count))
            .await?;
        let count = counts.into_iter().max().unwrap_or(count);
        self.inner.channel_count.fetch_max(count, Ordering::SeqCst);
        info!(channels = count, "channel count increased");
        Ok(self.channel_count())
    }

    pub async fn stats(&self) -> Result<TopicStats> {
        let per_partition = self.fan_out(|engine| Ok(engine.stats())).await?;
        let mut totals = PartitionStats::default();
        for stats in &per_partition {
            totals.merge(stats);
        }
        Ok(TopicStats {
            totals,
            stored_bytes: self.stored_bytes(),
            channel_count: self.channel_count(),
        })
    }

    // =========================================================================
    // Subscription Protocol
    // =========================================================================

    /// Runs one initialisation phase on every partition, in partition order.
    pub async fn ensure_subscription(
        &self,
        group: &SubscriberGroupId,
        phase: SubscribePhase,
        filter: Option<&str>,
        transform: Option<&str>,
    ) -> Result<Vec<Option<Vec<PageId>>>> {
        let group = group.clone();
        let filter = filter.map(str::to_string);
        let transform = transform.map(str::to_string);
        self.fan_out(move |engine| {
            engine.ensure_subscription(&group, phase, filter.as_deref(), transform.as_deref())
        })
        .await
    }

    /// Commits on every partition and reports the result of the partition
    /// that holds `position`.
    pub async fn commit(
        &self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        position: Position,
    ) -> Result<CommitResult> {
        self.check_channel(channel)?;
        if !position.is_valid() {
            return Err(Error::InvalidPosition(position));
        }

        let owner = position.page.partition(channel, self.partition_count()).index();
        let group = group.clone();
        let mut results = self
            .fan_out(move |engine| engine.commit(channel, &group, subscriber, position))
            .await?;
        Ok(results.swap_remove(owner))
    }

    pub async fn seek_position(
        &self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        position: Position,
    ) -> Result<SeekResult> {
        if !position.is_valid() {
            return Err(Error::InvalidPosition(position));
        }
        self.seek(channel, group, subscriber, SeekTarget::Position(position))
            .await
    }

    pub async fn seek_timestamp(
        &self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        timestamp_ms: i64,
    ) -> Result<SeekResult> {
        self.seek(channel, group, subscriber, SeekTarget::Timestamp(timestamp_ms))
            .await
    }

    /// Seeks every partition. The head is the earliest partition head, the
    /// seeked-to position the latest skipped element.
    async fn seek(
        &self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        target: SeekTarget,
    ) -> Result<SeekResult> {
        self.check_channel(channel)?;
        let group = group.clone();
        let results = self
            .fan_out(move |engine| engine.seek(channel, &group, subscriber, target))
            .await?;

        let mut combined = SeekResult {
            status: SeekStatus::Seeked,
            head: None,
            seeked_to: None,
            tail: None,
        };
        for result in results {
            match result.status {
                SeekStatus::Seeked => {}
                status => {
                    combined.status = status;
                    continue;
                }
            }
            combined.head = match (combined.head, result.head) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            combined.seeked_to = combined.seeked_to.max(result.seeked_to);
            combined.tail = combined.tail.max(result.tail);
        }
        Ok(combined)
    }

    /// Removes the group from every partition.
    pub async fn remove_subscription(&self, group: &SubscriberGroupId) -> Result<bool> {
        let group_id = group.clone();
        let removed = self
            .fan_out(move |engine| engine.remove_subscription(&group_id))
            .await?;
        self.inner
            .group_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(group);
        Ok(removed.into_iter().any(|r| r))
    }

    /// Records the group's channel allocation in every partition.
    pub async fn update_channel_allocation(
        &self,
        group: &SubscriberGroupId,
        allocations: BTreeMap<SubscriberId, Vec<ChannelId>>,
    ) -> Result<()> {
        let group = group.clone();
        self.fan_out(move |engine| engine.update_channel_allocation(&group, allocations))
            .await?;
        Ok(())
    }

    pub async fn remove_subscriber(&self, group: &SubscriberGroupId, subscriber: SubscriberId) -> Result<bool> {
        let group = group.clone();
        let changed = self
            .fan_out(move |engine| engine.remove_subscriber(&group, subscriber))
            .await?;
        Ok(changed.into_iter().any(|c| c))
    }

    /// Removes anonymous groups whose creating member is not live.
    pub async fn cleanup_anonymous_groups(&self, live_members: Vec<u64>) -> Result<usize> {
        let removed = self
            .fan_out(move |engine| engine.cleanup_anonymous_groups(&live_members))
            .await?;
        // A group spans partitions; count it once.
        Ok(removed.into_iter().max().unwrap_or(0))
    }

    /// Latest committed and rollback positions of the group per channel.
    pub async fn heads(&self, group: &SubscriberGroupId) -> Result<Vec<GroupHead>> {
        let group = group.clone();
        let per_partition = self.fan_out(move |engine| Ok(engine.heads(&group))).await?;

        let mut by_channel: BTreeMap<ChannelId, GroupHead> = BTreeMap::new();
        for head in per_partition.into_iter().flatten() {
            let entry = by_channel.entry(head.channel).or_insert(GroupHead {
                channel: head.channel,
                committed: None,
                rollback: None,
            });
            entry.committed = entry.committed.max(head.committed);
            entry.rollback = entry.rollback.max(head.rollback);
        }
        Ok(by_channel.into_values().collect())
    }

    /// The lock serialising initialisation of `group` within this process.
    pub fn group_lock(&self, group: &SubscriberGroupId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .group_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(group.clone()).or_default())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops every partition actor after the requests already queued.
    pub async fn shutdown(&self) {
        join_all(self.inner.partitions.iter().map(PartitionHandle::shutdown)).await;
        debug!(topic = %self.inner.config.name, "topic shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::OfferStatus;

    fn config() -> TopicConfig {
        TopicConfig {
            name: "api".into(),
            partition_count: 3,
            channel_count: 2,
            local_partition_count: 3,
            retain_consumed: true,
            ..TopicConfig::default()
        }
    }

    fn offer(channel: u32, page: i64, value: &[u8]) -> OfferRequest {
        OfferRequest {
            channel: ChannelId::from_raw(channel),
            page: PageId::from_raw(page),
            values: vec![value.to_vec()],
            notify_on_full: None,
            seal: false,
        }
    }

    #[tokio::test]
    async fn test_offer_routes_by_page_and_channel() {
        let topic = PagedTopic::open_in_memory(config(), FunctionRegistry::new())
            .await
            .unwrap();

        for page in 0..4 {
            let result = topic.offer(offer(1, page, b"x")).await.unwrap();
            assert_eq!(result.status, OfferStatus::Success);
        }
        assert_eq!(topic.tail_page(ChannelId::from_raw(1)).await.unwrap(), PageId::from_raw(3));
        assert_eq!(topic.stats().await.unwrap().totals.pages_created, 4);
        assert_eq!(topic.stored_bytes(), 4);
        topic.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let topic = PagedTopic::open_in_memory(config(), FunctionRegistry::new())
            .await
            .unwrap();
        let err = topic.offer(offer(5, 0, b"x")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChannel { .. }));
        topic.shutdown().await;
    }

    #[tokio::test]
    async fn test_notifier_ids_are_unique() {
        let topic = PagedTopic::open_in_memory(config(), FunctionRegistry::new())
            .await
            .unwrap();
        assert_ne!(topic.new_notifier_id(), topic.new_notifier_id());
        topic.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_lock_is_shared_per_group() {
        let topic = PagedTopic::open_in_memory(config(), FunctionRegistry::new())
            .await
            .unwrap();
        let group = SubscriberGroupId::durable("g");
        let a = topic.group_lock(&group);
        let b = topic.group_lock(&group);
        assert!(Arc::ptr_eq(&a, &b));

        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());
        topic.shutdown().await;
    }

    #[tokio::test]
    async fn test_channel_count_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let topic = PagedTopic::open(dir.path(), config(), FunctionRegistry::new())
                .await
                .unwrap();
            assert_eq!(topic.increase_channel_count(4).await.unwrap(), 4);
            topic.shutdown().await;
        }

        let topic = PagedTopic::open(dir.path(), config(), FunctionRegistry::new())
            .await
            .unwrap();
        assert_eq!(topic.channel_count(), 4);
        topic.shutdown().await;
    }
}
