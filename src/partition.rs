//! # Paged Storage Engine
//!
//! One [`PartitionEngine`] owns one partition: its pages, usages,
//! subscriptions and elements. It never spawns threads or takes locks. The
//! partition actor ([`crate::actor`]) calls it from a single thread, one
//! request at a time, and every public method runs as one all-or-nothing
//! step against the [`PartitionStore`].
//!
//! ## Page Chains
//!
//! ```text
//!  usage.head                                          usage.tail
//!      │                                                   │
//!      ▼                                                   ▼
//!  ┌────────┐ next  ┌────────┐ next  ┌────────┐ next  ┌────────┐
//!  │ page 3 │──────►│ page 8 │──────►│ page13 │──────►│ page18 │
//!  │ sealed │◄──────│ sealed │◄──────│ sealed │◄──────│  open  │
//!  └────────┘ prev  └────────┘ prev  └────────┘ prev  └────────┘
//!     refs=1          refs=1+1         refs=1           refs=1+2
//!     (sub A)         (chain, B)       (chain)          (chain, waiting)
//! ```
//!
//! Pages of one channel in one partition are a sparse, increasing
//! subsequence of the channel's global page ids, linked by id.
//!
//! ## Reference Counting
//!
//! See [`crate::model`]. Poll never releases references; commit and seek
//! move a subscription's hold window, and removing a page releases the
//! chain reference it held on its successor, so removal cascades forward
//! while successors drop to zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::codec::current_time_ms;
use crate::config::TopicConfig;
use crate::error::{Error, Result};
use crate::functions::FunctionRegistry;
use crate::model::{Element, Page, Subscription, Usage};
use crate::notify::{Notification, NotificationHub, NotifierRegistry};
use crate::schema::Database;
use crate::store::{PartitionStore, StepEffects};
use crate::types::{
    ChannelId, ElementKey, NotifierId, PageId, PageKey, PartitionId, SubscriberGroupId,
    SubscriberId, SubscriptionKey, EMPTY_TAIL, NULL_OFFSET,
};

// =============================================================================
// Offer Types
// =============================================================================

/// Outcome class of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    /// At least one value was stored.
    Success,
    /// The page is sealed, removed, or values were discarded for lack of
    /// subscribers. Move to the next page.
    PageSealed,
    /// The topic is over its byte budget. Wait for a removal notification.
    TopicFull,
}

/// Result of [`PartitionEngine::offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferResult {
    pub status: OfferStatus,
    /// Values accepted (stored, or discarded without subscribers).
    pub accepted: u32,
    /// Bytes the publisher may send next: the space left in this page, or
    /// a full page once this offer sealed it or the topic is full. Zero when
    /// the page was already sealed or removed.
    pub remaining_capacity: u64,
    /// Offset of the first accepted value, [`EMPTY_TAIL`] when none.
    pub first_offset: i32,
    /// The page is sealed after this offer.
    pub page_sealed: bool,
}

impl OfferResult {
    fn sealed(accepted: u32) -> Self {
        Self {
            status: OfferStatus::PageSealed,
            accepted,
            remaining_capacity: 0,
            first_offset: EMPTY_TAIL,
            page_sealed: true,
        }
    }

    fn full(capacity: u64) -> Self {
        Self {
            status: OfferStatus::TopicFull,
            accepted: 0,
            remaining_capacity: capacity,
            first_offset: EMPTY_TAIL,
            page_sealed: false,
        }
    }
}

// =============================================================================
// Poll Types
// =============================================================================

/// A poll against one page.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub channel: ChannelId,
    pub page: PageId,
    pub max_elements: u32,
    /// Registered on the page if the poll drains it to its tail.
    pub notifier: Option<NotifierId>,
    pub subscriber: SubscriberId,
    pub group: SubscriberGroupId,
    /// The caller's view of the channel count.
    pub channel_count: u32,
}

/// Outcome class of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Elements left in the page after this poll. Zero means drained to an
    /// open tail; the notifier (if any) was registered.
    Remaining(u32),
    /// The page is done for this group. Poll the next page.
    Exhausted,
    /// Another subscriber owns the channel.
    NotAllocated,
    /// The group or channel count is unknown here. Reconnect.
    UnknownSubscriber,
}

/// Result of [`PartitionEngine::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub status: PollStatus,
    /// Offset the next poll of this page starts at.
    pub next_offset: i32,
    pub elements: Vec<Element>,
    /// The group's initialisation head for this channel.
    pub subscription_head: PageId,
}

impl PollResult {
    fn bare(status: PollStatus, subscription_head: PageId) -> Self {
        Self {
            status,
            next_offset: NULL_OFFSET,
            elements: Vec::new(),
            subscription_head,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-partition counters. Owned by the engine, never global.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub offers: u64,
    pub elements_accepted: u64,
    pub elements_discarded: u64,
    pub topic_full: u64,
    pub polls: u64,
    pub elements_polled: u64,
    pub pages_created: u64,
    pub pages_removed: u64,
    pub notifications_fired: u64,
}

impl PartitionStats {
    pub fn merge(&mut self, other: &PartitionStats) {
        self.offers += other.offers;
        self.elements_accepted += other.elements_accepted;
        self.elements_discarded += other.elements_discarded;
        self.topic_full += other.topic_full;
        self.polls += other.polls;
        self.elements_polled += other.elements_polled;
        self.pages_created += other.pages_created;
        self.pages_removed += other.pages_removed;
        self.notifications_fired += other.notifications_fired;
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Storage engine for one partition.
pub struct PartitionEngine {
    pub(crate) partition: PartitionId,
    pub(crate) config: Arc<TopicConfig>,
    pub(crate) functions: Arc<FunctionRegistry>,
    pub(crate) store: PartitionStore,
    registry: NotifierRegistry,
    hub: NotificationHub,
    /// Topic-wide stored bytes, shared by all partitions.
    storage_bytes: Arc<AtomicU64>,
    pub(crate) stats: PartitionStats,
}

impl PartitionEngine {
    /// Loads the partition from `db`.
    pub fn open(
        partition: PartitionId,
        config: Arc<TopicConfig>,
        functions: Arc<FunctionRegistry>,
        db: Database,
        hub: NotificationHub,
        storage_bytes: Arc<AtomicU64>,
    ) -> Result<Self> {
        let store = PartitionStore::load(db.into_connection(), config.channel_count)?;
        storage_bytes.fetch_add(store.byte_size(), Ordering::SeqCst);

        debug!(
            partition = partition.as_raw(),
            pages = store.page_count(),
            bytes = store.byte_size(),
            "partition loaded"
        );

        Ok(Self {
            partition,
            registry: NotifierRegistry::new(config.notification_expiry),
            config,
            functions,
            store,
            hub,
            storage_bytes,
            stats: PartitionStats::default(),
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn channel_count(&self) -> u32 {
        self.store.channel_count()
    }

    pub fn stats(&self) -> PartitionStats {
        self.stats
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Runs `op` as one all-or-nothing step. Counters roll back with the
    /// store.
    pub(crate) fn step<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let stats = self.stats;
        self.store.begin();
        match op(self) {
            Ok(result) => match self.store.commit() {
                Ok(effects) => {
                    self.apply_effects(effects);
                    Ok(result)
                }
                Err(e) => {
                    self.stats = stats;
                    Err(e)
                }
            },
            Err(e) => {
                self.store.rollback();
                self.stats = stats;
                Err(e)
            }
        }
    }

    fn apply_effects(&mut self, effects: StepEffects) {
        let now = Instant::now();
        for notifier in effects.registered {
            self.registry.register(notifier, now);
        }
        for notifier in effects.fired {
            if self.registry.fire(notifier) {
                self.publish(notifier);
            }
        }

        if effects.byte_delta > 0 {
            self.storage_bytes
                .fetch_add(effects.byte_delta as u64, Ordering::SeqCst);
        } else if effects.byte_delta < 0 {
            let delta = effects.byte_delta.unsigned_abs();
            let _ = self
                .storage_bytes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(delta))
                });
        }
    }

    fn publish(&mut self, notifier: NotifierId) {
        self.stats.notifications_fired += 1;
        debug!(partition = self.partition.as_raw(), notifier = notifier.as_raw(), "notifier fired");
        self.hub.publish(Notification {
            partition: self.partition,
            notifier,
        });
    }

    /// Fires registrations whose expiry has passed.
    pub fn sweep_notifications(&mut self) -> usize {
        let expired = self.registry.sweep_expired(Instant::now());
        let count = expired.len();
        for notifier in expired {
            self.publish(notifier);
        }
        count
    }

    pub(crate) fn check_channel(&self, channel: ChannelId) -> Result<()> {
        let channel_count = self.store.channel_count();
        if channel.as_raw() >= channel_count {
            return Err(Error::InvalidChannel {
                channel,
                channel_count,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Offer
    // =========================================================================

    /// Appends `values` to the tail of `page`.
    ///
    /// Values are stored one at a time while they fit. A value that would
    /// push the page past its capacity seals the page instead and is left
    /// for the next page; the first value of an empty page is always taken.
    pub fn offer(
        &mut self,
        channel: ChannelId,
        page: PageId,
        values: Vec<Vec<u8>>,
        notify_on_full: Option<NotifierId>,
        seal: bool,
    ) -> Result<OfferResult> {
        self.step(|engine| engine.offer_to_page_tail(channel, page, values, notify_on_full, seal))
    }

    fn offer_to_page_tail(
        &mut self,
        channel: ChannelId,
        page_id: PageId,
        values: Vec<Vec<u8>>,
        notify_on_full: Option<NotifierId>,
        seal: bool,
    ) -> Result<OfferResult> {
        self.check_channel(channel)?;
        self.stats.offers += 1;

        let capacity = self.config.effective_page_capacity(notify_on_full.is_some());
        let key = PageKey::new(channel, page_id);

        let mut page = match self.store.page(key).cloned() {
            Some(page) => page,
            None => match self.ensure_page(channel, page_id) {
                Some(page) => page,
                // Created before and since removed; it cannot come back.
                None => return Ok(OfferResult::sealed(0)),
            },
        };

        if page.sealed {
            return Ok(OfferResult::sealed(0));
        }

        if page.is_empty() && !page.is_subscribed() && !self.config.retain_consumed {
            // Nobody can ever read this page: accept and drop the values.
            page.sealed = true;
            self.store.put_page(key, page);
            self.remove_page_inner(channel, page_id);
            self.stats.elements_discarded += values.len() as u64;
            debug!(
                partition = self.partition.as_raw(),
                channel = channel.as_raw(),
                page = page_id.as_raw(),
                "no subscribers, values discarded"
            );
            return Ok(OfferResult::sealed(values.len() as u32));
        }

        let server_capacity = self.config.server_capacity;
        if server_capacity > 0 {
            let used = self.storage_bytes.load(Ordering::SeqCst) as i64 + self.store.staged_byte_delta();
            if used >= server_capacity as i64 {
                if let Some(notifier) = notify_on_full {
                    self.request_removal_notification(channel, notifier);
                }
                self.seal_single_page_channels();
                self.stats.topic_full += 1;
                warn!(
                    partition = self.partition.as_raw(),
                    channel = channel.as_raw(),
                    used,
                    server_capacity,
                    "topic full"
                );
                return Ok(OfferResult::full(capacity));
            }
        }

        let now = current_time_ms();
        let expiry = self
            .config
            .element_expiry
            .map(|ttl| now + ttl.as_millis() as i64);

        let mut accepted = 0u32;
        let mut first_offset = EMPTY_TAIL;

        for value in values {
            let len = value.len() as u64;
            if !page.is_empty() && page.byte_size + len > capacity {
                page.sealed = true;
                break;
            }

            let offset = page.tail + 1;
            let ekey = ElementKey::new(channel, page_id, offset);
            self.store.put_element(
                ekey,
                Element {
                    channel,
                    page: page_id,
                    offset,
                    timestamp: now,
                    expiry,
                    value,
                },
            );

            if page.is_empty() {
                page.head_timestamp = now;
            }
            page.tail = offset;
            page.tail_timestamp = now;
            page.byte_size += len;

            if first_offset == EMPTY_TAIL {
                first_offset = offset;
            }
            accepted += 1;
        }

        if page.byte_size >= capacity || seal {
            page.sealed = true;
        }

        let notifiers = page.take_insertion_notifiers();
        self.store.fire_notifiers(notifiers);

        let sealed = page.sealed;
        // Space in the next page once this one is sealed.
        let remaining_capacity = if sealed {
            capacity
        } else {
            capacity.saturating_sub(page.byte_size)
        };
        self.store.put_page(key, page);
        self.stats.elements_accepted += accepted as u64;

        if sealed {
            debug!(
                partition = self.partition.as_raw(),
                channel = channel.as_raw(),
                page = page_id.as_raw(),
                "page sealed"
            );
        }

        Ok(OfferResult {
            status: if accepted > 0 {
                OfferStatus::Success
            } else {
                OfferStatus::PageSealed
            },
            accepted,
            remaining_capacity,
            first_offset,
            page_sealed: sealed,
        })
    }

    /// Seals every channel whose only page is its tail, waking its pollers,
    /// so consumers move on and free space.
    fn seal_single_page_channels(&mut self) {
        for channel in ChannelId::all(self.store.channel_count()) {
            let usage = self.store.usage(channel);
            if usage.tail.is_null() || usage.tail != usage.head {
                continue;
            }
            let key = PageKey::new(channel, usage.tail);
            if let Some(mut page) = self.store.page(key).cloned() {
                if page.sealed {
                    continue;
                }
                page.sealed = true;
                let notifiers = page.take_insertion_notifiers();
                self.store.fire_notifiers(notifiers);
                self.store.put_page(key, page);
            }
        }
    }

    // =========================================================================
    // Page Lifecycle
    // =========================================================================

    /// Creates `page_id` at the tail of the channel's chain.
    ///
    /// Returns `None` if the page was created before and has since been
    /// removed. The new page takes a chain reference from the old tail and
    /// one reference per waiting subscription.
    pub(crate) fn ensure_page(&mut self, channel: ChannelId, page_id: PageId) -> Option<Page> {
        let key = PageKey::new(channel, page_id);
        if let Some(page) = self.store.page(key) {
            return Some(page.clone());
        }

        let mut usage = self.store.usage(channel);
        if !usage.max.is_null() && page_id <= usage.max {
            return None;
        }

        let first_ever = usage.max.is_null();
        let mut page = Page::new();
        let prev_tail = usage.tail;

        usage.tail = page_id;
        usage.max = page_id;

        if prev_tail.is_null() {
            usage.head = page_id;
        } else {
            page.adjust_ref(1);
            page.prev = prev_tail;
            let prev_key = PageKey::new(channel, prev_tail);
            if let Some(mut prev) = self.store.page(prev_key).cloned() {
                prev.next = page_id;
                self.store.put_page(prev_key, prev);
            }
        }

        page.adjust_ref(usage.reset_waiting());

        if first_ever && channel != ChannelId::ZERO {
            // Groups that predate a channel-count increase have no
            // subscription here yet; they attach lazily on first poll.
            page.adjust_ref(self.groups_lacking_subscription(channel) as i32);
        }

        self.store.put_usage(channel, usage);
        self.store.put_page(key, page.clone());
        self.stats.pages_created += 1;

        debug!(
            partition = self.partition.as_raw(),
            channel = channel.as_raw(),
            page = page_id.as_raw(),
            refs = page.ref_count,
            "page created"
        );

        Some(page)
    }

    /// Initialised groups (known from channel 0) with no subscription in `channel`.
    pub(crate) fn groups_lacking_subscription(&self, channel: ChannelId) -> usize {
        self.store
            .groups_in_channel(ChannelId::ZERO)
            .into_iter()
            .filter(|group| {
                let zero = SubscriptionKey::new(ChannelId::ZERO, group.clone());
                let here = SubscriptionKey::new(channel, group.clone());
                self.store
                    .subscription(&zero)
                    .map_or(false, Subscription::is_initialized)
                    && self.store.subscription(&here).is_none()
            })
            .count()
    }

    /// Removes a page and all its elements.
    pub fn remove_page(&mut self, channel: ChannelId, page: PageId) -> Result<bool> {
        self.step(|engine| {
            engine.check_channel(channel)?;
            Ok(engine.remove_page_inner(channel, page))
        })
    }

    /// Removes a page unless consumed pages are retained.
    pub fn remove_page_if_not_retaining(&mut self, channel: ChannelId, page: PageId) -> Result<bool> {
        self.step(|engine| {
            engine.check_channel(channel)?;
            Ok(engine.remove_page_if_not_retaining_inner(channel, page))
        })
    }

    pub(crate) fn remove_page_if_not_retaining_inner(&mut self, channel: ChannelId, page: PageId) -> bool {
        if self.config.retain_consumed {
            return false;
        }
        self.remove_page_inner(channel, page)
    }

    /// Removes `page_id`, then keeps removing successors whose only
    /// reference was the chain reference of the page just removed.
    pub(crate) fn remove_page_inner(&mut self, channel: ChannelId, page_id: PageId) -> bool {
        let mut removed_any = false;
        let mut candidate = Some(page_id);

        while let Some(id) = candidate {
            match self.remove_single_page(channel, id) {
                Some(cascade) => {
                    removed_any = true;
                    candidate = cascade.filter(|_| !self.config.retain_consumed);
                }
                None => break,
            }
        }

        removed_any
    }

    /// Removes one page. Returns `None` if absent, otherwise the successor
    /// if releasing the chain reference dropped it to zero.
    fn remove_single_page(&mut self, channel: ChannelId, page_id: PageId) -> Option<Option<PageId>> {
        let key = PageKey::new(channel, page_id);
        let page = self.store.page(key).cloned()?;

        for offset in 0..=page.tail {
            self.store
                .delete_element(ElementKey::new(channel, page_id, offset));
        }
        self.store.delete_page(key);

        let mut usage = self.store.usage(channel);
        let prev_exists = !page.prev.is_null()
            && self.store.page(PageKey::new(channel, page.prev)).is_some();
        let mut cascade = None;

        if prev_exists {
            // Mid-chain removal: the predecessor takes over the link and
            // the chain reference on the successor.
            let prev_key = PageKey::new(channel, page.prev);
            if let Some(mut prev) = self.store.page(prev_key).cloned() {
                prev.next = page.next;
                self.store.put_page(prev_key, prev);
            }
            if let Some(mut next) = self.page_cloned(channel, page.next) {
                next.prev = page.prev;
                self.store.put_page(PageKey::new(channel, page.next), next);
            }
            if usage.tail == page_id {
                usage.tail = page.prev;
            }
        } else {
            if usage.tail == page_id {
                usage.head = PageId::NULL;
                usage.tail = PageId::NULL;
            } else {
                usage.head = page.next;
            }
            if let Some(mut next) = self.page_cloned(channel, page.next) {
                next.prev = PageId::NULL;
                if next.adjust_ref(-1) <= 0 {
                    cascade = Some(page.next);
                }
                self.store.put_page(PageKey::new(channel, page.next), next);
            }
        }

        let removal = usage.take_removal_notifiers();
        self.store.put_usage(channel, usage);
        self.store.fire_notifiers(removal);
        self.store.fire_notifiers(page.insertion_notifiers);
        self.stats.pages_removed += 1;

        debug!(
            partition = self.partition.as_raw(),
            channel = channel.as_raw(),
            page = page_id.as_raw(),
            "page removed"
        );

        Some(cascade)
    }

    pub(crate) fn page_cloned(&self, channel: ChannelId, page: PageId) -> Option<Page> {
        if page.is_null() {
            return None;
        }
        self.store.page(PageKey::new(channel, page)).cloned()
    }

    /// Adds a reference to an existing page.
    pub(crate) fn hold_page(&mut self, channel: ChannelId, page_id: PageId) {
        let key = PageKey::new(channel, page_id);
        if let Some(mut page) = self.store.page(key).cloned() {
            page.adjust_ref(1);
            self.store.put_page(key, page);
        }
    }

    /// Drops a reference, removing the page when it reaches zero.
    pub(crate) fn release_page(&mut self, channel: ChannelId, page_id: PageId) {
        let key = PageKey::new(channel, page_id);
        if let Some(mut page) = self.store.page(key).cloned() {
            let remaining = page.adjust_ref(-1);
            self.store.put_page(key, page);
            if remaining <= 0 {
                self.remove_page_if_not_retaining_inner(channel, page_id);
            }
        }
    }

    /// First existing page after `page` in this partition's chain.
    pub(crate) fn first_page_after(&self, channel: ChannelId, page: PageId) -> PageId {
        if let Some(existing) = self.page_cloned(channel, page) {
            return existing.next;
        }
        let usage = self.store.usage(channel);
        if !usage.head.is_null() && usage.head > page {
            usage.head
        } else {
            PageId::NULL
        }
    }

    // =========================================================================
    // Hold Windows
    // =========================================================================

    /// Pages a subscription currently holds: anchor through cursor page.
    pub(crate) fn hold_window(&self, channel: ChannelId, sub: &Subscription) -> Vec<PageId> {
        let mut pages = Vec::new();
        let mut current = sub.anchor;
        while !current.is_null() && current <= sub.page {
            match self.store.page(PageKey::new(channel, current)) {
                Some(page) => {
                    pages.push(current);
                    current = page.next;
                }
                None => break,
            }
        }
        pages
    }

    /// Moves holds from `old` to `new`: acquire first, then release in
    /// ascending page order.
    pub(crate) fn rehold(&mut self, channel: ChannelId, old: &[PageId], new: &[PageId]) {
        for page in new {
            if !old.contains(page) {
                self.hold_page(channel, *page);
            }
        }
        for page in old {
            if !new.contains(page) {
                self.release_page(channel, *page);
            }
        }
    }

    /// If the subscription was waiting and its page has since been created,
    /// attach to it. The page already carries this subscription's reference.
    pub(crate) fn resolve_waiting(&self, channel: ChannelId, sub: &mut Subscription) {
        if !sub.is_waiting() {
            return;
        }
        let next = self.first_page_after(channel, sub.page);
        if next.is_null() {
            return;
        }
        sub.page = next;
        sub.position = 0;
        if sub.anchor.is_null() {
            sub.anchor = next;
        }
    }

    /// Registers a waiting slot for `sub`, to be turned into a reference on
    /// the next created page.
    pub(crate) fn start_waiting(&mut self, channel: ChannelId, sub: &mut Subscription) {
        let mut usage = self.store.usage(channel);
        usage.waiting += 1;
        self.store.put_usage(channel, usage);
        sub.position = NULL_OFFSET;
    }

    /// Gives back a waiting slot.
    pub(crate) fn stop_waiting(&mut self, channel: ChannelId) {
        let mut usage = self.store.usage(channel);
        usage.waiting = (usage.waiting - 1).max(0);
        self.store.put_usage(channel, usage);
    }

    // =========================================================================
    // Poll
    // =========================================================================

    /// Reads up to `max_elements` from `request.page` for the group.
    pub fn poll(&mut self, request: &PollRequest) -> Result<PollResult> {
        self.step(|engine| engine.poll_from_page_head(request))
    }

    fn poll_from_page_head(&mut self, req: &PollRequest) -> Result<PollResult> {
        self.check_channel(req.channel)?;
        self.stats.polls += 1;

        let channel = req.channel;
        let channel_count = self.store.channel_count();
        if req.channel_count != channel_count {
            warn!(
                partition = self.partition.as_raw(),
                expected = req.channel_count,
                actual = channel_count,
                "poll with stale channel count"
            );
            return Ok(PollResult::bare(PollStatus::UnknownSubscriber, PageId::NULL));
        }

        let sub_key = SubscriptionKey::new(channel, req.group.clone());
        let mut sub = match self.store.subscription(&sub_key).cloned() {
            Some(sub) => sub,
            None => match self.lazy_subscription(channel, &req.group) {
                Some(sub) => {
                    self.store.put_subscription(sub_key.clone(), sub.clone());
                    sub
                }
                None => return Ok(PollResult::bare(PollStatus::UnknownSubscriber, PageId::NULL)),
            },
        };
        let head = sub.subscription_head;

        if !sub.is_owned_by(req.subscriber) {
            return Ok(PollResult::bare(PollStatus::NotAllocated, head));
        }

        self.resolve_waiting(channel, &mut sub);

        if req.page < sub.page
            || (req.page == sub.page && (req.page.is_null() || sub.is_waiting()))
        {
            self.store.put_subscription(sub_key, sub);
            return Ok(PollResult::bare(PollStatus::Exhausted, head));
        }

        if req.page > sub.page {
            if self.store.page(PageKey::new(channel, req.page)).is_none() {
                if self.ensure_page(channel, req.page).is_none() {
                    // Removed before this group got to it.
                    self.store.put_subscription(sub_key, sub);
                    return Ok(PollResult::bare(PollStatus::Exhausted, head));
                }
                self.resolve_waiting(channel, &mut sub);
            }
            if req.page > sub.page {
                self.advance_cursor(channel, &mut sub, req.page);
            }
        }

        let page_key = PageKey::new(channel, req.page);
        let page = match self.store.page(page_key).cloned() {
            Some(page) => page,
            None => {
                self.store.put_subscription(sub_key, sub);
                return Ok(PollResult::bare(PollStatus::Exhausted, head));
            }
        };

        let filter = self.functions.filter(sub.filter.as_deref())?;
        let transform = self.functions.transform(sub.transform.as_deref())?;
        let byte_limit = self.config.max_batch_bytes;
        let now = current_time_ms();

        let mut elements = Vec::new();
        let mut wanted = req.max_elements;
        let mut bytes = 0u64;
        let mut pos = sub.position;

        while wanted > 0 && pos <= page.tail && bytes < byte_limit {
            if let Some(element) = self.store.element(ElementKey::new(channel, req.page, pos)) {
                let visible =
                    !element.is_expired(now) && filter.as_ref().map_or(true, |f| f(element));
                if visible {
                    let value = match &transform {
                        Some(t) => t(&element.value),
                        None => Some(element.value.clone()),
                    };
                    if let Some(value) = value {
                        bytes += value.len() as u64;
                        elements.push(Element {
                            value,
                            ..element.clone()
                        });
                        wanted -= 1;
                    }
                }
            }
            pos += 1;
        }

        self.stats.elements_polled += elements.len() as u64;

        if pos > page.tail && page.sealed {
            if page.next.is_null() {
                self.start_waiting(channel, &mut sub);
            } else {
                let old = self.hold_window(channel, &sub);
                sub.page = page.next;
                sub.position = 0;
                let new = self.hold_window(channel, &sub);
                self.rehold(channel, &old, &new);
            }
            self.store.put_subscription(sub_key, sub);
            return Ok(PollResult {
                status: PollStatus::Exhausted,
                next_offset: pos,
                elements,
                subscription_head: head,
            });
        }

        sub.position = pos;
        if pos > page.tail {
            if let Some(notifier) = req.notifier {
                self.request_insertion_notification(page_key, notifier);
            }
        }
        self.store.put_subscription(sub_key, sub);

        Ok(PollResult {
            status: PollStatus::Remaining((page.tail - pos + 1).max(0) as u32),
            next_offset: pos,
            elements,
            subscription_head: head,
        })
    }

    /// Moves a non-waiting cursor forward to `target`, holding every page
    /// passed over.
    pub(crate) fn advance_cursor(&mut self, channel: ChannelId, sub: &mut Subscription, target: PageId) {
        let old = self.hold_window(channel, sub);
        sub.page = target;
        sub.position = 0;
        if sub.anchor.is_null() {
            sub.anchor = target;
        }
        let new = self.hold_window(channel, sub);
        self.rehold(channel, &old, &new);
    }

    /// Builds the subscription of an initialised group in a channel added
    /// after the group was created.
    pub(crate) fn lazy_subscription(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
    ) -> Option<Subscription> {
        let zero = self
            .store
            .subscription(&SubscriptionKey::new(ChannelId::ZERO, group.clone()))?
            .clone();
        if !zero.is_initialized() {
            return None;
        }

        let mut sub = Subscription::new(zero.filter.clone(), zero.transform.clone());
        sub.subscription_head = zero.subscription_head;
        sub.owner = zero
            .allocations
            .iter()
            .find(|(_, channels)| channels.contains(&channel))
            .map(|(subscriber, _)| *subscriber);

        let mut usage = self.store.usage(channel);
        if group.is_anonymous() {
            usage.anonymous_groups.insert(group.clone());
        }

        if !usage.max.is_null() && !usage.head.is_null() {
            // The channel's first page was seeded with our reference.
            sub.page = usage.head;
            sub.position = 0;
            sub.anchor = usage.head;
            self.store.put_usage(channel, usage);
        } else {
            sub.page = usage.max;
            self.store.put_usage(channel, usage);
            self.start_waiting(channel, &mut sub);
        }

        debug!(
            partition = self.partition.as_raw(),
            channel = channel.as_raw(),
            group = %group,
            "subscription attached to new channel"
        );
        Some(sub)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub(crate) fn request_insertion_notification(&mut self, key: PageKey, notifier: NotifierId) {
        if let Some(mut page) = self.store.page(key).cloned() {
            page.add_insertion_notifier(notifier);
            self.store.put_page(key, page);
            self.store.register_notifier(notifier);
        }
    }

    pub(crate) fn request_removal_notification(&mut self, channel: ChannelId, notifier: NotifierId) {
        let mut usage = self.store.usage(channel);
        usage.add_removal_notifier(notifier);
        self.store.put_usage(channel, usage);
        self.store.register_notifier(notifier);
    }

    pub fn is_notifier_registered(&self, notifier: NotifierId) -> bool {
        self.registry.is_registered(notifier)
    }

    // =========================================================================
    // Topic Shape and Introspection
    // =========================================================================

    /// Raises the channel count. Lower or equal counts are ignored.
    pub fn increase_channel_count(&mut self, count: u32) -> Result<u32> {
        self.step(|engine| {
            if count > engine.store.channel_count() {
                engine.store.set_channel_count(count);
            }
            Ok(engine.store.channel_count())
        })
    }

    pub fn usage(&self, channel: ChannelId) -> Usage {
        self.store.usage(channel)
    }

    pub fn page(&self, channel: ChannelId, page: PageId) -> Option<Page> {
        self.page_cloned(channel, page)
    }

    pub fn subscription(&self, channel: ChannelId, group: &SubscriberGroupId) -> Option<Subscription> {
        self.store
            .subscription(&SubscriptionKey::new(channel, group.clone()))
            .cloned()
    }

    /// Partition-local bytes stored.
    pub fn byte_size(&self) -> u64 {
        self.store.byte_size()
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) fn engine_for_tests(config: TopicConfig) -> PartitionEngine {
    engine_with_functions(config, FunctionRegistry::new())
}

#[cfg(test)]
pub(crate) fn engine_with_functions(config: TopicConfig, functions: FunctionRegistry) -> PartitionEngine {
    PartitionEngine::open(
        PartitionId::from_raw(0),
        Arc::new(config),
        Arc::new(functions),
        Database::open_in_memory().expect("in-memory db"),
        NotificationHub::new(),
        Arc::new(AtomicU64::new(0)),
    )
    .expect("engine should open")
}

// =============================================================================
// Tests
// =============================================================================
