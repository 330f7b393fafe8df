//! # Subscription Protocol
//!
//! Group initialisation, commit, seek, unsubscribe and channel ownership,
//! implemented as further steps on [`PartitionEngine`].
//!
//! ## Three-Phase Initialisation
//!
//! A group must start at the same page in every partition, but partitions
//! cannot see each other. Initialisation is therefore a small protocol run
//! by a coordinator ([`crate::subscriber`]) under a per-group lock:
//!
//! ```text
//!  coordinator                   partition 0 .. partition N-1
//!      │   INQUIRE ─────────────────►  initialised?  ── yes: resume pages
//!      │◄──────────────── None ──────  (any partition says no)
//!      │   lock(group)
//!      │   PIN ─────────────────────►  create subscriptions, hold the
//!      │◄──────────── pinned pages ──  head/tail page so it cannot vanish
//!      │   heads = combine(pinned)
//!      │   ADVANCE(heads) ──────────►  move cursors forward to heads,
//!      │   unlock(group)               record subscription_head
//! ```
//!
//! PIN and ADVANCE are idempotent per partition. A coordinator that dies
//! between them leaves pinned but uninitialised subscriptions, which the
//! next coordinator finishes.
//!
//! ## Commit and the Hold Window
//!
//! Commit moves a subscription's anchor forward and releases the pages it
//! no longer needs, lowest page first. Releasing can cascade into page
//! removal (see [`crate::partition`]).

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::Subscription;
use crate::partition::PartitionEngine;
use crate::types::{
    ChannelId, ElementKey, PageId, PageKey, Position, SubscriberGroupId, SubscriberId,
    SubscriptionKey, NULL_OFFSET,
};

// =============================================================================
// Request and Result Types
// =============================================================================

/// Phase of [`PartitionEngine::ensure_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribePhase {
    /// Report resume pages if every channel is initialised.
    Inquire,
    /// Create missing subscriptions and pin their starting pages.
    Pin,
    /// Move cursors to the agreed heads, indexed by channel.
    Advance(Vec<PageId>),
}

/// Outcome class of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    AlreadyCommitted,
    /// The partition has no read page at or below the position.
    NothingToCommit,
    /// The position is invalid or has not been read yet.
    Rejected,
    /// Another subscriber owns the channel.
    Unowned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub status: CommitStatus,
    pub committed: Option<Position>,
    pub rollback: Option<Position>,
}

impl CommitResult {
    fn status(status: CommitStatus, sub: Option<&Subscription>) -> Self {
        Self {
            status,
            committed: sub.and_then(|s| s.committed),
            rollback: sub.and_then(|s| s.rollback),
        }
    }
}

/// Where a seek should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    /// The head becomes the element after this position.
    Position(Position),
    /// The head becomes the first element published after this time (ms).
    Timestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStatus {
    Seeked,
    NotAllocated,
    UnknownSubscriber,
}

/// Result of a seek in one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekResult {
    pub status: SeekStatus,
    /// Next element to read, `None` if the cursor now waits past the tail.
    pub head: Option<Position>,
    /// Element immediately before the head.
    pub seeked_to: Option<Position>,
    /// Last stored element of the channel in this partition.
    pub tail: Option<Position>,
}

impl SeekResult {
    fn status(status: SeekStatus) -> Self {
        Self {
            status,
            head: None,
            seeked_to: None,
            tail: None,
        }
    }
}

/// Committed and rollback positions of a group in one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHead {
    pub channel: ChannelId,
    pub committed: Option<Position>,
    pub rollback: Option<Position>,
}

// =============================================================================
// Protocol Steps
// =============================================================================

impl PartitionEngine {
    /// Runs one phase of group initialisation.
    ///
    /// Returns `None` from [`SubscribePhase::Inquire`] when any channel is
    /// not initialised. Otherwise returns one page per channel: resume
    /// pages for INQUIRE, pinned pages (NULL while waiting) for PIN, the
    /// heads for ADVANCE.
    pub fn ensure_subscription(
        &mut self,
        group: &SubscriberGroupId,
        phase: SubscribePhase,
        filter: Option<&str>,
        transform: Option<&str>,
    ) -> Result<Option<Vec<PageId>>> {
        self.functions.check(filter, transform)?;
        self.step(|engine| match phase {
            SubscribePhase::Inquire => engine.inquire(group, filter, transform),
            SubscribePhase::Pin => engine.pin(group, filter, transform).map(Some),
            SubscribePhase::Advance(heads) => engine.advance(group, &heads).map(Some),
        })
    }

    fn inquire(
        &mut self,
        group: &SubscriberGroupId,
        filter: Option<&str>,
        transform: Option<&str>,
    ) -> Result<Option<Vec<PageId>>> {
        self.cleanup_subscriber_registrations();

        let channels: Vec<ChannelId> = ChannelId::all(self.store.channel_count()).collect();
        let mut pages = Vec::with_capacity(channels.len());

        for channel in channels {
            let key = SubscriptionKey::new(channel, group.clone());
            let mut sub = match self.store.subscription(&key) {
                Some(sub) if sub.is_initialized() => sub.clone(),
                _ => return Ok(None),
            };
            if !sub.same_functions(filter, transform) {
                return Err(Error::FilterMismatch {
                    group: group.name().to_string(),
                });
            }

            self.resolve_waiting(channel, &mut sub);
            let page = match sub.rollback {
                Some(rollback) => rollback.page,
                None if !sub.is_waiting() => sub.page,
                None if !sub.page.is_null() => sub.page.next(),
                None => sub.subscription_head,
            };
            pages.push(page);
            self.store.put_subscription(key, sub);
        }

        Ok(Some(pages))
    }

    fn pin(
        &mut self,
        group: &SubscriberGroupId,
        filter: Option<&str>,
        transform: Option<&str>,
    ) -> Result<Vec<PageId>> {
        let channels: Vec<ChannelId> = ChannelId::all(self.store.channel_count()).collect();
        let group_known = self
            .store
            .subscription(&SubscriptionKey::new(ChannelId::ZERO, group.clone()))
            .map_or(false, Subscription::is_initialized);
        let mut pinned = Vec::with_capacity(channels.len());

        for channel in channels {
            let key = SubscriptionKey::new(channel, group.clone());

            if let Some(existing) = self.store.subscription(&key) {
                if !existing.same_functions(filter, transform) {
                    return Err(Error::FilterMismatch {
                        group: group.name().to_string(),
                    });
                }
                let mut sub = existing.clone();
                self.resolve_waiting(channel, &mut sub);
                pinned.push(if sub.is_waiting() { PageId::NULL } else { sub.page });
                self.store.put_subscription(key, sub);
                continue;
            }

            let sub = if group_known && channel != ChannelId::ZERO {
                match self.lazy_subscription(channel, group) {
                    Some(sub) => sub,
                    None => self.pin_fresh(channel, group, filter, transform),
                }
            } else {
                self.pin_fresh(channel, group, filter, transform)
            };

            pinned.push(if sub.is_waiting() { PageId::NULL } else { sub.page });
            self.store.put_subscription(key, sub);
        }

        debug!(
            partition = self.partition.as_raw(),
            group = %group,
            "group pinned"
        );
        Ok(pinned)
    }

    /// A brand-new subscription holding the head page (retaining) or the
    /// tail page, or waiting for the first page.
    fn pin_fresh(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        filter: Option<&str>,
        transform: Option<&str>,
    ) -> Subscription {
        let mut sub = Subscription::new(filter.map(str::to_string), transform.map(str::to_string));
        let mut usage = self.store.usage(channel);

        if group.is_anonymous() {
            usage.anonymous_groups.insert(group.clone());
            self.store.put_usage(channel, usage.clone());
        }

        let page = if self.config.retain_consumed {
            usage.head
        } else {
            usage.tail
        };

        if page.is_null() {
            sub.page = usage.max;
            self.start_waiting(channel, &mut sub);
        } else {
            self.hold_page(channel, page);
            sub.page = page;
            sub.position = 0;
            sub.anchor = page;
        }
        sub
    }

    fn advance(&mut self, group: &SubscriberGroupId, heads: &[PageId]) -> Result<Vec<PageId>> {
        let retain = self.config.retain_consumed;

        for channel in ChannelId::all(self.store.channel_count()) {
            let target = heads.get(channel.index()).copied().unwrap_or(PageId::NULL);
            let key = SubscriptionKey::new(channel, group.clone());
            let mut sub = match self.store.subscription(&key) {
                Some(sub) if !sub.is_initialized() => sub.clone(),
                _ => continue,
            };
            if target.is_null() {
                continue;
            }

            self.resolve_waiting(channel, &mut sub);

            while !sub.is_waiting() && sub.page < target {
                let Some(page) = self.page_cloned(channel, sub.page) else {
                    break;
                };
                let old = self.hold_window(channel, &sub);
                if page.next.is_null() {
                    // Nothing published here up to the head yet.
                    self.start_waiting(channel, &mut sub);
                    sub.anchor = PageId::NULL;
                    self.rehold(channel, &old, &[]);
                    break;
                }
                sub.page = page.next;
                sub.anchor = page.next;
                sub.position = 0;
                let new = self.hold_window(channel, &sub);
                self.rehold(channel, &old, &new);
            }

            if !sub.is_waiting() && sub.page == target {
                sub.position = match self.page_cloned(channel, sub.page) {
                    Some(page) if !retain => page.tail + 1,
                    _ => 0,
                };
            }

            sub.subscription_head = target;
            self.store.put_subscription(key, sub);
        }

        info!(
            partition = self.partition.as_raw(),
            group = %group,
            "group initialised"
        );
        Ok(heads.to_vec())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commits the group's progress in `channel` up to `position`.
    pub fn commit(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        position: Position,
    ) -> Result<CommitResult> {
        self.step(|engine| {
            engine.check_channel(channel)?;
            Ok(engine.commit_subscription(channel, group, subscriber, position))
        })
    }

    fn commit_subscription(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        target: Position,
    ) -> CommitResult {
        let key = SubscriptionKey::new(channel, group.clone());
        let Some(mut sub) = self.store.subscription(&key).cloned() else {
            return CommitResult::status(CommitStatus::NothingToCommit, None);
        };
        self.resolve_waiting(channel, &mut sub);

        if !sub.is_owned_by(subscriber) {
            return CommitResult::status(CommitStatus::Unowned, Some(&sub));
        }
        if !target.is_valid() {
            return CommitResult::status(CommitStatus::Rejected, Some(&sub));
        }
        if sub.committed.map_or(false, |committed| target <= committed) {
            return CommitResult::status(CommitStatus::AlreadyCommitted, Some(&sub));
        }

        if self.is_unread(channel, &sub, target) {
            return CommitResult::status(CommitStatus::Rejected, Some(&sub));
        }

        // Latest element read here at or below the target. A cursor page
        // with nothing read yet, or an empty sealed page, defers to the
        // page before it.
        let window = self.hold_window(channel, &sub);
        let read = window
            .iter()
            .rev()
            .copied()
            .filter(|p| *p <= target.page)
            .find_map(|local| {
                let page = self.page_cloned(channel, local)?;
                let last_read = if local == sub.page && !sub.is_waiting() {
                    sub.position - 1
                } else {
                    page.tail
                };
                let offset = if local == target.page {
                    target.offset.min(last_read)
                } else {
                    last_read
                };
                (offset >= 0).then_some((local, page, offset))
            });
        let Some((local, page, offset)) = read else {
            return CommitResult::status(CommitStatus::NothingToCommit, Some(&sub));
        };

        let committed = Position::new(local, offset);
        if sub.committed.map_or(false, |c| committed <= c) {
            return CommitResult::status(CommitStatus::AlreadyCommitted, Some(&sub));
        }

        let fully_consumed = page.sealed && offset >= page.tail;
        let rollback = if fully_consumed {
            if page.next.is_null() {
                Position::new(local, page.tail + 1)
            } else {
                Position::new(page.next, 0)
            }
        } else {
            Position::new(local, offset + 1)
        };

        let new_anchor = if local == sub.page {
            if fully_consumed && sub.is_waiting() {
                PageId::NULL
            } else {
                local
            }
        } else if fully_consumed {
            page.next
        } else {
            local
        };

        sub.committed = Some(committed);
        sub.rollback = Some(rollback);
        sub.anchor = new_anchor;
        let new_window = self.hold_window(channel, &sub);
        self.rehold(channel, &window, &new_window);

        debug!(
            partition = self.partition.as_raw(),
            channel = channel.as_raw(),
            group = %group,
            committed = %committed,
            "committed"
        );

        let result = CommitResult {
            status: CommitStatus::Committed,
            committed: sub.committed,
            rollback: sub.rollback,
        };
        self.store.put_subscription(key, sub);
        result
    }

    /// True if `target` lives in this partition and the cursor has not
    /// read it yet. Pages routed elsewhere are judged by their own
    /// partition.
    fn is_unread(&self, channel: ChannelId, sub: &Subscription, target: Position) -> bool {
        if target.page.partition(channel, self.config.partition_count) != self.partition {
            return false;
        }
        if sub.is_waiting() {
            return target.page > sub.page;
        }
        target.page > sub.page || (target.page == sub.page && target.offset >= sub.position)
    }

    // =========================================================================
    // Seek
    // =========================================================================

    /// Moves the group's cursor so the next element read follows `position`.
    pub fn seek_position(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        position: Position,
    ) -> Result<SeekResult> {
        if !position.is_valid() {
            return Err(Error::InvalidPosition(position));
        }
        self.seek(channel, group, subscriber, SeekTarget::Position(position))
    }

    /// Moves the group's cursor to the first element published after
    /// `timestamp_ms`.
    pub fn seek_timestamp(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        timestamp_ms: i64,
    ) -> Result<SeekResult> {
        self.seek(channel, group, subscriber, SeekTarget::Timestamp(timestamp_ms))
    }

    pub fn seek(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        target: SeekTarget,
    ) -> Result<SeekResult> {
        self.step(|engine| {
            engine.check_channel(channel)?;
            Ok(engine.seek_subscription(channel, group, subscriber, target))
        })
    }

    fn seek_subscription(
        &mut self,
        channel: ChannelId,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        target: SeekTarget,
    ) -> SeekResult {
        let key = SubscriptionKey::new(channel, group.clone());
        let mut sub = match self.store.subscription(&key).cloned() {
            Some(sub) => sub,
            None => match self.lazy_subscription(channel, group) {
                Some(sub) => {
                    self.store.put_subscription(key.clone(), sub.clone());
                    sub
                }
                None => return SeekResult::status(SeekStatus::UnknownSubscriber),
            },
        };
        if !sub.is_owned_by(subscriber) {
            return SeekResult::status(SeekStatus::NotAllocated);
        }

        self.resolve_waiting(channel, &mut sub);
        let was_waiting = sub.is_waiting();
        let old = self.hold_window(channel, &sub);

        let head = match target {
            SeekTarget::Position(position) => self.head_after_position(channel, sub.page, position),
            SeekTarget::Timestamp(ts) => self.head_after_timestamp(channel, ts),
        };
        let usage = self.store.usage(channel);
        let tail = self.last_element(channel, usage.tail);

        let seeked_to = match head {
            Some(head) => {
                sub.page = head.page;
                sub.position = head.offset;
                if sub.anchor.is_null() || head.page < sub.anchor {
                    sub.anchor = head.page;
                }
                self.position_before(channel, head)
            }
            None => {
                if usage.tail.is_null() {
                    sub.page = usage.max;
                    sub.anchor = PageId::NULL;
                } else {
                    sub.page = usage.tail;
                }
                sub.position = NULL_OFFSET;
                tail
            }
        };

        if let (Some(head), Some(committed)) = (head, sub.committed) {
            if head <= committed {
                sub.committed = seeked_to;
                sub.rollback = Some(head);
            }
        }

        let new = self.hold_window(channel, &sub);
        self.rehold(channel, &old, &new);

        match (was_waiting, sub.is_waiting()) {
            (true, false) => self.stop_waiting(channel),
            (false, true) => self.start_waiting(channel, &mut sub),
            _ => {}
        }

        debug!(
            partition = self.partition.as_raw(),
            channel = channel.as_raw(),
            group = %group,
            head = ?head,
            "seeked"
        );

        self.store.put_subscription(key, sub);
        SeekResult {
            status: SeekStatus::Seeked,
            head,
            seeked_to,
            tail,
        }
    }

    /// First local page at or after `target`, walking the chain from `hint`
    /// backwards or forwards as needed.
    fn first_page_at_or_after(&self, channel: ChannelId, hint: PageId, target: PageId) -> PageId {
        let mut current = match self.page_cloned(channel, hint) {
            Some(_) => hint,
            None => self.store.usage(channel).head,
        };

        while let Some(page) = self.page_cloned(channel, current) {
            if page.prev.is_null() || page.prev < target || self.page_cloned(channel, page.prev).is_none() {
                break;
            }
            current = page.prev;
        }

        while !current.is_null() && current < target {
            current = match self.page_cloned(channel, current) {
                Some(page) => page.next,
                None => PageId::NULL,
            };
        }
        current
    }

    fn head_after_position(&self, channel: ChannelId, hint: PageId, target: Position) -> Option<Position> {
        let page_id = self.first_page_at_or_after(channel, hint, target.page);
        let page = self.page_cloned(channel, page_id)?;

        if page_id != target.page {
            return Some(Position::new(page_id, 0));
        }
        let offset = target.offset + 1;
        if offset > page.tail && page.sealed {
            return self
                .page_cloned(channel, page.next)
                .map(|_| Position::new(page.next, 0));
        }
        Some(Position::new(page_id, offset))
    }

    fn head_after_timestamp(&self, channel: ChannelId, timestamp_ms: i64) -> Option<Position> {
        let mut current = self.store.usage(channel).head;

        while let Some(page) = self.page_cloned(channel, current) {
            if !page.is_empty() && page.tail_timestamp > timestamp_ms {
                for offset in 0..=page.tail {
                    let key = ElementKey::new(channel, current, offset);
                    if let Some(element) = self.store.element(key) {
                        if element.timestamp > timestamp_ms {
                            return Some(Position::new(current, offset));
                        }
                    }
                }
            }
            if page.next.is_null() && !page.sealed {
                // Everything stored is older; read whatever comes next here.
                return Some(Position::new(current, page.tail + 1));
            }
            current = page.next;
        }
        None
    }

    fn position_before(&self, channel: ChannelId, head: Position) -> Option<Position> {
        if head.offset > 0 {
            return Some(Position::new(head.page, head.offset - 1));
        }
        let page = self.page_cloned(channel, head.page)?;
        self.last_element(channel, page.prev)
    }

    fn last_element(&self, channel: ChannelId, page_id: PageId) -> Option<Position> {
        self.page_cloned(channel, page_id)
            .filter(|page| !page.is_empty())
            .map(|page| Position::new(page_id, page.tail))
    }

    // =========================================================================
    // Unsubscribe and Cleanup
    // =========================================================================

    /// Removes every subscription of the group in this partition.
    pub fn remove_subscription(&mut self, group: &SubscriberGroupId) -> Result<bool> {
        self.step(|engine| Ok(engine.remove_group(group)))
    }

    fn remove_group(&mut self, group: &SubscriberGroupId) -> bool {
        let group_known = self
            .store
            .subscription(&SubscriptionKey::new(ChannelId::ZERO, group.clone()))
            .map_or(false, Subscription::is_initialized);

        // Channel 0 last: lazily attaching other channels reads it.
        let mut channels: Vec<ChannelId> = ChannelId::all(self.store.channel_count()).collect();
        channels.reverse();

        let mut removed = false;
        for channel in channels {
            let key = SubscriptionKey::new(channel, group.clone());
            let sub = match self.store.subscription(&key).cloned() {
                Some(sub) => Some(sub),
                None if group_known
                    && channel != ChannelId::ZERO
                    && !self.store.usage(channel).max.is_null() =>
                {
                    // Release the reference seeded by the channel's first page.
                    self.lazy_subscription(channel, group)
                }
                None => None,
            };

            if let Some(sub) = sub {
                self.detach(channel, group, sub);
                removed = true;
            }
        }

        if removed {
            info!(
                partition = self.partition.as_raw(),
                group = %group,
                "subscription removed"
            );
        }
        removed
    }

    fn detach(&mut self, channel: ChannelId, group: &SubscriberGroupId, mut sub: Subscription) {
        self.resolve_waiting(channel, &mut sub);
        if sub.is_waiting() {
            self.stop_waiting(channel);
        }
        let window = self.hold_window(channel, &sub);
        self.rehold(channel, &window, &[]);

        let mut usage = self.store.usage(channel);
        if usage.anonymous_groups.remove(group) {
            self.store.put_usage(channel, usage);
        }
        self.store
            .delete_subscription(SubscriptionKey::new(channel, group.clone()));
    }

    /// Removes anonymous groups whose creating member is not in `live_members`.
    pub fn cleanup_anonymous_groups(&mut self, live_members: &[u64]) -> Result<usize> {
        self.step(|engine| Ok(engine.cleanup_anonymous_groups_inner(live_members)))
    }

    pub(crate) fn cleanup_anonymous_groups_inner(&mut self, live_members: &[u64]) -> usize {
        let mut stale = BTreeSet::new();
        for channel in ChannelId::all(self.store.channel_count()) {
            for group in self.store.usage(channel).anonymous_groups {
                if !live_members.contains(&group.member()) {
                    stale.insert(group);
                }
            }
        }

        let count = stale.len();
        for group in stale {
            self.remove_group(&group);
        }
        count
    }

    /// Fires two adjacent insertion notifiers on every tail page that has
    /// collected at least two. Waiters that are still alive re-register on
    /// their next poll.
    fn cleanup_subscriber_registrations(&mut self) {
        let mut rng = rand::thread_rng();
        for channel in ChannelId::all(self.store.channel_count()) {
            let tail = self.store.usage(channel).tail;
            let Some(mut page) = self.page_cloned(channel, tail) else {
                continue;
            };
            if page.insertion_notifiers.len() < 2 {
                continue;
            }
            let first = rng.gen_range(0..page.insertion_notifiers.len() - 1);
            let fired: Vec<_> = page.insertion_notifiers.drain(first..first + 2).collect();
            self.store.put_page(PageKey::new(channel, tail), page);
            self.store.fire_notifiers(fired);
        }
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Records the group's channel allocation and the owner of each channel.
    pub fn update_channel_allocation(
        &mut self,
        group: &SubscriberGroupId,
        allocations: BTreeMap<SubscriberId, Vec<ChannelId>>,
    ) -> Result<()> {
        self.step(|engine| {
            for channel in allocations.values().flatten() {
                engine.check_channel(*channel)?;
            }

            let zero_key = SubscriptionKey::new(ChannelId::ZERO, group.clone());
            let mut zero = engine
                .store
                .subscription(&zero_key)
                .cloned()
                .ok_or_else(|| Error::UnknownGroup(group.name().to_string()))?;
            zero.allocations = allocations;
            engine.store.put_subscription(zero_key, zero.clone());

            for channel in ChannelId::all(engine.store.channel_count()) {
                let key = SubscriptionKey::new(channel, group.clone());
                if let Some(mut sub) = engine.store.subscription(&key).cloned() {
                    sub.owner = zero
                        .allocations
                        .iter()
                        .find(|(_, channels)| channels.contains(&channel))
                        .map(|(subscriber, _)| *subscriber);
                    if channel == ChannelId::ZERO {
                        sub.allocations = zero.allocations.clone();
                    }
                    engine.store.put_subscription(key, sub);
                }
            }
            Ok(())
        })
    }

    /// Drops a departed subscriber from the allocation and ownership.
    pub fn remove_subscriber(&mut self, group: &SubscriberGroupId, subscriber: SubscriberId) -> Result<bool> {
        self.step(|engine| {
            let mut changed = false;
            for channel in ChannelId::all(engine.store.channel_count()) {
                let key = SubscriptionKey::new(channel, group.clone());
                let Some(mut sub) = engine.store.subscription(&key).cloned() else {
                    continue;
                };
                let mut touched = sub.allocations.remove(&subscriber).is_some();
                if sub.owner == Some(subscriber) {
                    sub.owner = None;
                    touched = true;
                }
                if touched {
                    engine.store.put_subscription(key, sub);
                    changed = true;
                }
            }
            Ok(changed)
        })
    }

    /// Committed and rollback positions of the group per channel.
    pub fn heads(&self, group: &SubscriberGroupId) -> Vec<GroupHead> {
        ChannelId::all(self.store.channel_count())
            .filter_map(|channel| {
                self.store
                    .subscription(&SubscriptionKey::new(channel, group.clone()))
                    .map(|sub| GroupHead {
                        channel,
                        committed: sub.committed,
                        rollback: sub.rollback,
                    })
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
