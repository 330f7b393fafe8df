//! # Domain Types for Paged Topics
//!
//! Identifiers and keys used by the storage engine and the subscription
//! protocol. Every identifier is a newtype so a page id can never be passed
//! where a channel is expected.
//!
//! ## Addressing
//!
//! ```text
//!   topic
//!    ├── channel 0 ── page 7 ── page 8 ── page 9 ...   (global page sequence)
//!    ├── channel 1 ── page 7 ── page 8 ...
//!    └── ...
//!
//!   page p of channel c lives in partition (p + c) % partition_count
//! ```
//!
//! A channel's pages form one global sequence, but each partition only sees
//! the pages routed to it. Inside a partition those pages are linked by
//! `prev`/`next` page ids, never by pointers.
//!
//! ## Sentinels
//!
//! - [`PageId::NULL`] marks "no page"
//! - [`NULL_OFFSET`] marks "cursor not attached to any concrete offset"
//! - [`EMPTY_TAIL`] is the tail offset of a page with no elements

use std::fmt;

// =============================================================================
// Sentinels
// =============================================================================

/// Offset sentinel: the cursor is waiting for the next page to be created.
pub const NULL_OFFSET: i32 = i32::MAX;

/// Tail offset of a page that has no elements yet.
pub const EMPTY_TAIL: i32 = -1;

// =============================================================================
// Partition and Channel
// =============================================================================

/// A shard of the topic's storage. Each partition is served by one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PartitionId(u32);

impl PartitionId {
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the topic's parallel, independently ordered sub-streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Channel 0 also carries the group's channel allocation.
    pub const ZERO: Self = Self(0);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterates channels `0..count`.
    pub fn all(count: u32) -> impl Iterator<Item = ChannelId> {
        (0..count).map(ChannelId)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Page
// =============================================================================

/// Page identifier within a channel.
///
/// Page ids are global per channel and strictly increasing: a publisher
/// moves from page `p` to `p + 1` when `p` is sealed. A partition only ever
/// sees the subsequence routed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(i64);

impl PageId {
    /// No page. Sorts before every real page.
    pub const NULL: Self = Self(-1);

    pub const fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> i64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 < 0
    }

    /// The next page in the channel's global sequence.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The partition this page of `channel` is routed to.
    pub fn partition(self, channel: ChannelId, partition_count: u32) -> PartitionId {
        let slot = (self.0 + channel.0 as i64).rem_euclid(partition_count as i64);
        PartitionId(slot as u32)
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// First page id of every channel of the named topic.
///
/// Spreading the starting page by topic name keeps many small topics from
/// all landing on partition 0.
pub fn base_page(topic_name: &str, partition_count: u32) -> PageId {
    let hash = xxhash_rust::xxh3::xxh3_64(topic_name.as_bytes());
    PageId((hash % partition_count.max(1) as u64) as i64)
}

// =============================================================================
// Position
// =============================================================================

/// A (page, offset) pair. Ordered by page, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Position {
    pub page: PageId,
    pub offset: i32,
}

impl Position {
    pub const fn new(page: PageId, offset: i32) -> Self {
        Self { page, offset }
    }

    /// A position that can be committed or sought to.
    pub fn is_valid(&self) -> bool {
        !self.page.is_null() && self.offset >= 0 && self.offset != NULL_OFFSET
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == NULL_OFFSET {
            write!(f, "({}, -)", self.page)
        } else {
            write!(f, "({}, {})", self.page, self.offset)
        }
    }
}

// =============================================================================
// Subscribers
// =============================================================================

/// Identity of a subscriber group.
///
/// Durable groups are identified by name alone and survive their members.
/// Anonymous groups carry the creating member's id (non-zero) and are
/// removed when that member is gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberGroupId {
    name: String,
    member: u64,
}

impl SubscriberGroupId {
    /// A durable, named group.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            member: 0,
        }
    }

    /// An anonymous group owned by `member`. A zero member id is bumped to 1
    /// so the group never reads as durable.
    pub fn anonymous(member: u64) -> Self {
        let member = member.max(1);
        Self {
            name: format!("$anonymous-{member:016x}"),
            member,
        }
    }

    /// Rebuilds a group id from its stored parts.
    pub fn from_parts(name: impl Into<String>, member: u64) -> Self {
        Self {
            name: name.into(),
            member,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self) -> u64 {
        self.member
    }

    pub fn is_anonymous(&self) -> bool {
        self.member != 0
    }
}

impl fmt::Display for SubscriberGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identity of one subscriber instance inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// A fresh random identity.
    pub fn random() -> Self {
        Self(rand::random::<u64>().max(1))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A wake-up registration handle. Deleting its registration fires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifierId(u32);

impl NotifierId {
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NotifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Partition-local key of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub channel: ChannelId,
    pub page: PageId,
}

impl PageKey {
    pub const fn new(channel: ChannelId, page: PageId) -> Self {
        Self { channel, page }
    }
}

/// Partition-local key of a stored element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementKey {
    pub channel: ChannelId,
    pub page: PageId,
    pub offset: i32,
}

impl ElementKey {
    pub const fn new(channel: ChannelId, page: PageId, offset: i32) -> Self {
        Self {
            channel,
            page,
            offset,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.page, self.offset)
    }
}

/// Partition-local key of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: ChannelId,
    pub group: SubscriberGroupId,
}

impl SubscriptionKey {
    pub fn new(channel: ChannelId, group: SubscriberGroupId) -> Self {
        Self { channel, group }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_null_sorts_first() {
        assert!(PageId::NULL < PageId::from_raw(0));
        assert!(PageId::NULL.is_null());
        assert!(!PageId::from_raw(0).is_null());
    }

    #[test]
    fn test_page_routing_spreads_across_partitions() {
        let channel = ChannelId::from_raw(2);
        let routed: Vec<u32> = (0..5)
            .map(|p| PageId::from_raw(p).partition(channel, 5).as_raw())
            .collect();
        assert_eq!(routed, vec![2, 3, 4, 0, 1]);
    }

    #[test]
    fn test_position_ordering() {
        let a = Position::new(PageId::from_raw(3), 9);
        let b = Position::new(PageId::from_raw(4), 0);
        let c = Position::new(PageId::from_raw(4), 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_position_validity() {
        assert!(Position::new(PageId::from_raw(0), 0).is_valid());
        assert!(!Position::new(PageId::NULL, 0).is_valid());
        assert!(!Position::new(PageId::from_raw(1), NULL_OFFSET).is_valid());
        assert!(!Position::new(PageId::from_raw(1), -1).is_valid());
    }

    #[test]
    fn test_base_page_is_deterministic_and_in_range() {
        let a = base_page("orders", 13);
        let b = base_page("orders", 13);
        assert_eq!(a, b);
        assert!(a.as_raw() >= 0 && a.as_raw() < 13);
    }

    #[test]
    fn test_group_kinds() {
        let durable = SubscriberGroupId::durable("billing");
        assert!(!durable.is_anonymous());
        assert_eq!(durable.name(), "billing");

        let anon = SubscriberGroupId::anonymous(0);
        assert!(anon.is_anonymous());
        assert_eq!(anon.member(), 1);
    }
}
