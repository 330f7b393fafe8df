//! # Partition Records
//!
//! The four record kinds a partition stores:
//!
//! ```text
//! ┌───────────────┐   ┌───────────────┐   ┌─────────────────────┐   ┌──────────────┐
//! │ Usage         │   │ Page          │   │ Subscription        │   │ Element      │
//! │ (channel)     │   │ (channel,page)│   │ (channel, group)    │   │ (ch,pg,off)  │
//! │ head/tail/max │──►│ tail, bytes   │◄──│ cursor page/offset  │   │ value        │
//! │ waiting       │   │ sealed, refs  │   │ anchor, committed   │   │ timestamp    │
//! │ anon groups   │   │ prev / next   │   │ rollback, owner     │   │ expiry       │
//! └───────────────┘   └───────────────┘   └─────────────────────┘   └──────────────┘
//! ```
//!
//! Records are plain data. All mutation happens in the engine, inside a
//! staged step (see [`crate::store`]).
//!
//! ## Reference Counting
//!
//! A page's `ref_count` is the sum of:
//!
//! - one per subscription whose hold window (anchor page up to cursor page)
//!   contains it;
//! - one per subscription that was waiting for it when it was created;
//! - one chain reference owned by its predecessor page, while that
//!   predecessor exists.
//!
//! A page whose count drops to zero is removed unless consumed pages are
//! retained.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{
    ChannelId, NotifierId, PageId, Position, SubscriberGroupId, SubscriberId, EMPTY_TAIL,
    NULL_OFFSET,
};

// =============================================================================
// Page
// =============================================================================

/// An append-only segment of one channel inside one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Offset of the last stored element, [`EMPTY_TAIL`] when empty.
    pub tail: i32,

    /// Sum of stored value sizes.
    pub byte_size: u64,

    /// No further offers are accepted.
    pub sealed: bool,

    /// See the module docs.
    pub ref_count: i32,

    /// Previous page of this channel in this partition.
    pub prev: PageId,

    /// Next page of this channel in this partition.
    pub next: PageId,

    /// Publish time (ms) of the first element, 0 when empty.
    pub head_timestamp: i64,

    /// Publish time (ms) of the last element, 0 when empty.
    pub tail_timestamp: i64,

    /// Pollers to wake on the next insert. Not persisted.
    pub insertion_notifiers: Vec<NotifierId>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            tail: EMPTY_TAIL,
            byte_size: 0,
            sealed: false,
            ref_count: 0,
            prev: PageId::NULL,
            next: PageId::NULL,
            head_timestamp: 0,
            tail_timestamp: 0,
            insertion_notifiers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tail == EMPTY_TAIL
    }

    /// Adjusts the reference count, returning the new value.
    pub fn adjust_ref(&mut self, delta: i32) -> i32 {
        self.ref_count += delta;
        self.ref_count
    }

    /// True while anything still references the page.
    pub fn is_subscribed(&self) -> bool {
        self.ref_count > 0
    }

    /// True if an element at `offset` (or past it) was fully consumed from
    /// a sealed page.
    pub fn is_consumed_at(&self, offset: i32) -> bool {
        self.sealed && offset > self.tail
    }

    pub fn add_insertion_notifier(&mut self, notifier: NotifierId) {
        if !self.insertion_notifiers.contains(&notifier) {
            self.insertion_notifiers.push(notifier);
        }
    }

    pub fn take_insertion_notifiers(&mut self) -> Vec<NotifierId> {
        std::mem::take(&mut self.insertion_notifiers)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Usage
// =============================================================================

/// Per-channel bookkeeping inside one partition. Created lazily, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    /// Lowest existing page.
    pub head: PageId,

    /// Highest existing page.
    pub tail: PageId,

    /// Highest page ever created. Unlike `tail` it is never reset, so a
    /// missing page at or below it is known to be removed.
    pub max: PageId,

    /// Subscriptions waiting to attach to the next created page.
    pub waiting: i32,

    /// Anonymous groups with a subscription in this channel.
    pub anonymous_groups: BTreeSet<SubscriberGroupId>,

    /// Publishers to wake when a page is removed. Not persisted.
    pub removal_notifiers: Vec<NotifierId>,
}

impl Usage {
    pub fn new() -> Self {
        Self {
            head: PageId::NULL,
            tail: PageId::NULL,
            max: PageId::NULL,
            waiting: 0,
            anonymous_groups: BTreeSet::new(),
            removal_notifiers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_null()
    }

    /// Hands the waiting count to a freshly created page.
    pub fn reset_waiting(&mut self) -> i32 {
        std::mem::take(&mut self.waiting)
    }

    pub fn add_removal_notifier(&mut self, notifier: NotifierId) {
        if !self.removal_notifiers.contains(&notifier) {
            self.removal_notifiers.push(notifier);
        }
    }

    pub fn take_removal_notifiers(&mut self) -> Vec<NotifierId> {
        std::mem::take(&mut self.removal_notifiers)
    }
}

impl Default for Usage {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A group's cursor in one channel of one partition.
///
/// # Cursor States
///
/// | `page` | `position` | Meaning |
/// |--------|------------|---------|
/// | p | 0..=tail+1 | attached to p, next read at `position` |
/// | p | `NULL_OFFSET` | done with p, waiting for the page after p |
/// | NULL | `NULL_OFFSET` | waiting for the partition's first page |
///
/// # Hold Window
///
/// The subscription holds one reference on each existing page from
/// `anchor` through `page`. `anchor` is the lowest page with uncommitted
/// content. A waiting cursor also owns one `Usage::waiting` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub page: PageId,
    pub position: i32,
    pub anchor: PageId,

    /// Last committed element.
    pub committed: Option<Position>,

    /// Where to resume after the last commit.
    pub rollback: Option<Position>,

    /// Globally agreed initial head. NULL until the group is initialised.
    pub subscription_head: PageId,

    /// Subscriber that owns this channel, `None` when unenforced.
    pub owner: Option<SubscriberId>,

    pub filter: Option<String>,
    pub transform: Option<String>,

    /// Authoritative subscriber to channel allocation. Channel 0 only.
    pub allocations: BTreeMap<SubscriberId, Vec<ChannelId>>,
}

impl Subscription {
    pub fn new(filter: Option<String>, transform: Option<String>) -> Self {
        Self {
            page: PageId::NULL,
            position: NULL_OFFSET,
            anchor: PageId::NULL,
            committed: None,
            rollback: None,
            subscription_head: PageId::NULL,
            owner: None,
            filter,
            transform,
            allocations: BTreeMap::new(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.position == NULL_OFFSET
    }

    pub fn is_initialized(&self) -> bool {
        !self.subscription_head.is_null()
    }

    /// True if `subscriber` may poll or commit this channel.
    pub fn is_owned_by(&self, subscriber: SubscriberId) -> bool {
        self.owner.map_or(true, |owner| owner == subscriber)
    }

    pub fn same_functions(&self, filter: Option<&str>, transform: Option<&str>) -> bool {
        self.filter.as_deref() == filter && self.transform.as_deref() == transform
    }
}

// =============================================================================
// Element
// =============================================================================

/// A stored message, decorated with its address when written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub channel: ChannelId,
    pub page: PageId,
    pub offset: i32,
    /// Publish time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Expiry time in milliseconds since the epoch.
    pub expiry: Option<i64>,
    pub value: Vec<u8>,
}

impl Element {
    pub fn position(&self) -> Position {
        Position::new(self.page, self.offset)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry.map_or(false, |expiry| expiry <= now_ms)
    }

    pub fn byte_size(&self) -> u64 {
        self.value.len() as u64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_empty_and_unreferenced() {
        let page = Page::new();
        assert!(page.is_empty());
        assert!(!page.is_subscribed());
        assert!(page.prev.is_null() && page.next.is_null());
    }

    #[test]
    fn test_page_ref_adjust() {
        let mut page = Page::new();
        assert_eq!(page.adjust_ref(2), 2);
        assert_eq!(page.adjust_ref(-1), 1);
        assert!(page.is_subscribed());
    }

    #[test]
    fn test_notifiers_deduplicate_and_drain() {
        let mut page = Page::new();
        page.add_insertion_notifier(NotifierId::from_raw(1));
        page.add_insertion_notifier(NotifierId::from_raw(1));
        page.add_insertion_notifier(NotifierId::from_raw(2));
        assert_eq!(page.take_insertion_notifiers().len(), 2);
        assert!(page.insertion_notifiers.is_empty());
    }

    #[test]
    fn test_usage_reset_waiting() {
        let mut usage = Usage::new();
        usage.waiting = 3;
        assert_eq!(usage.reset_waiting(), 3);
        assert_eq!(usage.waiting, 0);
    }

    #[test]
    fn test_subscription_ownership() {
        let mut sub = Subscription::new(None, None);
        let a = SubscriberId::from_raw(1);
        let b = SubscriberId::from_raw(2);
        assert!(sub.is_owned_by(a));
        sub.owner = Some(a);
        assert!(sub.is_owned_by(a));
        assert!(!sub.is_owned_by(b));
    }

    #[test]
    fn test_element_expiry() {
        let element = Element {
            expiry: Some(100),
            ..Element::default()
        };
        assert!(!element.is_expired(99));
        assert!(element.is_expired(100));
        assert!(!Element::default().is_expired(i64::MAX));
    }
}
