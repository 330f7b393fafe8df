//! # Partition Store: Committed State and Staged Steps
//!
//! The store owns one partition's records and its SQLite connection. Every
//! engine operation runs as one **step**: it reads through a staged overlay,
//! writes only to the overlay, and either commits or rolls back as a whole.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Step Lifecycle                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  begin()         staged = {}                                │
//! │     │                                                       │
//! │     ▼                                                       │
//! │  reads           staged  ──miss──►  committed               │
//! │  writes          staged only                                │
//! │     │                                                       │
//! │     ├── ok ───►  commit():  BEGIN IMMEDIATE                 │
//! │     │                       write staged rows               │
//! │     │                       COMMIT                          │
//! │     │                       staged → committed              │
//! │     │                                                       │
//! │     └── err ──►  rollback(): staged discarded               │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariant: Memory Never Leads Disk
//!
//! Committed maps are only updated after SQLite has committed. If the
//! SQLite commit fails the step's changes vanish from memory too, so no
//! partial page/usage/subscription mutation is ever visible.
//!
//! ## Rust Pattern: `Option<T>` as a Tombstone
//!
//! The overlay maps hold `Option<T>`: `Some(v)` is an upsert, `None` a delete.
//! A lookup that finds `Some(None)` in the overlay must not fall through to
//! the committed map.

use std::collections::{BTreeMap, HashMap};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::codec::{decode_allocations, decode_group_set, encode_allocations, encode_group_set};
use crate::error::Result;
use crate::model::{Element, Page, Subscription, Usage};
use crate::schema::{read_metadata, write_metadata, CHANNEL_COUNT_KEY};
use crate::types::{
    ChannelId, ElementKey, NotifierId, PageId, PageKey, Position, SubscriberGroupId,
    SubscriberId, SubscriptionKey,
};

// =============================================================================
// State
// =============================================================================

/// Committed records (mirrors disk).
#[derive(Debug, Default)]
struct CommittedState {
    usages: BTreeMap<ChannelId, Usage>,
    pages: BTreeMap<PageKey, Page>,
    subscriptions: BTreeMap<SubscriptionKey, Subscription>,
    elements: HashMap<ElementKey, Element>,
    channel_count: u32,
    byte_size: u64,
}

/// Changes made by the current step.
#[derive(Debug, Default)]
struct StagedState {
    usages: HashMap<ChannelId, Usage>,
    pages: HashMap<PageKey, Option<Page>>,
    subscriptions: HashMap<SubscriptionKey, Option<Subscription>>,
    elements: HashMap<ElementKey, Option<Element>>,
    channel_count: Option<u32>,
    byte_delta: i64,
    registered: Vec<NotifierId>,
    fired: Vec<NotifierId>,
}

impl StagedState {
    fn is_dirty(&self) -> bool {
        !self.usages.is_empty()
            || !self.pages.is_empty()
            || !self.subscriptions.is_empty()
            || !self.elements.is_empty()
            || self.channel_count.is_some()
    }
}

/// Side effects of a committed step, applied by the engine.
#[derive(Debug, Default)]
pub struct StepEffects {
    /// Notifier registrations to create.
    pub registered: Vec<NotifierId>,
    /// Notifier registrations to delete (and so fire).
    pub fired: Vec<NotifierId>,
    /// Change in stored value bytes.
    pub byte_delta: i64,
}

// =============================================================================
// Partition Store
// =============================================================================

/// One partition's records plus its connection.
pub struct PartitionStore {
    conn: Connection,
    committed: CommittedState,
    staged: StagedState,
}

impl PartitionStore {
    /// Loads committed state from `conn`. A fresh database takes
    /// `default_channel_count`.
    pub fn load(conn: Connection, default_channel_count: u32) -> Result<Self> {
        let mut store = Self {
            conn,
            committed: CommittedState::default(),
            staged: StagedState::default(),
        };

        store.committed.channel_count = match read_metadata(&store.conn, CHANNEL_COUNT_KEY)? {
            Some(raw) => raw.parse().unwrap_or(default_channel_count),
            None => {
                write_metadata(&store.conn, CHANNEL_COUNT_KEY, &default_channel_count.to_string())?;
                default_channel_count
            }
        };

        store.load_usages()?;
        store.load_pages()?;
        store.load_elements()?;
        store.load_subscriptions()?;

        Ok(store)
    }

    fn load_usages(&mut self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT channel, head, tail, max_page, waiting, anonymous FROM usages")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;

        for row in rows {
            let (channel, head, tail, max, waiting, anonymous) = row?;
            let usage = Usage {
                head: PageId::from_raw(head),
                tail: PageId::from_raw(tail),
                max: PageId::from_raw(max),
                waiting,
                anonymous_groups: decode_group_set(&anonymous)?,
                removal_notifiers: Vec::new(),
            };
            self.committed.usages.insert(ChannelId::from_raw(channel), usage);
        }
        Ok(())
    }

    fn load_pages(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT channel, page, tail, byte_size, sealed, ref_count, prev, next, head_ms, tail_ms
             FROM pages",
        )?;
        let rows = stmt.query_map([], |row| {
            let key = PageKey::new(
                ChannelId::from_raw(row.get(0)?),
                PageId::from_raw(row.get(1)?),
            );
            let page = Page {
                tail: row.get(2)?,
                byte_size: row.get::<_, i64>(3)? as u64,
                sealed: row.get(4)?,
                ref_count: row.get(5)?,
                prev: PageId::from_raw(row.get(6)?),
                next: PageId::from_raw(row.get(7)?),
                head_timestamp: row.get(8)?,
                tail_timestamp: row.get(9)?,
                insertion_notifiers: Vec::new(),
            };
            Ok((key, page))
        })?;

        for row in rows {
            let (key, page) = row?;
            self.committed.pages.insert(key, page);
        }
        Ok(())
    }

    fn load_elements(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT channel, page, offset, timestamp_ms, expiry_ms, value FROM elements",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Element {
                channel: ChannelId::from_raw(row.get(0)?),
                page: PageId::from_raw(row.get(1)?),
                offset: row.get(2)?,
                timestamp: row.get(3)?,
                expiry: row.get(4)?,
                value: row.get(5)?,
            })
        })?;

        for row in rows {
            let element = row?;
            self.committed.byte_size += element.byte_size();
            let key = ElementKey::new(element.channel, element.page, element.offset);
            self.committed.elements.insert(key, element);
        }
        Ok(())
    }

    fn load_subscriptions(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT channel, group_name, member, page, position, anchor,
                    committed_page, committed_offset, rollback_page, rollback_offset,
                    head, owner, filter, transform, allocations
             FROM subscriptions",
        )?;
        let rows = stmt.query_map([], |row| {
            let key = SubscriptionKey::new(
                ChannelId::from_raw(row.get(0)?),
                SubscriberGroupId::from_parts(row.get::<_, String>(1)?, row.get::<_, i64>(2)? as u64),
            );
            let committed = position_from(row.get(6)?, row.get(7)?);
            let rollback = position_from(row.get(8)?, row.get(9)?);
            Ok((
                key,
                row.get::<_, i64>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, i64>(5)?,
                committed,
                rollback,
                row.get::<_, i64>(10)?,
                row.get::<_, Option<i64>>(11)?,
                row.get::<_, Option<String>>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, Option<Vec<u8>>>(14)?,
            ))
        })?;

        for row in rows {
            let (key, page, position, anchor, committed, rollback, head, owner, filter, transform, alloc) =
                row?;
            let allocations = match alloc {
                Some(blob) => decode_allocations(&blob)?,
                None => BTreeMap::new(),
            };
            let subscription = Subscription {
                page: PageId::from_raw(page),
                position,
                anchor: PageId::from_raw(anchor),
                committed,
                rollback,
                subscription_head: PageId::from_raw(head),
                owner: owner.map(|o| SubscriberId::from_raw(o as u64)),
                filter,
                transform,
                allocations,
            };
            self.committed.subscriptions.insert(key, subscription);
        }
        Ok(())
    }

    // =========================================================================
    // Step Control
    // =========================================================================

    /// Starts a step. Any leftover staged state is discarded.
    pub fn begin(&mut self) {
        self.staged = StagedState::default();
    }

    /// Discards the current step.
    pub fn rollback(&mut self) {
        self.staged = StagedState::default();
    }

    /// Persists the current step and merges it into committed state.
    pub fn commit(&mut self) -> Result<StepEffects> {
        let staged = std::mem::take(&mut self.staged);

        if staged.is_dirty() {
            if let Err(e) = self.persist(&staged) {
                warn!(error = %e, "partition step failed to persist, rolled back");
                return Err(e);
            }
        }

        let committed = &mut self.committed;
        for (channel, usage) in staged.usages {
            committed.usages.insert(channel, usage);
        }
        for (key, page) in staged.pages {
            match page {
                Some(page) => committed.pages.insert(key, page),
                None => committed.pages.remove(&key),
            };
        }
        for (key, sub) in staged.subscriptions {
            match sub {
                Some(sub) => committed.subscriptions.insert(key, sub),
                None => committed.subscriptions.remove(&key),
            };
        }
        for (key, element) in staged.elements {
            match element {
                Some(element) => committed.elements.insert(key, element),
                None => committed.elements.remove(&key),
            };
        }
        if let Some(count) = staged.channel_count {
            committed.channel_count = count;
        }
        committed.byte_size = (committed.byte_size as i64 + staged.byte_delta).max(0) as u64;

        Ok(StepEffects {
            registered: staged.registered,
            fired: staged.fired,
            byte_delta: staged.byte_delta,
        })
    }

    fn persist(&mut self, staged: &StagedState) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;

        match write_staged(&self.conn, staged) {
            Ok(()) => match self.conn.execute("COMMIT", []) {
                Ok(_) => Ok(()),
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", []);
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Usages
    // =========================================================================

    /// The channel's usage, or a fresh one if the channel was never touched.
    pub fn usage(&self, channel: ChannelId) -> Usage {
        self.staged
            .usages
            .get(&channel)
            .or_else(|| self.committed.usages.get(&channel))
            .cloned()
            .unwrap_or_default()
    }

    pub fn put_usage(&mut self, channel: ChannelId, usage: Usage) {
        self.staged.usages.insert(channel, usage);
    }

    // =========================================================================
    // Pages
    // =========================================================================

    pub fn page(&self, key: PageKey) -> Option<&Page> {
        match self.staged.pages.get(&key) {
            Some(staged) => staged.as_ref(),
            None => self.committed.pages.get(&key),
        }
    }

    pub fn put_page(&mut self, key: PageKey, page: Page) {
        self.staged.pages.insert(key, Some(page));
    }

    pub fn delete_page(&mut self, key: PageKey) {
        self.staged.pages.insert(key, None);
    }

    // =========================================================================
    // Elements
    // =========================================================================

    pub fn element(&self, key: ElementKey) -> Option<&Element> {
        match self.staged.elements.get(&key) {
            Some(staged) => staged.as_ref(),
            None => self.committed.elements.get(&key),
        }
    }

    pub fn put_element(&mut self, key: ElementKey, element: Element) {
        let old = self.element(key).map(Element::byte_size).unwrap_or(0) as i64;
        self.staged.byte_delta += element.byte_size() as i64 - old;
        self.staged.elements.insert(key, Some(element));
    }

    pub fn delete_element(&mut self, key: ElementKey) {
        if let Some(old) = self.element(key) {
            self.staged.byte_delta -= old.byte_size() as i64;
            self.staged.elements.insert(key, None);
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn subscription(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        match self.staged.subscriptions.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.committed.subscriptions.get(key),
        }
    }

    pub fn put_subscription(&mut self, key: SubscriptionKey, subscription: Subscription) {
        self.staged.subscriptions.insert(key, Some(subscription));
    }

    pub fn delete_subscription(&mut self, key: SubscriptionKey) {
        self.staged.subscriptions.insert(key, None);
    }

    /// Groups with a subscription in `channel`, staged changes included.
    pub fn groups_in_channel(&self, channel: ChannelId) -> Vec<SubscriberGroupId> {
        let mut groups: Vec<SubscriberGroupId> = self
            .committed
            .subscriptions
            .keys()
            .filter(|key| key.channel == channel)
            .filter(|key| !matches!(self.staged.subscriptions.get(*key), Some(None)))
            .map(|key| key.group.clone())
            .collect();

        for (key, sub) in &self.staged.subscriptions {
            if key.channel == channel
                && sub.is_some()
                && !self.committed.subscriptions.contains_key(key)
            {
                groups.push(key.group.clone());
            }
        }

        groups.sort();
        groups
    }

    // =========================================================================
    // Topic Shape and Accounting
    // =========================================================================

    pub fn channel_count(&self) -> u32 {
        self.staged.channel_count.unwrap_or(self.committed.channel_count)
    }

    pub fn set_channel_count(&mut self, count: u32) {
        self.staged.channel_count = Some(count);
    }

    /// Bytes stored in this partition, staged changes included.
    pub fn byte_size(&self) -> u64 {
        (self.committed.byte_size as i64 + self.staged.byte_delta).max(0) as u64
    }

    /// Bytes the current step has added (negative when it removed).
    pub fn staged_byte_delta(&self) -> i64 {
        self.staged.byte_delta
    }

    // =========================================================================
    // Notifier Effects
    // =========================================================================

    /// Records a notifier registration, created when the step commits.
    pub fn register_notifier(&mut self, notifier: NotifierId) {
        self.staged.registered.push(notifier);
    }

    /// Records notifiers to fire when the step commits.
    pub fn fire_notifiers(&mut self, notifiers: impl IntoIterator<Item = NotifierId>) {
        self.staged.fired.extend(notifiers);
    }

    /// Number of committed pages across all channels.
    pub fn page_count(&self) -> usize {
        self.committed.pages.len()
    }
}

// =============================================================================
// Row Writers
// =============================================================================

fn write_staged(conn: &Connection, staged: &StagedState) -> Result<()> {
    for (channel, usage) in &staged.usages {
        conn.prepare_cached(
            "INSERT OR REPLACE INTO usages (channel, head, tail, max_page, waiting, anonymous)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![
            channel.as_raw(),
            usage.head.as_raw(),
            usage.tail.as_raw(),
            usage.max.as_raw(),
            usage.waiting,
            encode_group_set(&usage.anonymous_groups),
        ])?;
    }

    for (key, page) in &staged.pages {
        match page {
            Some(page) => {
                conn.prepare_cached(
                    "INSERT OR REPLACE INTO pages
                     (channel, page, tail, byte_size, sealed, ref_count, prev, next, head_ms, tail_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?
                .execute(params![
                    key.channel.as_raw(),
                    key.page.as_raw(),
                    page.tail,
                    page.byte_size as i64,
                    page.sealed,
                    page.ref_count,
                    page.prev.as_raw(),
                    page.next.as_raw(),
                    page.head_timestamp,
                    page.tail_timestamp,
                ])?;
            }
            None => {
                conn.prepare_cached("DELETE FROM pages WHERE channel = ?1 AND page = ?2")?
                    .execute(params![key.channel.as_raw(), key.page.as_raw()])?;
            }
        }
    }

    for (key, element) in &staged.elements {
        match element {
            Some(element) => {
                conn.prepare_cached(
                    "INSERT OR REPLACE INTO elements
                     (channel, page, offset, timestamp_ms, expiry_ms, value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?
                .execute(params![
                    key.channel.as_raw(),
                    key.page.as_raw(),
                    key.offset,
                    element.timestamp,
                    element.expiry,
                    element.value,
                ])?;
            }
            None => {
                conn.prepare_cached(
                    "DELETE FROM elements WHERE channel = ?1 AND page = ?2 AND offset = ?3",
                )?
                .execute(params![key.channel.as_raw(), key.page.as_raw(), key.offset])?;
            }
        }
    }

    for (key, sub) in &staged.subscriptions {
        match sub {
            Some(sub) => {
                let allocations =
                    (!sub.allocations.is_empty()).then(|| encode_allocations(&sub.allocations));
                conn.prepare_cached(
                    "INSERT OR REPLACE INTO subscriptions
                     (channel, group_name, member, page, position, anchor,
                      committed_page, committed_offset, rollback_page, rollback_offset,
                      head, owner, filter, transform, allocations)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?
                .execute(params![
                    key.channel.as_raw(),
                    key.group.name(),
                    key.group.member() as i64,
                    sub.page.as_raw(),
                    sub.position,
                    sub.anchor.as_raw(),
                    sub.committed.map(|p| p.page.as_raw()),
                    sub.committed.map(|p| p.offset),
                    sub.rollback.map(|p| p.page.as_raw()),
                    sub.rollback.map(|p| p.offset),
                    sub.subscription_head.as_raw(),
                    sub.owner.map(|o| o.as_raw() as i64),
                    sub.filter,
                    sub.transform,
                    allocations,
                ])?;
            }
            None => {
                conn.prepare_cached(
                    "DELETE FROM subscriptions WHERE channel = ?1 AND group_name = ?2 AND member = ?3",
                )?
                .execute(params![
                    key.channel.as_raw(),
                    key.group.name(),
                    key.group.member() as i64
                ])?;
            }
        }
    }

    if let Some(count) = staged.channel_count {
        write_metadata(conn, CHANNEL_COUNT_KEY, &count.to_string())?;
    }

    Ok(())
}

fn position_from(page: Option<i64>, offset: Option<i32>) -> Option<Position> {
    match (page, offset) {
        (Some(page), Some(offset)) => Some(Position::new(PageId::from_raw(page), offset)),
        _ => None,
    }
}

/// Counts rows in a table. Used by tests to check what reached disk.
#[cfg(test)]
pub(crate) fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .optional()
        .ok()
        .flatten()
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn memory_store() -> PartitionStore {
        let db = Database::open_in_memory().unwrap();
        PartitionStore::load(db.into_connection(), 3).unwrap()
    }

    fn key(page: i64) -> PageKey {
        PageKey::new(ChannelId::ZERO, PageId::from_raw(page))
    }

    #[test]
    fn test_fresh_store_takes_default_channel_count() {
        let store = memory_store();
        assert_eq!(store.channel_count(), 3);
        assert!(store.usage(ChannelId::ZERO).is_empty());
    }

    #[test]
    fn test_staged_changes_visible_before_commit() {
        let mut store = memory_store();
        store.begin();
        store.put_page(key(1), Page::new());
        assert!(store.page(key(1)).is_some());
        store.commit().unwrap();
        assert!(store.page(key(1)).is_some());
    }

    #[test]
    fn test_rollback_discards_step() {
        let mut store = memory_store();
        store.begin();
        store.put_page(key(1), Page::new());
        store.rollback();
        assert!(store.page(key(1)).is_none());
    }

    #[test]
    fn test_staged_delete_hides_committed() {
        let mut store = memory_store();
        store.begin();
        store.put_page(key(1), Page::new());
        store.commit().unwrap();

        store.begin();
        store.delete_page(key(1));
        assert!(store.page(key(1)).is_none());
        store.commit().unwrap();
        assert!(store.page(key(1)).is_none());
        assert_eq!(count_rows(&store.conn, "pages"), 0);
    }

    #[test]
    fn test_element_bytes_tracked() {
        let mut store = memory_store();
        let ekey = ElementKey::new(ChannelId::ZERO, PageId::from_raw(0), 0);
        store.begin();
        store.put_element(
            ekey,
            Element {
                value: vec![0; 10],
                ..Element::default()
            },
        );
        assert_eq!(store.byte_size(), 10);
        let effects = store.commit().unwrap();
        assert_eq!(effects.byte_delta, 10);

        store.begin();
        store.delete_element(ekey);
        store.commit().unwrap();
        assert_eq!(store.byte_size(), 0);
    }

    #[test]
    fn test_groups_in_channel_merges_overlay() {
        let mut store = memory_store();
        let a = SubscriberGroupId::durable("a");
        let b = SubscriberGroupId::durable("b");

        store.begin();
        store.put_subscription(SubscriptionKey::new(ChannelId::ZERO, a.clone()), Subscription::new(None, None));
        store.commit().unwrap();

        store.begin();
        store.put_subscription(SubscriptionKey::new(ChannelId::ZERO, b.clone()), Subscription::new(None, None));
        store.delete_subscription(SubscriptionKey::new(ChannelId::ZERO, a));
        assert_eq!(store.groups_in_channel(ChannelId::ZERO), vec![b]);
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db");
        let group = SubscriberGroupId::durable("g");
        {
            let db = Database::open(&path).unwrap();
            let mut store = PartitionStore::load(db.into_connection(), 2).unwrap();
            store.begin();
            let mut page = Page::new();
            page.tail = 0;
            page.ref_count = 1;
            store.put_page(key(4), page);
            let mut sub = Subscription::new(Some("f".into()), None);
            sub.committed = Some(Position::new(PageId::from_raw(4), 0));
            sub.allocations.insert(SubscriberId::from_raw(5), vec![ChannelId::ZERO]);
            store.put_subscription(SubscriptionKey::new(ChannelId::ZERO, group.clone()), sub);
            store.set_channel_count(4);
            store.commit().unwrap();
        }

        let db = Database::open(&path).unwrap();
        let store = PartitionStore::load(db.into_connection(), 2).unwrap();
        assert_eq!(store.channel_count(), 4);
        assert_eq!(store.page(key(4)).unwrap().ref_count, 1);
        let sub = store
            .subscription(&SubscriptionKey::new(ChannelId::ZERO, group))
            .unwrap();
        assert_eq!(sub.filter.as_deref(), Some("f"));
        assert_eq!(sub.committed, Some(Position::new(PageId::from_raw(4), 0)));
        assert_eq!(sub.allocations.len(), 1);
    }
}
