//! # pagedtopic - Paged Publish/Subscribe Topics
//!
//! A durable, multi-channel message topic whose data is spread across
//! partitions, each backed by its own SQLite database. It provides:
//!
//! - **Paged storage**: append-only pages per channel, chained across
//!   partitions and removed once every subscriber group is done with them
//! - **Subscriber groups**: crash-safe three-phase initialisation, poll,
//!   commit, seek by position or by time, rollback positions
//! - **Flow control**: a generic batching queue behind both publishers and
//!   subscribers, and a topic-wide byte budget with "topic full" waits
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────┐      ┌───────────────────────────┐
//! │        Publisher          │      │        Subscriber         │
//! │  BatchingOperationsQueue  │      │  BatchingOperationsQueue  │
//! └─────────────┬─────────────┘      └─────────────┬─────────────┘
//!               │ offer                             │ poll / commit / seek
//!               ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    PagedTopic (async API)                       │
//! │         routes (page + channel) % partitions, fans out          │
//! └───────┬──────────────────────┬──────────────────────┬───────────┘
//!         ▼                      ▼                      ▼
//! ┌───────────────┐      ┌───────────────┐      ┌───────────────┐
//! │ partition 0   │      │ partition 1   │  ... │ partition N-1 │
//! │ actor thread  │      │ actor thread  │      │ actor thread  │
//! │ engine + db   │      │ engine + db   │      │ engine + db   │
//! └───────────────┘      └───────────────┘      └───────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Page chains**: pages of a channel in one partition form a doubly
//!    linked chain in increasing page order
//! 2. **Reference counts**: a page lives while any subscription or its
//!    predecessor holds it; removal cascades forward
//! 3. **All-or-nothing steps**: every engine operation commits completely or
//!    leaves no trace
//! 4. **Memory never leads disk**: staged changes become visible only after
//!    the SQLite transaction commits
//!
//! ## Module Organization
//!
//! - [`error`]: error enum for every failure mode
//! - [`types`]: ids, positions, keys
//! - [`model`]: pages, usages, subscriptions, elements
//! - [`config`]: topic, publisher and subscriber configuration
//! - [`schema`] / [`codec`] / [`store`]: SQLite persistence
//! - [`notify`]: notifier registrations and the change feed
//! - [`partition`] / [`subscription`]: the per-partition engine
//! - [`actor`]: one thread per partition
//! - [`api`]: [`PagedTopic`], the main entry point
//! - [`batching`]: [`BatchingOperationsQueue`]
//! - [`publisher`] / [`subscriber`]: client orchestration

/// Error types for topic operations.
pub mod error;

/// Domain identifiers: partitions, channels, pages, positions, groups.
pub mod types;

/// Persistent records kept by a partition.
pub mod model;

/// Configuration, with environment overrides.
pub mod config;

/// Registry of named element filters and value transforms.
pub mod functions;

/// Binary encoding of record fields stored as blobs.
pub mod codec;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Staged/committed record store over one partition's database.
pub mod store;

/// Notifier registrations and the notification hub.
pub mod notify;

/// Paged storage engine: offer, page lifecycle, poll.
pub mod partition;

/// Subscription protocol: initialisation, commit, seek, removal.
pub mod subscription;

/// Partition actors.
///
/// Each partition engine runs on a dedicated thread and is driven through
/// an async handle, so engine operations never need locks.
pub mod actor;

/// Async API.
///
/// The main entry point is [`PagedTopic`](api::PagedTopic).
pub mod api;

/// Generic batching and backpressure queue.
pub mod batching;

/// Batched publishing.
pub mod publisher;

/// Group membership and batched receiving.
pub mod subscriber;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{PagedTopic, TopicStats};
pub use batching::{BatchingOperationsQueue, Completion, OnErrorAction, TriggerState};
pub use config::{PublisherConfig, SubscriberConfig, TopicConfig};
pub use error::{Error, Result};
pub use functions::FunctionRegistry;
pub use model::Element;
pub use partition::{OfferResult, OfferStatus, PollRequest, PollResult, PollStatus};
pub use publisher::{PublishStatus, Publisher};
pub use subscriber::Subscriber;
pub use subscription::{CommitResult, CommitStatus, SeekResult, SeekStatus, SubscribePhase};

pub use types::{ChannelId, NotifierId, PageId, PartitionId, Position, SubscriberGroupId, SubscriberId};
