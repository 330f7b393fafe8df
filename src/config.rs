//! # Topic Configuration
//!
//! [`TopicConfig`] fixes the shape of a topic (partitions, channels, page
//! size) and its retention policy. [`PublisherConfig`] and
//! [`SubscriberConfig`] tune the two orchestrators.
//!
//! Defaults live in `DEFAULT_*` constants so tests and callers can refer to
//! them. [`TopicConfig::from_env`] overlays `PAGED_TOPIC_*` environment
//! variables on top of the defaults.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{base_page, PageId, SubscriberGroupId, SubscriberId, ChannelId};

// =============================================================================
// Defaults
// =============================================================================

/// Default number of partitions.
pub const DEFAULT_PARTITION_COUNT: u32 = 13;

/// Default number of channels (capped by the partition count).
pub const DEFAULT_CHANNEL_COUNT: u32 = 17;

/// Default page capacity in bytes.
pub const DEFAULT_PAGE_CAPACITY: u64 = 1024 * 1024;

/// Default byte cap on the values returned by a single poll.
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 1024 * 1024;

/// How long a notifier registration lives before it fires on its own.
pub const DEFAULT_NOTIFICATION_EXPIRY: Duration = Duration::from_secs(10);

/// Prefix of the environment variables read by [`TopicConfig::from_env`].
pub const ENV_PREFIX: &str = "PAGED_TOPIC_";

// =============================================================================
// Topic Configuration
// =============================================================================

/// Shape and retention policy of a topic.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Topic name; determines the base page.
    pub name: String,

    /// Number of storage partitions (one actor thread each).
    pub partition_count: u32,

    /// Number of channels.
    pub channel_count: u32,

    /// Bytes a page holds before it is sealed.
    pub page_capacity: u64,

    /// Topic-wide byte budget. Zero means unlimited.
    pub server_capacity: u64,

    /// Keep consumed pages instead of removing them.
    pub retain_consumed: bool,

    /// Elements older than this are skipped by poll.
    pub element_expiry: Option<Duration>,

    /// Byte cap on the values returned by one poll.
    pub max_batch_bytes: u64,

    /// Lifetime of a notifier registration.
    pub notification_expiry: Duration,

    /// Partitions hosted by this process. Used to shrink pages under a
    /// server capacity.
    pub local_partition_count: u32,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: "topic".to_string(),
            partition_count: DEFAULT_PARTITION_COUNT,
            channel_count: DEFAULT_CHANNEL_COUNT.min(DEFAULT_PARTITION_COUNT),
            page_capacity: DEFAULT_PAGE_CAPACITY,
            server_capacity: 0,
            retain_consumed: false,
            element_expiry: None,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            notification_expiry: DEFAULT_NOTIFICATION_EXPIRY,
            local_partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

impl TopicConfig {
    /// Default configuration for the named topic.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `PAGED_TOPIC_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `PAGED_TOPIC_NAME` | `name` |
    /// | `PAGED_TOPIC_PARTITIONS` | `partition_count` (also `local_partition_count`) |
    /// | `PAGED_TOPIC_CHANNELS` | `channel_count` |
    /// | `PAGED_TOPIC_PAGE_CAPACITY` | `page_capacity` |
    /// | `PAGED_TOPIC_SERVER_CAPACITY` | `server_capacity` |
    /// | `PAGED_TOPIC_RETAIN_CONSUMED` | `retain_consumed` |
    /// | `PAGED_TOPIC_ELEMENT_EXPIRY_MS` | `element_expiry` |
    /// | `PAGED_TOPIC_MAX_BATCH_BYTES` | `max_batch_bytes` |
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(name) = read_var("NAME") {
            config.name = name;
        }
        if let Some(partitions) = parse_var::<u32>("PARTITIONS")? {
            config.partition_count = partitions;
            config.local_partition_count = partitions;
            config.channel_count = config.channel_count.min(partitions);
        }
        if let Some(channels) = parse_var::<u32>("CHANNELS")? {
            config.channel_count = channels;
        }
        if let Some(capacity) = parse_var::<u64>("PAGE_CAPACITY")? {
            config.page_capacity = capacity;
        }
        if let Some(capacity) = parse_var::<u64>("SERVER_CAPACITY")? {
            config.server_capacity = capacity;
        }
        if let Some(retain) = parse_var::<bool>("RETAIN_CONSUMED")? {
            config.retain_consumed = retain;
        }
        if let Some(ms) = parse_var::<u64>("ELEMENT_EXPIRY_MS")? {
            config.element_expiry = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(bytes) = parse_var::<u64>("MAX_BATCH_BYTES")? {
            config.max_batch_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::Config("partition_count must be > 0".into()));
        }
        if self.channel_count == 0 {
            return Err(Error::Config("channel_count must be > 0".into()));
        }
        if self.page_capacity == 0 {
            return Err(Error::Config("page_capacity must be > 0".into()));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::Config("max_batch_bytes must be > 0".into()));
        }
        if self.local_partition_count == 0 {
            return Err(Error::Config("local_partition_count must be > 0".into()));
        }
        Ok(())
    }

    /// First page id of every channel.
    pub fn base_page(&self) -> PageId {
        base_page(&self.name, self.partition_count)
    }

    /// Page capacity used by an offer.
    ///
    /// With a server capacity and a caller waiting on "topic full", the page
    /// is capped at `(server_capacity / 2) / local_partition_count` so that the
    /// overshoot before the waiter hears back stays bounded. The formula is a
    /// heuristic; both inputs are tunable.
    pub fn effective_page_capacity(&self, notify_on_full: bool) -> u64 {
        if self.server_capacity == 0 || !notify_on_full {
            return self.page_capacity;
        }

        let dynamic = (self.server_capacity / 2) / self.local_partition_count.max(1) as u64;
        if self.page_capacity > dynamic {
            dynamic.max(1)
        } else {
            self.page_capacity
        }
    }
}

fn read_var(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn parse_var<T: std::str::FromStr>(suffix: &str) -> Result<Option<T>> {
    match read_var(suffix) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{ENV_PREFIX}{suffix} has invalid value '{raw}'"))),
    }
}

// =============================================================================
// Publisher Configuration
// =============================================================================

/// Configuration for a [`crate::publisher::Publisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Bytes drained from the queue per offer.
    pub batch_bytes: u64,

    /// How long to wait for space after a `TopicFull` before retrying.
    pub full_wait: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            full_wait: DEFAULT_NOTIFICATION_EXPIRY,
        }
    }
}

// =============================================================================
// Subscriber Configuration
// =============================================================================

/// Configuration for a [`crate::subscriber::Subscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Group to join. `None` creates an anonymous group for this subscriber.
    pub group: Option<SubscriberGroupId>,

    /// Registered filter name, fixed when the group is created.
    pub filter: Option<String>,

    /// Registered transform name, fixed when the group is created.
    pub transform: Option<String>,

    /// Receive requests drained per batch.
    pub batch_size: u64,

    /// How long to sleep on an empty topic before polling again.
    pub empty_wait: Duration,

    /// Channels this subscriber owns. `None` takes every channel.
    pub channels: Option<Vec<ChannelId>>,

    /// Identity of this subscriber. `None` picks a random one.
    pub id: Option<SubscriberId>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            group: None,
            filter: None,
            transform: None,
            batch_size: 64,
            empty_wait: Duration::from_secs(1),
            channels: None,
            id: None,
        }
    }
}

impl SubscriberConfig {
    /// Joins the named durable group.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            group: Some(SubscriberGroupId::durable(name)),
            ..Self::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
