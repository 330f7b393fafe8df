#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use pagedtopic::{
    Element, FunctionRegistry, PagedTopic, SubscriberConfig, SubscriberGroupId, TopicConfig,
};

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn topic_config(name: &str, partitions: u32, channels: u32) -> TopicConfig {
    TopicConfig {
        name: name.to_string(),
        partition_count: partitions,
        channel_count: channels,
        local_partition_count: partitions,
        ..TopicConfig::default()
    }
}

pub async fn open_in_memory(config: TopicConfig) -> PagedTopic {
    PagedTopic::open_in_memory(config, FunctionRegistry::new())
        .await
        .expect("open in-memory topic")
}

pub async fn open_in(dir: &Path, config: TopicConfig) -> PagedTopic {
    PagedTopic::open(dir, config, FunctionRegistry::new())
        .await
        .expect("open topic")
}

/// A durable group subscriber config that polls often on an empty topic.
pub fn durable(name: &str) -> SubscriberConfig {
    SubscriberConfig {
        group: Some(SubscriberGroupId::durable(name)),
        empty_wait: Duration::from_millis(50),
        ..SubscriberConfig::default()
    }
}

pub fn anonymous() -> SubscriberConfig {
    SubscriberConfig {
        empty_wait: Duration::from_millis(50),
        ..SubscriberConfig::default()
    }
}

/// Receives `n` elements, failing the test after [`RECEIVE_TIMEOUT`].
pub async fn receive_n(subscriber: &pagedtopic::Subscriber, n: usize) -> Vec<Element> {
    let completions: Vec<_> = (0..n)
        .map(|_| subscriber.receive().expect("receive"))
        .collect();
    let results = tokio::time::timeout(RECEIVE_TIMEOUT, futures::future::join_all(completions))
        .await
        .expect("elements not received in time");
    results
        .into_iter()
        .map(|r| r.expect("receive failed"))
        .collect()
}

pub fn values(elements: &[Element]) -> Vec<Vec<u8>> {
    elements.iter().map(|e| e.value.clone()).collect()
}
