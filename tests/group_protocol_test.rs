mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use pagedtopic::actor::OfferRequest;
use pagedtopic::{
    ChannelId, CommitStatus, Error, FunctionRegistry, OfferStatus, PagedTopic, PageId, PollRequest,
    PollStatus, Position, SeekStatus, SubscribePhase, SubscriberGroupId, SubscriberId, TopicConfig,
};

const C0: ChannelId = ChannelId::ZERO;
const READER: SubscriberId = SubscriberId::from_raw(7);

fn single_partition(name: &str) -> TopicConfig {
    common::topic_config(name, 1, 1)
}

async fn init_group(topic: &PagedTopic, group: &SubscriberGroupId) {
    topic
        .ensure_subscription(group, SubscribePhase::Pin, None, None)
        .await
        .unwrap();
    let heads = vec![topic.base_page(); topic.channel_count() as usize];
    topic
        .ensure_subscription(group, SubscribePhase::Advance(heads), None, None)
        .await
        .unwrap();
}

async fn offer(topic: &PagedTopic, channel: ChannelId, page: PageId, values: &[&[u8]], seal: bool) {
    let result = topic
        .offer(OfferRequest {
            channel,
            page,
            values: values.iter().map(|v| v.to_vec()).collect(),
            notify_on_full: None,
            seal,
        })
        .await
        .unwrap();
    assert_eq!(result.status, OfferStatus::Success);
}

fn poll_request(topic: &PagedTopic, group: &SubscriberGroupId, channel: ChannelId, page: PageId) -> PollRequest {
    PollRequest {
        channel,
        page,
        max_elements: 16,
        notifier: None,
        subscriber: READER,
        group: group.clone(),
        channel_count: topic.channel_count(),
    }
}

fn polled_values(result: &pagedtopic::PollResult) -> Vec<Vec<u8>> {
    result.elements.iter().map(|e| e.value.clone()).collect()
}

#[tokio::test]
async fn inquire_reports_uninitialised_until_advanced() {
    let topic = common::open_in_memory(single_partition("inquire")).await;
    let group = SubscriberGroupId::durable("g");
    let base = topic.base_page();

    let inquired = topic
        .ensure_subscription(&group, SubscribePhase::Inquire, None, None)
        .await
        .unwrap();
    assert_eq!(inquired, vec![None]);

    let pinned = topic
        .ensure_subscription(&group, SubscribePhase::Pin, None, None)
        .await
        .unwrap();
    // Empty topic: the cursor waits for the first page.
    assert_eq!(pinned, vec![Some(vec![PageId::NULL])]);

    // PIN alone does not initialise the group.
    let inquired = topic
        .ensure_subscription(&group, SubscribePhase::Inquire, None, None)
        .await
        .unwrap();
    assert_eq!(inquired, vec![None]);

    topic
        .ensure_subscription(&group, SubscribePhase::Advance(vec![base]), None, None)
        .await
        .unwrap();
    let inquired = topic
        .ensure_subscription(&group, SubscribePhase::Inquire, None, None)
        .await
        .unwrap();
    assert_eq!(inquired, vec![Some(vec![base])]);

    topic.shutdown().await;
}

#[tokio::test]
async fn commit_outcomes() {
    let topic = common::open_in_memory(single_partition("commit")).await;
    let group = SubscriberGroupId::durable("g");
    let base = topic.base_page();
    init_group(&topic, &group).await;

    offer(&topic, C0, base, &[b"a", b"b", b"c"], false).await;
    let polled = topic.poll(poll_request(&topic, &group, C0, base)).await.unwrap();
    assert_eq!(polled.status, PollStatus::Remaining(0));
    assert_eq!(polled_values(&polled), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    // Not read yet.
    let ahead = topic.commit(C0, &group, READER, Position::new(base, 5)).await.unwrap();
    assert_eq!(ahead.status, CommitStatus::Rejected);

    let committed = topic.commit(C0, &group, READER, Position::new(base, 1)).await.unwrap();
    assert_eq!(committed.status, CommitStatus::Committed);
    assert_eq!(committed.committed, Some(Position::new(base, 1)));
    assert_eq!(committed.rollback, Some(Position::new(base, 2)));

    let again = topic.commit(C0, &group, READER, Position::new(base, 0)).await.unwrap();
    assert_eq!(again.status, CommitStatus::AlreadyCommitted);

    let invalid = topic
        .commit(C0, &group, READER, Position::new(PageId::NULL, 0))
        .await
        .unwrap_err();
    assert!(matches!(invalid, Error::InvalidPosition(_)));

    let mut allocations = BTreeMap::new();
    allocations.insert(READER, vec![C0]);
    topic.update_channel_allocation(&group, allocations).await.unwrap();
    let stranger = topic
        .commit(C0, &group, SubscriberId::from_raw(99), Position::new(base, 2))
        .await
        .unwrap();
    assert_eq!(stranger.status, CommitStatus::Unowned);

    let heads = topic.heads(&group).await.unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].committed, Some(Position::new(base, 1)));

    topic.shutdown().await;
}

#[tokio::test]
async fn seek_by_position_and_timestamp() {
    let topic = common::open_in_memory(single_partition("seek")).await;
    let group = SubscriberGroupId::durable("g");
    let base = topic.base_page();
    init_group(&topic, &group).await;

    offer(&topic, C0, base, &[b"a", b"b", b"c"], false).await;
    topic.poll(poll_request(&topic, &group, C0, base)).await.unwrap();

    let seeked = topic
        .seek_position(C0, &group, READER, Position::new(base, 0))
        .await
        .unwrap();
    assert_eq!(seeked.status, SeekStatus::Seeked);
    assert_eq!(seeked.head, Some(Position::new(base, 1)));
    assert_eq!(seeked.seeked_to, Some(Position::new(base, 0)));
    assert_eq!(seeked.tail, Some(Position::new(base, 2)));

    let replay = topic.poll(poll_request(&topic, &group, C0, base)).await.unwrap();
    assert_eq!(polled_values(&replay), vec![b"b".to_vec(), b"c".to_vec()]);

    // Everything was published after the epoch.
    let from_start = topic.seek_timestamp(C0, &group, READER, 0).await.unwrap();
    assert_eq!(from_start.head, Some(Position::new(base, 0)));
    assert_eq!(from_start.seeked_to, None);
    let replay = topic.poll(poll_request(&topic, &group, C0, base)).await.unwrap();
    assert_eq!(replay.elements.len(), 3);

    // Nothing was published after the far future: read what comes next.
    let to_end = topic.seek_timestamp(C0, &group, READER, i64::MAX / 2).await.unwrap();
    assert_eq!(to_end.head, Some(Position::new(base, 3)));
    assert_eq!(to_end.seeked_to, Some(Position::new(base, 2)));
    let nothing = topic.poll(poll_request(&topic, &group, C0, base)).await.unwrap();
    assert!(nothing.elements.is_empty());
    assert_eq!(nothing.status, PollStatus::Remaining(0));

    let invalid = topic
        .seek_position(C0, &group, READER, Position::new(PageId::NULL, 0))
        .await
        .unwrap_err();
    assert!(matches!(invalid, Error::InvalidPosition(_)));

    topic.shutdown().await;
}

#[tokio::test]
async fn removing_last_group_removes_its_pages() {
    let topic = common::open_in_memory(single_partition("remove")).await;
    let group = SubscriberGroupId::durable("g");
    let base = topic.base_page();
    init_group(&topic, &group).await;

    offer(&topic, C0, base, &[b"a", b"b"], true).await;
    offer(&topic, C0, base.next(), &[b"c"], false).await;
    assert_eq!(topic.stored_bytes(), 3);

    assert!(topic.remove_subscription(&group).await.unwrap());
    assert!(!topic.remove_subscription(&group).await.unwrap());

    let stats = topic.stats().await.unwrap();
    assert_eq!(stats.totals.pages_created, 2);
    assert_eq!(stats.totals.pages_removed, 2);
    assert_eq!(topic.stored_bytes(), 0);

    topic.shutdown().await;
}

#[tokio::test]
async fn groups_attach_to_channels_added_later() {
    let topic = common::open_in_memory(single_partition("grow")).await;
    let group = SubscriberGroupId::durable("g");
    let base = topic.base_page();
    init_group(&topic, &group).await;

    assert_eq!(topic.increase_channel_count(2).await.unwrap(), 2);
    let c1 = ChannelId::from_raw(1);
    offer(&topic, c1, base, &[b"late"], false).await;

    let polled = topic.poll(poll_request(&topic, &group, c1, base)).await.unwrap();
    assert_eq!(polled_values(&polled), vec![b"late".to_vec()]);

    // A poll with the old channel count is told to reconnect.
    let mut stale = poll_request(&topic, &group, C0, base);
    stale.channel_count = 1;
    let result = topic.poll(stale).await.unwrap();
    assert_eq!(result.status, PollStatus::UnknownSubscriber);

    topic.shutdown().await;
}

#[tokio::test]
async fn filter_is_fixed_when_the_group_is_created() {
    let mut functions = FunctionRegistry::new();
    functions.register_filter("short", |e| e.value.len() < 3);
    let topic = PagedTopic::open_in_memory(single_partition("filter"), functions)
        .await
        .unwrap();
    let group = SubscriberGroupId::durable("g");
    let base = topic.base_page();

    topic
        .ensure_subscription(&group, SubscribePhase::Pin, Some("short"), None)
        .await
        .unwrap();
    topic
        .ensure_subscription(&group, SubscribePhase::Advance(vec![base]), Some("short"), None)
        .await
        .unwrap();

    offer(&topic, C0, base, &[b"ok", b"too long"], false).await;
    let polled = topic.poll(poll_request(&topic, &group, C0, base)).await.unwrap();
    assert_eq!(polled_values(&polled), vec![b"ok".to_vec()]);

    let mismatch = topic
        .ensure_subscription(&group, SubscribePhase::Inquire, None, None)
        .await
        .unwrap_err();
    assert!(matches!(mismatch, Error::FilterMismatch { .. }));

    let unknown = topic
        .ensure_subscription(&group, SubscribePhase::Inquire, Some("missing"), None)
        .await
        .unwrap_err();
    assert!(matches!(unknown, Error::UnknownFunction(_)));

    topic.shutdown().await;
}

#[tokio::test]
async fn topic_full_waits_for_page_removal() {
    let topic = common::open_in_memory(TopicConfig {
        server_capacity: 10,
        retain_consumed: true,
        ..single_partition("full")
    })
    .await;
    let base = topic.base_page();

    offer(&topic, C0, base, &[&[0u8; 10]], false).await;

    let notifier = topic.new_notifier_id();
    let mut listener = topic.listen();
    let full = topic
        .offer(OfferRequest {
            channel: C0,
            page: base,
            values: vec![vec![1]],
            notify_on_full: Some(notifier),
            seal: false,
        })
        .await
        .unwrap();
    assert_eq!(full.status, OfferStatus::TopicFull);
    assert_eq!(full.accepted, 0);

    assert!(topic.remove_page(C0, base).await.unwrap());
    assert!(listener.wait_for(notifier, Duration::from_secs(1)).await);
    assert_eq!(topic.stored_bytes(), 0);

    topic.shutdown().await;
}
