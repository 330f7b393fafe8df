mod common;

use std::time::Duration;

use pagedtopic::{
    ChannelId, CommitStatus, PageId, Position, Publisher, PublisherConfig, Subscriber,
    SubscriberGroupId, TopicConfig,
};

fn value(i: usize) -> Vec<u8> {
    format!("v{i:03}").into_bytes()
}

#[tokio::test]
async fn elements_arrive_in_order_across_pages_and_partitions() {
    // Two 4-byte values per page, so pages rotate through all partitions.
    let topic = common::open_in_memory(TopicConfig {
        page_capacity: 8,
        ..common::topic_config("ordered", 3, 1)
    })
    .await;
    let subscriber = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();

    for i in 0..10 {
        let status = publisher.publish(value(i)).unwrap().await.unwrap();
        assert!(status.position.is_some());
    }

    let received = common::receive_n(&subscriber, 10).await;
    let expected: Vec<Vec<u8>> = (0..10).map(value).collect();
    assert_eq!(common::values(&received), expected);

    let pages: Vec<_> = received.iter().map(|e| e.page).collect();
    assert!(pages.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(pages.first(), Some(&topic.base_page()));

    publisher.close().await;
    subscriber.close().await.unwrap();
    topic.shutdown().await;
}

#[tokio::test]
async fn receive_waits_for_later_publish() {
    let topic = common::open_in_memory(common::topic_config("waiting", 2, 1)).await;
    let subscriber = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();

    let pending = subscriber.receive().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_done());

    publisher.publish(b"late".to_vec()).unwrap().await.unwrap();
    let element = tokio::time::timeout(common::RECEIVE_TIMEOUT, pending)
        .await
        .expect("element not delivered")
        .unwrap();
    assert_eq!(element.value, b"late".to_vec());

    publisher.close().await;
    topic.shutdown().await;
}

#[tokio::test]
async fn each_channel_keeps_its_own_order() {
    let topic = common::open_in_memory(common::topic_config("channels", 3, 2)).await;
    let subscriber = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();

    for i in 0..3 {
        publisher
            .publish_to(ChannelId::from_raw(0), format!("a{i}").into_bytes())
            .unwrap();
        publisher
            .publish_to(ChannelId::from_raw(1), format!("b{i}").into_bytes())
            .unwrap();
    }
    publisher.flush().await;

    let received = common::receive_n(&subscriber, 6).await;
    for (channel, prefix) in [(0, b'a'), (1, b'b')] {
        let in_channel: Vec<Vec<u8>> = received
            .iter()
            .filter(|e| e.channel == ChannelId::from_raw(channel))
            .map(|e| e.value.clone())
            .collect();
        let expected: Vec<Vec<u8>> = (0..3).map(|i| vec![prefix, b'0' + i]).collect();
        assert_eq!(in_channel, expected);
    }

    publisher.close().await;
    topic.shutdown().await;
}

#[tokio::test]
async fn every_group_sees_every_element() {
    let topic = common::open_in_memory(common::topic_config("fanout", 2, 1)).await;
    let first = Subscriber::connect(topic.clone(), common::durable("one"))
        .await
        .unwrap();
    let second = Subscriber::connect(topic.clone(), common::durable("two"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();

    for i in 0..4 {
        publisher.publish(value(i)).unwrap();
    }
    publisher.flush().await;

    let expected: Vec<Vec<u8>> = (0..4).map(value).collect();
    assert_eq!(common::values(&common::receive_n(&first, 4).await), expected);
    assert_eq!(common::values(&common::receive_n(&second, 4).await), expected);

    publisher.close().await;
    topic.shutdown().await;
}

#[tokio::test]
async fn uncommitted_elements_are_redelivered_to_the_next_member() {
    let topic = common::open_in_memory(common::topic_config("redeliver", 1, 1)).await;
    let first = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();
    for i in 0..3 {
        publisher.publish(value(i)).unwrap();
    }
    publisher.flush().await;

    let received = common::receive_n(&first, 3).await;
    let commit = first
        .commit(ChannelId::ZERO, received[0].position())
        .await
        .unwrap();
    assert_eq!(commit.status, pagedtopic::CommitStatus::Committed);
    first.close().await.unwrap();

    let second = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let redelivered = common::receive_n(&second, 2).await;
    assert_eq!(common::values(&redelivered), vec![value(1), value(2)]);

    publisher.close().await;
    topic.shutdown().await;
}

#[tokio::test]
async fn seek_rewinds_a_live_subscriber() {
    let topic = common::open_in_memory(common::topic_config("rewind", 1, 1)).await;
    let subscriber = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();
    for i in 0..3 {
        publisher.publish(value(i)).unwrap();
    }
    publisher.flush().await;

    let received = common::receive_n(&subscriber, 3).await;
    let seeked = subscriber
        .seek(ChannelId::ZERO, received[0].position())
        .await
        .unwrap();
    assert_eq!(seeked.head, Some(received[1].position()));

    let again = common::receive_n(&subscriber, 2).await;
    assert_eq!(common::values(&again), vec![value(1), value(2)]);

    publisher.close().await;
    topic.shutdown().await;
}

#[tokio::test]
async fn closing_an_anonymous_subscriber_removes_its_group() {
    let topic = common::open_in_memory(common::topic_config("anon", 1, 1)).await;
    let subscriber = Subscriber::connect(topic.clone(), common::anonymous())
        .await
        .unwrap();
    assert!(subscriber.group().is_anonymous());

    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();
    let kept = publisher.publish(b"kept".to_vec()).unwrap().await.unwrap();
    assert!(kept.position.is_some());

    subscriber.close().await.unwrap();
    assert!(matches!(
        subscriber.receive(),
        Err(pagedtopic::Error::QueueInactive)
    ));

    // Nobody subscribes any more: values are accepted and dropped.
    let dropped = publisher.publish(b"dropped".to_vec()).unwrap().await.unwrap();
    assert_eq!(dropped.position, None);
    assert_eq!(topic.stored_bytes(), 0);

    publisher.close().await;
    topic.shutdown().await;
}

#[tokio::test]
async fn commit_ahead_of_the_reader_leaves_the_group_joinable() {
    // One 4-byte value per page.
    let topic = common::open_in_memory(TopicConfig {
        page_capacity: 4,
        ..common::topic_config("ahead", 1, 1)
    })
    .await;
    let group = SubscriberGroupId::durable("g");
    let first = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let publisher = Publisher::new(topic.clone(), PublisherConfig::default())
        .await
        .unwrap();
    publisher.publish(value(0)).unwrap();
    publisher.publish(value(1)).unwrap();
    publisher.flush().await;

    let received = common::receive_n(&first, 1).await;
    let commit = first
        .commit(ChannelId::ZERO, received[0].position())
        .await
        .unwrap();
    assert_eq!(commit.status, CommitStatus::Committed);

    // The reader sits at the start of the next page; page base+3 is unread.
    let unread = Position::new(PageId::from_raw(topic.base_page().as_raw() + 3), 0);
    let ahead = first.commit(ChannelId::ZERO, unread).await.unwrap();
    assert_eq!(ahead.status, CommitStatus::Rejected);

    let heads = topic.heads(&group).await.unwrap();
    assert_eq!(heads[0].committed, Some(received[0].position()));
    first.close().await.unwrap();

    let second = Subscriber::connect(topic.clone(), common::durable("g"))
        .await
        .unwrap();
    let rest = common::receive_n(&second, 1).await;
    assert_eq!(common::values(&rest), vec![value(1)]);

    publisher.close().await;
    topic.shutdown().await;
}
