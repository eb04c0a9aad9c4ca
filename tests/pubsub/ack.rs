//! Handler outcomes and how the broker sees them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peril_pubsub::bus::{
    subscribe_json, sync_handler, Channel, Connection, Envelope, Publisher, QueueKind,
    JSON_CONTENT_TYPE,
};
use peril_pubsub::routing::{
    self, ARMY_MOVES_PREFIX, DEAD_LETTER_QUEUE, EXCHANGE_PERIL_TOPIC, WAR_RECOGNITIONS_PREFIX,
};
use peril_pubsub::AckType;

use crate::support::{setup, wait_until, ArmyMove, RecognitionOfWar};

#[tokio::test]
async fn acked_move_leaves_the_queue_empty() {
    let (broker, conn) = setup().await;
    let queue = routing::queue_name(ARMY_MOVES_PREFIX, "alice");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sub = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        &queue,
        &routing::wildcard(ARMY_MOVES_PREFIX),
        QueueKind::Transient,
        {
            let seen = Arc::clone(&seen);
            move |mv: ArmyMove| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(mv);
                    AckType::Ack
                }
            }
        },
    )
    .await
    .unwrap();
    assert_eq!(sub.queue().name, queue);

    let publisher = Publisher::open(&conn).await.unwrap();
    let mv = ArmyMove::new("alice", 3, "Asia");
    publisher
        .publish_json(
            EXCHANGE_PERIL_TOPIC,
            &routing::routing_key(ARMY_MOVES_PREFIX, "alice"),
            &mv,
        )
        .await
        .unwrap();

    wait_until("move handled", || seen.lock().unwrap().len() == 1).await;
    wait_until("move acked", || broker.message_count(&queue) == 0).await;
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].units, 3);
        assert_eq!(seen[0].to_location, "Asia");
    }

    conn.close().await.unwrap();
    let stats = sub.join().await.unwrap();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.settled(), 1);
}

#[tokio::test]
async fn requeued_message_stays_on_the_durable_queue() {
    let (broker, conn) = setup().await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let sub = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        WAR_RECOGNITIONS_PREFIX,
        &routing::wildcard(WAR_RECOGNITIONS_PREFIX),
        QueueKind::Durable,
        {
            let attempts = Arc::clone(&attempts);
            move |_: RecognitionOfWar| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    AckType::NackRequeue
                }
            }
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(
            EXCHANGE_PERIL_TOPIC,
            "war.alice",
            &RecognitionOfWar::new("alice", "bob"),
        )
        .await
        .unwrap();

    wait_until("several redeliveries", || attempts.load(Ordering::SeqCst) >= 5).await;
    assert_eq!(broker.message_count(WAR_RECOGNITIONS_PREFIX), 1);
    assert!(broker.ready_messages(DEAD_LETTER_QUEUE).is_empty());

    conn.close().await.unwrap();
    let stats = sub.join().await.unwrap();
    assert!(stats.requeued >= 4, "{stats:?}");
    assert_eq!(stats.acked, 0);

    assert_eq!(broker.message_count(WAR_RECOGNITIONS_PREFIX), 1);
    assert_eq!(broker.ready_count(WAR_RECOGNITIONS_PREFIX), 1);
}

#[tokio::test]
async fn discarded_message_is_dead_lettered_once() {
    let (broker, conn) = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let sub = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        WAR_RECOGNITIONS_PREFIX,
        &routing::wildcard(WAR_RECOGNITIONS_PREFIX),
        QueueKind::Durable,
        {
            let calls = Arc::clone(&calls);
            sync_handler(move |_: RecognitionOfWar| {
                calls.fetch_add(1, Ordering::SeqCst);
                AckType::NackDiscard
            })
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(
            EXCHANGE_PERIL_TOPIC,
            "war.alice",
            &RecognitionOfWar::new("alice", "bob"),
        )
        .await
        .unwrap();

    wait_until("dead-lettered", || broker.ready_count(DEAD_LETTER_QUEUE) == 1).await;
    assert_eq!(broker.message_count(WAR_RECOGNITIONS_PREFIX), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let dead = broker.ready_messages(DEAD_LETTER_QUEUE);
    assert_eq!(dead[0].routing_key, "war.alice");
    assert_eq!(dead[0].content_type, JSON_CONTENT_TYPE);
    let body: RecognitionOfWar = serde_json::from_slice(&dead[0].body).unwrap();
    assert_eq!(body, RecognitionOfWar::new("alice", "bob"));

    let settlements = broker.settlements_for(WAR_RECOGNITIONS_PREFIX);
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].outcome, AckType::NackDiscard);

    conn.close().await.unwrap();
    assert_eq!(sub.join().await.unwrap().discarded, 1);
}

#[tokio::test]
async fn undecodable_message_is_discarded_without_calling_the_handler() {
    let (broker, conn) = setup().await;
    let queue = routing::queue_name(ARMY_MOVES_PREFIX, "alice");
    let calls = Arc::new(AtomicUsize::new(0));

    let sub = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        &queue,
        &routing::wildcard(ARMY_MOVES_PREFIX),
        QueueKind::Transient,
        {
            let calls = Arc::clone(&calls);
            sync_handler(move |_: ArmyMove| {
                calls.fetch_add(1, Ordering::SeqCst);
                AckType::Ack
            })
        },
    )
    .await
    .unwrap();

    let channel = conn.create_channel().await.unwrap();
    channel
        .publish(
            EXCHANGE_PERIL_TOPIC,
            Envelope::new("army_moves.bob", JSON_CONTENT_TYPE, b"not json".to_vec()),
        )
        .await
        .unwrap();

    wait_until("bad message settled", || {
        broker.settlements_for(&queue).len() == 1
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        broker.settlements_for(&queue)[0].outcome,
        AckType::NackDiscard
    );

    // The loop keeps going after a bad message.
    Publisher::new(channel)
        .publish_json(EXCHANGE_PERIL_TOPIC, "army_moves.bob", &ArmyMove::new("bob", 1, "asia"))
        .await
        .unwrap();
    wait_until("good message handled", || calls.load(Ordering::SeqCst) == 1).await;
    wait_until("good message acked", || broker.message_count(&queue) == 0).await;

    conn.close().await.unwrap();
    let stats = sub.join().await.unwrap();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn every_delivery_is_settled_exactly_once() {
    let (broker, conn) = setup().await;

    let sub = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        WAR_RECOGNITIONS_PREFIX,
        &routing::wildcard(WAR_RECOGNITIONS_PREFIX),
        QueueKind::Durable,
        sync_handler(|war: RecognitionOfWar| {
            if war.defender.ends_with(|c: char| c.to_digit(10).is_some_and(|d| d % 2 == 0)) {
                AckType::Ack
            } else {
                AckType::NackDiscard
            }
        }),
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    for i in 0..20 {
        publisher
            .publish_json(
                EXCHANGE_PERIL_TOPIC,
                "war.alice",
                &RecognitionOfWar::new("alice", &format!("player{i}")),
            )
            .await
            .unwrap();
    }

    wait_until("all settled", || {
        broker.settlements_for(WAR_RECOGNITIONS_PREFIX).len() == 20
    })
    .await;

    let settlements = broker.settlements_for(WAR_RECOGNITIONS_PREFIX);
    let tags: HashSet<u64> = settlements.iter().map(|s| s.delivery_tag).collect();
    assert_eq!(tags.len(), 20);
    let acked = settlements.iter().filter(|s| s.outcome.is_ack()).count();
    assert_eq!(acked, 10);
    assert_eq!(broker.ready_count(DEAD_LETTER_QUEUE), 10);
    assert_eq!(broker.message_count(WAR_RECOGNITIONS_PREFIX), 0);

    conn.close().await.unwrap();
    let stats = sub.join().await.unwrap();
    assert_eq!(stats.settled(), 20);
}

#[tokio::test]
async fn panicking_handler_discards_and_keeps_consuming() {
    let (broker, conn) = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let sub = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        WAR_RECOGNITIONS_PREFIX,
        &routing::wildcard(WAR_RECOGNITIONS_PREFIX),
        QueueKind::Durable,
        {
            let calls = Arc::clone(&calls);
            sync_handler(move |war: RecognitionOfWar| {
                calls.fetch_add(1, Ordering::SeqCst);
                if war.defender == "nobody" {
                    panic!("no defender");
                }
                AckType::Ack
            })
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    for defender in ["nobody", "bob"] {
        publisher
            .publish_json(
                EXCHANGE_PERIL_TOPIC,
                "war.alice",
                &RecognitionOfWar::new("alice", defender),
            )
            .await
            .unwrap();
    }

    wait_until("both settled", || {
        broker.settlements_for(WAR_RECOGNITIONS_PREFIX).len() == 2
    })
    .await;
    let outcomes: Vec<AckType> = broker
        .settlements_for(WAR_RECOGNITIONS_PREFIX)
        .iter()
        .map(|s| s.outcome)
        .collect();
    assert_eq!(outcomes, vec![AckType::NackDiscard, AckType::Ack]);
    assert_eq!(broker.ready_count(DEAD_LETTER_QUEUE), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(!sub.is_finished());
    conn.close().await.unwrap();
    let stats = sub.join().await.unwrap();
    assert_eq!(stats.handler_panics, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.acked, 1);
}
