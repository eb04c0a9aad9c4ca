//! JSON and binary payloads on the same broker.

use std::sync::{Arc, Mutex};

use peril_pubsub::bus::{
    declare_and_bind, subscribe_binary, subscribe_json, Binary, Codec, Connection, Publisher,
    QueueKind,
    BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE,
};
use peril_pubsub::routing::{
    self, GameLog, PlayingState, EXCHANGE_PERIL_DIRECT, EXCHANGE_PERIL_TOPIC, GAME_LOG_SLUG,
    PAUSE_KEY, WAR_RECOGNITIONS_PREFIX,
};
use peril_pubsub::AckType;

use crate::support::{setup, wait_until, RecognitionOfWar};

#[tokio::test]
async fn published_messages_carry_their_content_type() {
    let (broker, conn) = setup().await;

    declare_and_bind(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        &routing::wildcard(GAME_LOG_SLUG),
        QueueKind::Durable,
    )
    .await
    .unwrap();
    declare_and_bind(
        &conn,
        EXCHANGE_PERIL_DIRECT,
        "pause.observer",
        PAUSE_KEY,
        QueueKind::Durable,
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    let log = GameLog::new("alice moved 3 units to europe", "alice");
    publisher
        .publish_binary(
            EXCHANGE_PERIL_TOPIC,
            &routing::routing_key(GAME_LOG_SLUG, "alice"),
            &log,
        )
        .await
        .unwrap();
    publisher
        .publish_json(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &PlayingState { is_paused: true })
        .await
        .unwrap();

    let logs = broker.ready_messages(GAME_LOG_SLUG);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].content_type, BINARY_CONTENT_TYPE);
    assert_eq!(Binary::decode::<GameLog>(&logs[0].body).unwrap(), log);

    let pauses = broker.ready_messages("pause.observer");
    assert_eq!(pauses[0].content_type, JSON_CONTENT_TYPE);
    assert_eq!(pauses[0].body_str(), Some(r#"{"IsPaused":true}"#));
}

#[tokio::test]
async fn binary_subscription_decodes_game_logs() {
    let (broker, conn) = setup().await;
    let logs = Arc::new(Mutex::new(Vec::new()));

    let sub = subscribe_binary(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        &routing::wildcard(GAME_LOG_SLUG),
        QueueKind::Durable,
        {
            let logs = Arc::clone(&logs);
            move |log: GameLog| {
                let logs = Arc::clone(&logs);
                async move {
                    logs.lock().unwrap().push(log);
                    AckType::Ack
                }
            }
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    let log = GameLog::new("bob won a war against alice", "bob");
    publisher
        .publish_binary(EXCHANGE_PERIL_TOPIC, "game_logs.bob", &log)
        .await
        .unwrap();

    wait_until("log received", || logs.lock().unwrap().len() == 1).await;
    assert_eq!(logs.lock().unwrap()[0], log);
    wait_until("log acked", || broker.message_count(GAME_LOG_SLUG) == 0).await;

    conn.close().await.unwrap();
    sub.join().await.unwrap();
}

#[tokio::test]
async fn json_on_a_binary_subscription_is_discarded() {
    let (broker, conn) = setup().await;

    let sub = subscribe_binary(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        &routing::wildcard(GAME_LOG_SLUG),
        QueueKind::Durable,
        |_: GameLog| async { AckType::Ack },
    )
    .await
    .unwrap();

    Publisher::open(&conn)
        .await
        .unwrap()
        .publish_json(EXCHANGE_PERIL_TOPIC, "game_logs.bob", &PlayingState { is_paused: false })
        .await
        .unwrap();

    wait_until("mismatched payload settled", || {
        broker.settlements_for(GAME_LOG_SLUG).len() == 1
    })
    .await;
    assert_eq!(
        broker.settlements_for(GAME_LOG_SLUG)[0].outcome,
        AckType::NackDiscard
    );

    conn.close().await.unwrap();
    let stats = sub.join().await.unwrap();
    assert_eq!(stats.decode_failures, 1);
}

#[tokio::test]
async fn handler_publishes_a_follow_up_log() {
    let (broker, conn) = setup().await;
    let publisher = Publisher::open(&conn).await.unwrap();
    let logs = Arc::new(Mutex::new(Vec::new()));

    let wars = subscribe_json(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        WAR_RECOGNITIONS_PREFIX,
        &routing::wildcard(WAR_RECOGNITIONS_PREFIX),
        QueueKind::Durable,
        {
            let publisher = publisher.clone();
            move |war: RecognitionOfWar| {
                let publisher = publisher.clone();
                async move {
                    let log = GameLog::new(
                        format!("{} won a war against {}", war.attacker, war.defender),
                        war.attacker.clone(),
                    );
                    let key = routing::routing_key(GAME_LOG_SLUG, &war.attacker);
                    match publisher.publish_binary(EXCHANGE_PERIL_TOPIC, &key, &log).await {
                        Ok(()) => AckType::Ack,
                        Err(_) => AckType::NackRequeue,
                    }
                }
            }
        },
    )
    .await
    .unwrap();

    let game_logs = subscribe_binary(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        &routing::wildcard(GAME_LOG_SLUG),
        QueueKind::Durable,
        {
            let logs = Arc::clone(&logs);
            move |log: GameLog| {
                let logs = Arc::clone(&logs);
                async move {
                    logs.lock().unwrap().push(log);
                    AckType::Ack
                }
            }
        },
    )
    .await
    .unwrap();

    publisher
        .publish_json(
            EXCHANGE_PERIL_TOPIC,
            "war.alice",
            &RecognitionOfWar::new("alice", "bob"),
        )
        .await
        .unwrap();

    wait_until("follow-up log", || logs.lock().unwrap().len() == 1).await;
    {
        let logs = logs.lock().unwrap();
        assert_eq!(logs[0].username, "alice");
        assert_eq!(logs[0].message, "alice won a war against bob");
    }
    wait_until("both queues drained", || {
        broker.message_count(WAR_RECOGNITIONS_PREFIX) == 0
            && broker.message_count(GAME_LOG_SLUG) == 0
    })
    .await;

    conn.close().await.unwrap();
    assert_eq!(wars.join().await.unwrap().acked, 1);
    assert_eq!(game_logs.join().await.unwrap().acked, 1);
}
