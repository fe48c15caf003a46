//! End-to-end conversations against the in-process broker

use async_trait::async_trait;
use colloquy::{
    BackgroundTask, ConversationConfig, ConversationError, ExchangeName, InMemoryBroker,
    PublishConfirmPolicy, RetryPolicy, Role, RoutingKey, Session, TaskContext, TaskError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn config() -> ConversationConfig {
    ConversationConfig::default().with_response_delay(Duration::ZERO)
}

fn short_wait() -> RetryPolicy {
    RetryPolicy::default().with_fetch_timeout(Duration::from_millis(100))
}

struct Failing {
    runs: AtomicU32,
}

#[async_trait]
impl BackgroundTask for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _ctx: TaskContext) -> Result<(), TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err("sensor offline".into())
    }
}

struct Panicking;

#[async_trait]
impl BackgroundTask for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        if ctx.attempt.is_none() {
            panic!("round-level task exploded");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_full_four_round_conversation() {
    let broker = InMemoryBroker::new();
    let config = config();

    let mut talker = Session::new(broker.clone(), config.clone());
    let mut listener = Session::new(broker.clone(), config.clone());
    let (talked, listened) = tokio::join!(talker.run("start"), listener.run("listen"));
    let talked = talked.unwrap();
    let listened = listened.unwrap();

    assert_eq!(talked.rounds(), 4);
    assert_eq!(listened.rounds(), 4);
    for round in 0..4 {
        let talk = &config.talk_messages[round];
        let reply = &config.reply_messages[round];
        assert_eq!(&talked.logs[round][0], talk);
        assert_eq!(&talked.logs[round][1], reply);
        assert_eq!(&listened.logs[round][0], talk);
        assert_eq!(&listened.logs[round][1], reply);
    }

    assert_eq!(talked.stats.messages_published, 4);
    assert_eq!(talked.stats.messages_received, 4);
    assert_eq!(listened.stats.background_failures, 0);
    assert_ne!(talked.session_id, listened.session_id);

    let stats = broker.stats().await;
    assert_eq!(stats.connections_opened, 2);
    assert_eq!(stats.close_calls, 2);
    assert_eq!(stats.messages_acked, 8);
    assert!(!broker.exchange_exists(&config.exchange).await);
}

#[tokio::test]
async fn test_publishes_alternate_between_roles() {
    let broker = InMemoryBroker::new();
    let config = config();

    let mut talker = Session::new(broker.clone(), config.clone());
    let mut listener = Session::new(broker.clone(), config.clone());
    let (talked, listened) = tokio::join!(
        talker.run_as(Role::Talker),
        listener.run_as(Role::Listener)
    );
    talked.unwrap();
    listened.unwrap();

    let published = broker.published().await;
    let keys: Vec<&str> = published.iter().map(|p| p.routing_key.as_str()).collect();
    assert_eq!(
        keys,
        ["Queue1", "Queue2", "Queue1", "Queue2", "Queue1", "Queue2", "Queue1", "Queue2"]
    );

    let bodies: Vec<&str> = published.iter().map(|p| p.body.as_str()).collect();
    assert_eq!(bodies[0], "Hello?");
    assert_eq!(bodies[1], "Hello! It's good to hear from you!");
    assert_eq!(bodies[6], "I like 77, 6F, 6E and 21!");
    assert_eq!(bodies[7], "Fantastic!");
    assert!(published.iter().all(|p| p.exchange == "colloquy.direct"));
}

#[tokio::test]
async fn test_two_round_scenario() {
    let broker = InMemoryBroker::new();
    let config = config().with_messages(["Hi", "Bye"], ["Hello", "Ciao"]);

    let mut talker = Session::new(broker.clone(), config.clone());
    let mut listener = Session::new(broker.clone(), config);
    let (talked, listened) = tokio::join!(talker.run("talker"), listener.run("Listener"));

    let expected = vec![
        vec!["Hi".to_string(), "Hello".to_string()],
        vec!["Bye".to_string(), "Ciao".to_string()],
    ];
    assert_eq!(talked.unwrap().logs, expected);
    assert_eq!(listened.unwrap().logs, expected);
}

#[tokio::test(start_paused = true)]
async fn test_listener_joins_late() {
    let broker = InMemoryBroker::new();
    let config = config().with_messages(["Hi"], ["Hello"]);

    let mut talker = Session::new(broker.clone(), config.clone());
    let mut listener = Session::new(broker.clone(), config);
    let late_listener = async {
        tokio::time::sleep(Duration::from_secs(12)).await;
        listener.run_as(Role::Listener).await
    };

    let (talked, listened) = tokio::join!(talker.run_as(Role::Talker), late_listener);
    let talked = talked.unwrap();
    listened.unwrap();

    assert_eq!(talked.logs, [["Hi", "Hello"]]);
    assert!(talked.stats.empty_polls >= 2);
}

#[tokio::test]
async fn test_zero_rounds_closes_once() {
    let broker = InMemoryBroker::new();
    let config = config().with_messages(Vec::<String>::new(), Vec::<String>::new());

    let report = Session::new(broker.clone(), config)
        .run_as(Role::Talker)
        .await
        .unwrap();

    assert_eq!(report.rounds(), 0);
    assert!(broker.published().await.is_empty());

    let stats = broker.stats().await;
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.close_calls, 1);
    assert_eq!(broker.open_connections().await, 0);
}

#[tokio::test]
async fn test_huge_fetch_timeout_from_config() {
    let config = ConversationConfig::load_from_toml(
        r#"
        talk_messages = ["Hi"]
        reply_messages = ["Hello"]
        response_delay = "0s"

        [retry]
        fetch_timeout = "500000000000years"
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let broker = InMemoryBroker::new();
    let mut talker = Session::new(broker.clone(), config.clone());
    let mut listener = Session::new(broker.clone(), config);
    let (talked, listened) = tokio::join!(talker.run("start"), listener.run("listen"));

    assert_eq!(talked.unwrap().logs, [["Hi", "Hello"]]);
    assert_eq!(listened.unwrap().logs, [["Hi", "Hello"]]);
}

#[tokio::test]
async fn test_sessions_can_repeat_on_same_broker() {
    let broker = InMemoryBroker::new();
    let config = config().with_messages(["ping"], ["pong"]);

    for _ in 0..2 {
        let mut talker = Session::new(broker.clone(), config.clone());
        let mut listener = Session::new(broker.clone(), config.clone());
        let (talked, listened) = tokio::join!(talker.run("start"), listener.run("listen"));
        assert_eq!(talked.unwrap().logs, [["ping", "pong"]]);
        assert_eq!(listened.unwrap().logs, [["ping", "pong"]]);
    }

    assert_eq!(broker.stats().await.close_calls, 4);
}

#[tokio::test]
async fn test_unreachable_broker() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);

    let err = Session::new(broker.clone(), config())
        .run("start")
        .await
        .unwrap_err();

    assert!(matches!(err, ConversationError::Connectivity(_)));
    assert!(err.is_setup_failure());
    assert_eq!(err.exit_code(), 1);
    assert_eq!(broker.stats().await.close_calls, 0);
}

#[tokio::test]
async fn test_unknown_role() {
    let broker = InMemoryBroker::new();

    let err = Session::new(broker.clone(), config())
        .run("observer")
        .await
        .unwrap_err();

    assert!(matches!(err, ConversationError::Configuration(_)));
    assert_eq!(broker.stats().await.connections_opened, 0);
}

#[tokio::test(start_paused = true)]
async fn test_severed_connection_aborts_and_closes_once() {
    let broker = InMemoryBroker::new();
    let mut talker = Session::new(broker.clone(), config());

    let cutter = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.sever_connections().await
    };

    let (result, severed) = tokio::join!(talker.run_as(Role::Talker), cutter);
    assert_eq!(severed, 1);

    let err = result.unwrap_err();
    assert!(matches!(err, ConversationError::Transport(_)));
    assert!(!err.is_setup_failure());
    assert_eq!(broker.stats().await.close_calls, 1);
    assert_eq!(broker.published().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_limit_ends_session() {
    let broker = InMemoryBroker::new();
    let config = config().with_retry(short_wait().with_max_attempts(2));

    let err = Session::new(broker.clone(), config)
        .run_as(Role::Talker)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConversationError::RetryExhausted {
            role: Role::Talker,
            round: 0,
            attempts: 2
        }
    ));
    assert_eq!(broker.stats().await.close_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_ends_session() {
    let broker = InMemoryBroker::new();
    let config = config().with_retry(RetryPolicy::default().with_deadline(Duration::from_secs(2)));

    let started = Instant::now();
    let err = Session::new(broker.clone(), config)
        .run_as(Role::Listener)
        .await
        .unwrap_err();

    match err {
        ConversationError::DeadlineExceeded {
            role,
            round,
            deadline,
        } => {
            assert_eq!(role, Role::Listener);
            assert_eq!(round, 0);
            assert_eq!(deadline, Duration::from_secs(2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(broker.stats().await.close_calls, 1);
}

#[tokio::test]
async fn test_failing_background_task_never_fails_a_round() {
    let broker = InMemoryBroker::new();
    let task = Arc::new(Failing {
        runs: AtomicU32::new(0),
    });
    let config = config().with_messages(["a", "b"], ["x", "y"]);

    let mut talker =
        Session::new(broker.clone(), config.clone()).with_background_task(task.clone());
    let mut listener = Session::new(broker.clone(), config).with_round_task(Arc::new(Panicking));
    let (talked, listened) = tokio::join!(talker.run("start"), listener.run("listen"));

    let talked = talked.unwrap();
    let listened = listened.unwrap();
    assert_eq!(talked.logs, [["a", "x"], ["b", "y"]]);
    assert_eq!(listened.logs, [["a", "x"], ["b", "y"]]);

    let runs = u64::from(task.runs.load(Ordering::SeqCst));
    assert!(runs >= 4);
    assert_eq!(talked.stats.background_failures, runs);
    assert_eq!(listened.stats.background_failures, 2);
}

#[tokio::test]
async fn test_strict_confirm_rejects_nacked_publish() {
    let broker = InMemoryBroker::new();
    broker
        .nack_publishes_to(RoutingKey::new_unchecked("Queue1"))
        .await;
    let config = config()
        .with_exchange(ExchangeName::new_unchecked("strict.direct"))
        .with_publish_confirm(PublishConfirmPolicy::Strict);

    let err = Session::new(broker.clone(), config)
        .run_as(Role::Talker)
        .await
        .unwrap_err();

    match err {
        ConversationError::PublishRejected { routing_key } => assert_eq!(routing_key, "Queue1"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.stats().await.close_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_permissive_confirm_keeps_going_after_nack() {
    let broker = InMemoryBroker::new();
    broker
        .nack_publishes_to(RoutingKey::new_unchecked("Queue1"))
        .await;
    let config = config().with_retry(short_wait().with_max_attempts(1));

    let err = Session::new(broker.clone(), config)
        .run_as(Role::Talker)
        .await
        .unwrap_err();

    // The nacked line never arrives, so the Talker runs out of attempts
    // instead of failing on the publish.
    assert!(matches!(err, ConversationError::RetryExhausted { .. }));
}
