//! End-to-end tests: inbound message → rate limiter → session → pipeline →
//! formatter → outbound channel, with a stub stage client.

mod common;

use std::time::Duration;

use compliance_advisor::dispatcher::{self, handle_message};
use compliance_advisor::format;
use compliance_advisor::session::SessionState;
use compliance_advisor::store::Direction;
use compliance_advisor::workflow::types::Stage;

use common::{Harness, StubStages, config, message};

const SENDER: &str = "+254712345678";
const OTHER: &str = "+254722000111";

#[tokio::test]
async fn westlands_electronics_shop_gets_a_roadmap() {
    let harness = Harness::new(config(&[]), StubStages::default()).await;

    handle_message(
        &harness.state,
        message("wamid.1", SENDER, "I sell electronics in Westlands"),
    )
    .await;

    let texts = harness.channel.texts_for(SENDER);
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[0], format::processing_message());

    let roadmap = &texts[1];
    assert!(roadmap.contains("*Business Type:* Electronics Retail"));
    assert!(roadmap.contains("*Location:* Nairobi"));
    let mandatory = roadmap.find("*Mandatory Requirements*").unwrap();
    let conditional = roadmap.find("*Conditional Requirements*").unwrap();
    assert!(mandatory < conditional);
    assert!(roadmap.contains("KSh 5,000"));
    assert!(roadmap.contains("Total Cost: KSh 8,500"));
    assert!(roadmap.contains("Free"));

    for stage in Stage::ALL {
        assert_eq!(harness.stages.calls_for(stage), 1, "{stage} called once");
    }

    let session = harness.state.sessions.get(SENDER).await.unwrap();
    assert_eq!(session.state, SessionState::Complete);
    assert_eq!(session.business_type.as_deref(), Some("Electronics Retail"));
    assert_eq!(session.specific_area.as_deref(), Some("Westlands"));

    // Totals come from the steps, not from the planner's claim.
    let stored = harness.db.get_roadmap(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.total_estimated_cost(), 8500);
    assert_eq!(stored.total_timeline_days(), 15);

    let log = harness
        .db
        .conversation_history(&session.session_id, 10)
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].direction, Direction::Inbound);
    assert_eq!(log[0].content, "I sell electronics in Westlands");
    assert_eq!(log[1].direction, Direction::Outbound);
}

#[tokio::test]
async fn completed_session_is_not_resumed() {
    let harness = Harness::new(config(&[]), StubStages::default()).await;

    handle_message(&harness.state, message("a", SENDER, "I sell electronics in Westlands")).await;
    let first = harness.state.sessions.get(SENDER).await.unwrap();

    handle_message(&harness.state, message("b", SENDER, "I run a salon in Mombasa")).await;
    let second = harness.state.sessions.get(SENDER).await.unwrap();

    assert_ne!(first.session_id, second.session_id);
    assert_eq!(second.state, SessionState::Complete);
    assert_eq!(second.message_count, 1);
}

#[tokio::test]
async fn exhausted_stage_fails_session_and_notifies_user() {
    let stages = StubStages {
        planner_down: true,
        ..Default::default()
    };
    let harness = Harness::new(config(&[]), stages).await;

    handle_message(&harness.state, message("a", SENDER, "I sell electronics in Westlands")).await;

    // One call plus three retries.
    assert_eq!(harness.stages.calls_for(Stage::Planning), 4);
    let texts = harness.channel.texts_for(SENDER);
    assert_eq!(texts.last().unwrap(), format::failure_message());

    let session = harness.state.sessions.get(SENDER).await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    assert!(
        harness
            .state
            .sessions
            .roadmap(&session.session_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn throttled_sender_is_notified_without_session_change() {
    let harness = Harness::new(
        config(&[("RATE_LIMIT_BURST", "2"), ("RATE_LIMIT_PER_MINUTE", "1")]),
        StubStages::default(),
    )
    .await;

    handle_message(&harness.state, message("a", SENDER, "I sell electronics in Westlands")).await;
    handle_message(&harness.state, message("b", SENDER, "I sell phones in Westlands")).await;
    let before = harness.state.sessions.get(SENDER).await.unwrap();

    handle_message(&harness.state, message("c", SENDER, "I sell laptops in Westlands")).await;

    let texts = harness.channel.texts_for(SENDER);
    assert_eq!(texts.last().unwrap(), format::throttled_message());
    assert_eq!(harness.stages.calls_for(Stage::Classification), 2);

    let after = harness.state.sessions.get(SENDER).await.unwrap();
    assert_eq!(before, after, "rejection must not touch the session");

    // Other senders have their own bucket.
    handle_message(&harness.state, message("d", OTHER, "I run a salon in Mombasa")).await;
    assert_eq!(harness.stages.calls_for(Stage::Classification), 3);
}

#[tokio::test]
async fn help_and_start_commands() {
    let harness = Harness::new(config(&[]), StubStages::default()).await;

    handle_message(&harness.state, message("a", SENDER, "help")).await;
    assert_eq!(harness.channel.texts_for(SENDER), vec![format::help_message()]);
    assert!(harness.state.sessions.get(SENDER).await.is_none());

    handle_message(&harness.state, message("b", SENDER, "I sell electronics in Westlands")).await;
    let completed = harness.state.sessions.get(SENDER).await.unwrap();

    handle_message(&harness.state, message("c", SENDER, "START")).await;
    let fresh = harness.state.sessions.get(SENDER).await.unwrap();
    assert_ne!(fresh.session_id, completed.session_id);
    assert_eq!(fresh.state, SessionState::New);
    assert_eq!(
        harness.channel.texts_for(SENDER).last().unwrap(),
        format::welcome_message()
    );
}

#[tokio::test]
async fn invalid_input_never_reaches_the_pipeline() {
    let harness = Harness::new(config(&[]), StubStages::default()).await;

    handle_message(&harness.state, message("a", SENDER, "hi")).await;
    handle_message(
        &harness.state,
        message("b", SENDER, "shop <script>alert(1)</script>"),
    )
    .await;

    assert_eq!(harness.stages.calls_for(Stage::Classification), 0);
    assert_eq!(
        harness.channel.texts_for(SENDER),
        vec![format::invalid_input_message(), format::invalid_input_message()]
    );
}

#[tokio::test]
async fn same_sender_messages_are_serialized_in_order() {
    let mut harness =
        Harness::new(config(&[]), StubStages::with_delay(Duration::from_millis(20))).await;
    let rx = harness.rx.take().unwrap();
    let _dispatcher = dispatcher::spawn(harness.state.clone(), rx, std::future::pending::<()>());

    for (id, text) in [("a", "I sell electronics in Westlands"), ("b", "I sell phones in Westlands")] {
        harness.state.queue.send(message(id, SENDER, text)).await.unwrap();
    }

    // processing + roadmap per message
    harness.channel.wait_for(4).await;

    assert_eq!(harness.stages.max_overlap(), 1);

    // All four stages of the first run precede any stage of the second.
    let calls = harness.stages.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 8);
    let first_session = &calls[0].1;
    assert!(calls[..4].iter().all(|(_, s)| s == first_session));
    assert!(calls[4..].iter().all(|(_, s)| s != first_session));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_follow_queue_order_for_one_sender() {
    let mut harness =
        Harness::new(config(&[]), StubStages::with_delay(Duration::from_millis(50))).await;
    let rx = harness.rx.take().unwrap();
    let _dispatcher = dispatcher::spawn(harness.state.clone(), rx, std::future::pending::<()>());

    // The command and the invalid message need no pipeline, yet still wait
    // for the run queued ahead of them.
    for (id, text) in [
        ("a", "I sell electronics in Westlands"),
        ("b", "help"),
        ("c", "hi"),
    ] {
        harness.state.queue.send(message(id, SENDER, text)).await.unwrap();
    }

    harness.channel.wait_for(4).await;

    let texts = harness.channel.texts_for(SENDER);
    assert_eq!(texts.len(), 4);
    assert_eq!(texts[0], format::processing_message());
    assert!(texts[1].contains("Total Cost: KSh 8,500"));
    assert_eq!(texts[2], format::help_message());
    assert_eq!(texts[3], format::invalid_input_message());
}

#[tokio::test]
async fn distinct_senders_run_concurrently() {
    let mut harness =
        Harness::new(config(&[]), StubStages::with_delay(Duration::from_millis(100))).await;
    let rx = harness.rx.take().unwrap();
    let _dispatcher = dispatcher::spawn(harness.state.clone(), rx, std::future::pending::<()>());

    harness
        .state
        .queue
        .send(message("a", SENDER, "I sell electronics in Westlands"))
        .await
        .unwrap();
    harness
        .state
        .queue
        .send(message("b", OTHER, "I run a salon in Mombasa"))
        .await
        .unwrap();

    harness.channel.wait_for(4).await;

    assert_eq!(harness.stages.max_overlap(), 2);
    assert_eq!(harness.channel.texts_for(SENDER).len(), 2);
    assert_eq!(harness.channel.texts_for(OTHER).len(), 2);
}

#[tokio::test]
async fn stop_signal_drains_queued_messages() {
    let mut harness = Harness::new(config(&[]), StubStages::default()).await;
    let rx = harness.rx.take().unwrap();

    harness
        .state
        .queue
        .send(message("a", SENDER, "I sell electronics in Westlands"))
        .await
        .unwrap();

    let handle = dispatcher::spawn(harness.state.clone(), rx, std::future::ready(()));
    tokio::time::timeout(common::TEST_TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(harness.channel.texts_for(SENDER).len(), 2);
}
