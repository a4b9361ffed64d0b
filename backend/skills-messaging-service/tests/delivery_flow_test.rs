// End-to-end delivery: live push with ack, offline queue with retries and
// dead-lettering, receipts back to the sender, reconnect sync.

mod common;

use common::{
    acking_client, config, eventually, harness, harness_with_classes, harness_with_config, Client,
    ACK_TIMEOUT,
};
use skills_messaging_service::models::{
    Message, NewClassMessage, NewDirectMessage, Page, ReceiptStatus,
};
use skills_messaging_service::queue::QueueJob;
use skills_messaging_service::repository::MessageRepository;
use skills_messaging_service::services::StaticClassDirectory;
use skills_messaging_service::state::AppState;
use skills_messaging_service::websocket::handlers::handle_client_event;
use skills_messaging_service::websocket::{ClientEvent, ServerEvent};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn send(state: &AppState, from: Uuid, to: Uuid, content: &str) -> Message {
    state
        .messaging
        .send_direct(NewDirectMessage {
            sender_id: from,
            receiver_id: to,
            content: content.to_string(),
            attachments: vec![],
            parent_id: None,
        })
        .await
        .unwrap()
}

async fn queued_deliveries(state: &AppState) -> u64 {
    state.delivery.queue_stats().await.unwrap().delivery.queued
}

async fn queued_receipts(state: &AppState) -> u64 {
    state.delivery.queue_stats().await.unwrap().receipts.queued
}

fn receipts(client: &mut Client) -> Vec<ReceiptStatus> {
    let mut out = Vec::new();
    while let Ok(frame) = client.frames.try_recv() {
        if let ServerEvent::MessageReceipt(notice) = common::decode(&frame) {
            out.push(notice.status);
        }
    }
    out
}

#[tokio::test]
async fn test_online_receiver_gets_message_live() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut alice_client = Client::connect(&h.state, alice).await;
    let (_, mut bob_events) = acking_client(&h.state, bob).await;

    let sent = send(&h.state, alice, bob, "are you there?").await;

    let event = tokio::time::timeout(Duration::from_secs(2), bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    let ServerEvent::MessageNew(received) = event else {
        panic!("expected message:new, got {event:?}");
    };
    assert_eq!(received.id, sent.id);
    assert_eq!(received.sequence_number, Some(1));

    // the ack path queues the delivered receipt
    let state = h.state.clone();
    assert!(eventually(|| { let s = state.clone(); async move { queued_receipts(&s).await == 1 } }).await);

    tokio::time::sleep(ACK_TIMEOUT * 2).await;
    assert_eq!(queued_deliveries(&h.state).await, 0);

    h.workers.drain_due().await.unwrap();

    let notice = alice_client
        .next_matching(|e| matches!(e, ServerEvent::MessageReceipt(_)))
        .await;
    let ServerEvent::MessageReceipt(notice) = notice else {
        unreachable!()
    };
    assert_eq!(notice.message_id, sent.id);
    assert_eq!(notice.status, ReceiptStatus::Delivered);
    assert_eq!(notice.reader_id, bob);

    let stored = h.store.get_message(sent.id).await.unwrap().unwrap();
    assert!(stored.delivered_at.is_some());
    assert!(stored.read_at.is_none());
}

#[tokio::test]
async fn test_offline_receiver_is_queued_then_delivered_on_reconnect() {
    let mut cfg = config();
    cfg.delivery.initial_delay = Duration::from_secs(60);
    let h = harness_with_config(cfg);
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let sent = send(&h.state, alice, bob, "see you tomorrow").await;

    let state = h.state.clone();
    assert!(eventually(|| { let s = state.clone(); async move { queued_deliveries(&s).await == 1 } }).await);

    // parked for the initial delay
    assert_eq!(h.workers.drain_due().await.unwrap(), 0);

    let (_, mut bob_events) = acking_client(&h.state, bob).await;
    let flushed = h.state.sync.on_connection_ready(bob).await.unwrap();
    assert_eq!(flushed, 1);

    h.workers.drain_due().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ServerEvent::MessageNew(ref m) if m.id == sent.id));

    let stats = h.state.delivery.queue_stats().await.unwrap();
    assert_eq!(stats.delivery.queued, 0);
    assert_eq!(stats.delivery.active, 0);
    assert_eq!(stats.delivery.dead, 0);

    let store = h.store.clone();
    let workers = &h.workers;
    assert!(
        eventually(|| {
            let store = store.clone();
            async move {
                let _ = workers.drain_due().await;
                store
                    .get_message(sent.id)
                    .await
                    .unwrap()
                    .is_some_and(|m| m.delivered_at.is_some())
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_unacked_push_falls_back_to_queue() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut bob_client = Client::connect(&h.state, bob).await;

    let sent = send(&h.state, alice, bob, "ack me if you can").await;

    let event = bob_client.next_event().await;
    assert!(matches!(event, ServerEvent::MessageNew(ref m) if m.id == sent.id));

    let state = h.state.clone();
    assert!(eventually(|| { let s = state.clone(); async move { queued_deliveries(&s).await == 1 } }).await);

    let stored = h.store.get_message(sent.id).await.unwrap().unwrap();
    assert!(stored.delivered_at.is_none());

    assert!(h.state.live.is_online(bob).await);
    assert!(bob_client.disconnect(&h.state).await);
    assert!(!h.state.live.is_online(bob).await);
}

#[tokio::test]
async fn test_retries_exhausted_moves_job_to_dead_letters() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let sent = send(&h.state, alice, bob, "nobody home").await;
    let state = h.state.clone();
    assert!(eventually(|| { let s = state.clone(); async move { queued_deliveries(&s).await == 1 } }).await);

    for _ in 0..5 {
        assert_eq!(h.workers.drain_due().await.unwrap(), 1);
    }
    assert_eq!(h.workers.drain_due().await.unwrap(), 0);

    let stats = h.state.delivery.queue_stats().await.unwrap();
    assert_eq!(stats.delivery.queued, 0);
    assert_eq!(stats.delivery.dead, 1);

    let dead = h.state.delivery.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    let QueueJob::DeadLetter(letter) = &dead[0].job else {
        panic!("expected a dead letter, got {:?}", dead[0].job);
    };
    assert_eq!(letter.attempts, 5);
    assert!(matches!(letter.failed.as_ref(), QueueJob::Delivery(job) if job.message_id == sent.id));

    // the message itself stays stored and retrievable
    let stored = h.store.get_message(sent.id).await.unwrap().unwrap();
    assert!(stored.delivered_at.is_none());

    let history = h
        .state
        .messaging
        .list_messages(bob, alice, Page::new(1, 50))
        .await
        .unwrap();
    assert!(history.iter().any(|m| m.id == sent.id));

    // reading history leaves the dead letter in place
    assert_eq!(h.state.delivery.dead_letters(10).await.unwrap(), dead);
}

#[tokio::test]
async fn test_receipts_are_idempotent_and_never_regress() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut alice_client = Client::connect(&h.state, alice).await;

    let sent = send(&h.state, alice, bob, "read me").await;

    h.state.messaging.acknowledge_delivered(bob, sent.id).await.unwrap();
    h.state.messaging.acknowledge_delivered(bob, sent.id).await.unwrap();
    assert_eq!(queued_receipts(&h.state).await, 1);

    h.workers.drain_due().await.unwrap();
    assert_eq!(receipts(&mut alice_client), vec![ReceiptStatus::Delivered]);

    h.state.messaging.mark_read(bob, sent.id).await.unwrap();
    assert_eq!(queued_receipts(&h.state).await, 1);

    h.workers.drain_due().await.unwrap();
    assert_eq!(receipts(&mut alice_client), vec![ReceiptStatus::Read]);

    let stored = h.store.get_message(sent.id).await.unwrap().unwrap();
    assert!(stored.delivered_at.is_some());
    assert!(stored.read_at.is_some());

    // already delivered: no new receipt
    h.state.messaging.acknowledge_delivered(bob, sent.id).await.unwrap();
    assert_eq!(queued_receipts(&h.state).await, 0);

    // a late delivered receipt still reports read
    h.state
        .delivery
        .enqueue_receipt(sent.id, bob, ReceiptStatus::Delivered, chrono::Utc::now())
        .await
        .unwrap();
    h.workers.drain_due().await.unwrap();
    assert_eq!(receipts(&mut alice_client), vec![ReceiptStatus::Read]);
}

#[tokio::test]
async fn test_only_receiver_may_acknowledge() {
    let h = harness();
    let (alice, bob, mallory) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let sent = send(&h.state, alice, bob, "private").await;

    let err = h
        .state
        .messaging
        .acknowledge_delivered(mallory, sent.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");

    let err = h
        .state
        .messaging
        .mark_read(bob, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_sync_returns_messages_after_last_known() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    for i in 1..=3 {
        send(&h.state, alice, bob, &format!("m{i}")).await;
    }

    let response = h.state.sync.sync_missed_messages(bob, alice, 1).await.unwrap();
    let sequences: Vec<i64> = response.messages.iter().filter_map(|m| m.sequence_number).collect();
    assert_eq!(sequences, vec![2, 3]);
    assert_eq!(response.current_sequence, 3);
    assert!(!response.has_gap);

    let caught_up = h.state.sync.sync_missed_messages(bob, alice, 3).await.unwrap();
    assert!(caught_up.messages.is_empty());
    assert_eq!(caught_up.current_sequence, 3);

    let from_scratch = h.state.sync.sync_missed_messages(bob, alice, -5).await.unwrap();
    assert_eq!(from_scratch.messages.len(), 3);

    let stranger = h
        .state
        .sync
        .sync_missed_messages(bob, Uuid::new_v4(), 0)
        .await
        .unwrap();
    assert!(stranger.conversation_id.is_none());
    assert_eq!(stranger.current_sequence, 0);
    assert!(stranger.messages.is_empty());
}

#[tokio::test]
async fn test_sync_flags_missing_rows_as_gap() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut sent = Vec::new();
    for i in 1..=3 {
        sent.push(send(&h.state, alice, bob, &format!("m{i}")).await);
    }

    assert!(h.store.purge_message(sent[1].id));

    let response = h.state.sync.sync_missed_messages(bob, alice, 0).await.unwrap();
    assert!(response.has_gap);
    assert_eq!(response.missing_sequences, vec![2]);
    let sequences: Vec<i64> = response.messages.iter().filter_map(|m| m.sequence_number).collect();
    assert_eq!(sequences, vec![1, 3]);
}

#[tokio::test]
async fn test_sync_skips_deleted_messages_without_gap() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut sent = Vec::new();
    for i in 1..=3 {
        sent.push(send(&h.state, alice, bob, &format!("m{i}")).await);
    }

    h.state.messaging.delete_message(alice, sent[1].id).await.unwrap();

    let response = h.state.sync.sync_missed_messages(bob, alice, 0).await.unwrap();
    assert!(!response.has_gap);
    let sequences: Vec<i64> = response.messages.iter().filter_map(|m| m.sequence_number).collect();
    assert_eq!(sequences, vec![1, 3]);
}

#[tokio::test]
async fn test_client_events_over_the_socket_surface() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let reply = handle_client_event(
        &h.state,
        alice,
        ClientEvent::MessageSend {
            receiver_id: bob,
            content: "from the socket".into(),
            attachments: vec![],
            parent_id: None,
            client_ref: Some("tmp-1".into()),
        },
    )
    .await;
    let Some(ServerEvent::MessageSent { client_ref, message }) = reply else {
        panic!("expected message:sent, got {reply:?}");
    };
    assert_eq!(client_ref.as_deref(), Some("tmp-1"));
    assert_eq!(message.sequence_number, Some(1));

    let reply = handle_client_event(
        &h.state,
        bob,
        ClientEvent::SyncRequest {
            partner_id: alice,
            last_known_sequence: 0,
        },
    )
    .await;
    assert!(matches!(reply, Some(ServerEvent::SyncResponse(ref r)) if r.current_sequence == 1));

    let reply = handle_client_event(
        &h.state,
        alice,
        ClientEvent::MessageSend {
            receiver_id: alice,
            content: "me".into(),
            attachments: vec![],
            parent_id: None,
            client_ref: None,
        },
    )
    .await;
    assert!(matches!(reply, Some(ServerEvent::Error { ref code, .. }) if code == "invalid_operation"));

    assert!(handle_client_event(&h.state, bob, ClientEvent::ConnectionReady).await.is_none());
}

#[tokio::test]
async fn test_class_message_reaches_online_members_only_live() {
    let class_id = Uuid::new_v4();
    let (instructor, student, absent) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let classes = StaticClassDirectory::new().with_class(class_id, vec![instructor, student, absent]);
    let h = harness_with_classes(Arc::new(classes));
    let mut student_client = Client::connect(&h.state, student).await;

    let message = h
        .state
        .messaging
        .send_class(NewClassMessage {
            sender_id: instructor,
            class_id,
            content: "homework is up".into(),
            attachments: vec![],
        })
        .await
        .unwrap();
    assert!(message.sequence_number.is_none());
    assert!(message.conversation_id.is_none());

    let event = student_client.next_event().await;
    assert!(matches!(event, ServerEvent::MessageNew(ref m) if m.id == message.id));

    tokio::time::sleep(ACK_TIMEOUT).await;
    assert_eq!(queued_deliveries(&h.state).await, 0);

    let err = h
        .state
        .messaging
        .send_class(NewClassMessage {
            sender_id: Uuid::new_v4(),
            class_id,
            content: "let me in".into(),
            attachments: vec![],
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
}
