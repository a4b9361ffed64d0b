// Conversation ordering: one conversation per pair, gap-free sequence numbers
// under concurrent senders, monotonic read pointers.

mod common;

use common::harness;
use futures::future::join_all;
use skills_messaging_service::error::AppError;
use skills_messaging_service::models::{canonical_pair, NewDirectMessage, Page};
use skills_messaging_service::repository::ConversationRepository;
use uuid::Uuid;

fn direct(sender_id: Uuid, receiver_id: Uuid, content: &str) -> NewDirectMessage {
    NewDirectMessage {
        sender_id,
        receiver_id,
        content: content.to_string(),
        attachments: vec![],
        parent_id: None,
    }
}

#[tokio::test]
async fn test_both_directions_share_one_conversation() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let first = h
        .state
        .messaging
        .send_direct(direct(alice, bob, "hi bob"))
        .await
        .unwrap();
    let second = h
        .state
        .messaging
        .send_direct(direct(bob, alice, "hi alice"))
        .await
        .unwrap();

    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(first.sequence_number, Some(1));
    assert_eq!(second.sequence_number, Some(2));

    let conversation = h.store.find_between(bob, alice).await.unwrap().unwrap();
    let (a, b) = canonical_pair(alice, bob);
    assert_eq!((conversation.participant_a, conversation.participant_b), (a, b));
    assert_eq!(conversation.current_sequence, 2);
}

#[tokio::test]
async fn test_concurrent_sends_get_contiguous_sequences() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let sends = (0..40).map(|i| {
        let messaging = h.state.messaging.clone();
        let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
        tokio::spawn(async move {
            messaging
                .send_direct(direct(from, to, &format!("message {i}")))
                .await
        })
    });

    let mut sequences: Vec<i64> = join_all(sends)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().sequence_number.unwrap())
        .collect();
    sequences.sort_unstable();

    assert_eq!(sequences, (1..=40).collect::<Vec<i64>>());

    let conversation = h.store.find_between(alice, bob).await.unwrap().unwrap();
    assert_eq!(conversation.current_sequence, 40);
    assert_eq!(conversation.message_count, 40);

    let listed = h
        .state
        .messaging
        .list_messages(alice, bob, Page::new(1, 100))
        .await
        .unwrap();
    let listed_sequences: Vec<i64> = listed.iter().filter_map(|m| m.sequence_number).collect();
    assert_eq!(listed_sequences, (1..=40).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_self_message_is_rejected() {
    let h = harness();
    let alice = Uuid::new_v4();

    let err = h
        .state
        .messaging
        .send_direct(direct(alice, alice, "note to self"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidOperation(_)));
    assert!(h.store.find_between(alice, alice).await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_pointer_only_moves_forward() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    for i in 0..3 {
        h.state
            .messaging
            .send_direct(direct(alice, bob, &format!("m{i}")))
            .await
            .unwrap();
    }

    let pointer = h
        .state
        .messaging
        .mark_conversation_read(bob, alice)
        .await
        .unwrap();
    assert_eq!(pointer, 3);

    let conversation = h.store.find_between(alice, bob).await.unwrap().unwrap();
    assert_eq!(conversation.last_read_of(bob), Some(3));
    assert_eq!(conversation.unread_for(bob), 0);

    let after_stale_update = h
        .store
        .advance_read_pointer(conversation.id, bob, 1)
        .await
        .unwrap();
    assert_eq!(after_stale_update, 3);

    // the sender's own pointer is untouched
    let conversation = h.store.find_between(alice, bob).await.unwrap().unwrap();
    assert_eq!(conversation.last_read_of(alice), Some(0));
}

#[tokio::test]
async fn test_unread_counts_follow_read_pointer() {
    let h = harness();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    for i in 0..4 {
        h.state
            .messaging
            .send_direct(direct(alice, bob, &format!("m{i}")))
            .await
            .unwrap();
    }

    let summaries = h
        .state
        .messaging
        .get_conversations(bob, Page::default())
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].partner_id, alice);
    assert_eq!(summaries[0].unread_count, 4);

    h.state
        .messaging
        .mark_conversation_read(bob, alice)
        .await
        .unwrap();

    let summaries = h
        .state
        .messaging
        .get_conversations(bob, Page::default())
        .await
        .unwrap();
    assert_eq!(summaries[0].unread_count, 0);
}
