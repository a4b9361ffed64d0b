use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    Attachment, ConversationSummary, Message, NewClassMessage, NewDirectMessage, Page,
    ReceiptStatus,
};
use crate::repository::MessagingStore;
use crate::services::class_directory::ClassDirectory;
use crate::services::delivery::DeliveryService;
use crate::websocket::{LiveChannel, ServerEvent};

pub const MAX_CONTENT_CHARS: usize = 10_000;

fn validate_body(content: &str, attachments: &[Attachment]) -> AppResult<()> {
    if content.trim().is_empty() && attachments.is_empty() {
        return Err(AppError::BadRequest(
            "message needs content or attachments".into(),
        ));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::BadRequest(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(())
}

/// Inbound messaging operations shared by the HTTP and WebSocket surfaces
pub struct MessagingService {
    store: Arc<dyn MessagingStore>,
    live: LiveChannel,
    delivery: Arc<DeliveryService>,
    classes: Arc<dyn ClassDirectory>,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn MessagingStore>,
        live: LiveChannel,
        delivery: Arc<DeliveryService>,
        classes: Arc<dyn ClassDirectory>,
    ) -> Self {
        Self {
            store,
            live,
            delivery,
            classes,
        }
    }

    /// Persist with the next sequence number, then deliver in the background.
    ///
    /// Returns as soon as the message is stored; delivery problems never fail a send.
    pub async fn send_direct(&self, new: NewDirectMessage) -> AppResult<Message> {
        if new.sender_id == new.receiver_id {
            return Err(AppError::InvalidOperation(
                "cannot send a message to yourself".into(),
            ));
        }
        validate_body(&new.content, &new.attachments)?;

        let (conversation, message) = self.store.create_direct(new).await?;
        metrics::record_message_sent("direct");
        info!(
            message_id = %message.id,
            conversation_id = %conversation.id,
            sequence = conversation.current_sequence,
            "direct message stored"
        );

        self.delivery.dispatch(message.clone());
        Ok(message)
    }

    /// Reply to a message in a direct conversation the sender takes part in
    pub async fn reply(
        &self,
        sender_id: Uuid,
        parent_id: Uuid,
        content: String,
        attachments: Vec<Attachment>,
    ) -> AppResult<Message> {
        let parent = self
            .store
            .get_message(parent_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if parent.is_deleted() {
            return Err(AppError::InvalidOperation(
                "cannot reply to a deleted message".into(),
            ));
        }
        if !parent.is_direct() {
            return Err(AppError::InvalidOperation(
                "replies are only supported in direct conversations".into(),
            ));
        }

        let receiver_id = if parent.sender_id == sender_id {
            parent.receiver_id
        } else if parent.receiver_id == Some(sender_id) {
            Some(parent.sender_id)
        } else {
            None
        }
        .ok_or(AppError::Forbidden)?;

        self.send_direct(NewDirectMessage {
            sender_id,
            receiver_id,
            content,
            attachments,
            parent_id: Some(parent_id),
        })
        .await
    }

    /// Class-wide message: stored without a sequence, pushed live only
    pub async fn send_class(&self, new: NewClassMessage) -> AppResult<Message> {
        validate_body(&new.content, &new.attachments)?;
        if !self
            .classes
            .is_authorized(new.class_id, new.sender_id)
            .await?
        {
            return Err(AppError::Forbidden);
        }

        let message = self.store.create_class(new).await?;
        metrics::record_message_sent("class");

        let members = match message.class_id {
            Some(class_id) => self.classes.member_ids(class_id).await?,
            None => Vec::new(),
        };
        let event = ServerEvent::MessageNew(message.clone());
        let mut reached = 0;
        for member in members.into_iter().filter(|m| *m != message.sender_id) {
            reached += self.live.push(member, &event).await;
        }
        debug!(message_id = %message.id, connections = reached, "class message pushed");
        Ok(message)
    }

    pub async fn acknowledge_delivered(&self, user_id: Uuid, message_id: Uuid) -> AppResult<()> {
        self.delivery.acknowledge(user_id, message_id).await
    }

    /// Receiver read one message
    pub async fn mark_read(&self, user_id: Uuid, message_id: Uuid) -> AppResult<()> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if message.receiver_id != Some(user_id) {
            return Err(AppError::Forbidden);
        }

        // reading implies delivery
        self.live.acks().resolve(message_id, user_id);
        if message.read_at.is_none() {
            self.delivery
                .enqueue_receipt(message_id, user_id, ReceiptStatus::Read, Utc::now())
                .await?;
        }
        Ok(())
    }

    /// Read everything the partner sent so far. Returns the new read pointer.
    pub async fn mark_conversation_read(&self, user_id: Uuid, partner_id: Uuid) -> AppResult<i64> {
        let conversation = self
            .store
            .find_between(user_id, partner_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let now = Utc::now();
        let changed = self
            .store
            .mark_read_up_to(
                conversation.id,
                user_id,
                conversation.current_sequence,
                now,
            )
            .await?;
        let pointer = self
            .store
            .advance_read_pointer(conversation.id, user_id, conversation.current_sequence)
            .await?;

        for message_id in &changed {
            self.live.acks().resolve(*message_id, user_id);
            self.delivery
                .enqueue_receipt(*message_id, user_id, ReceiptStatus::Read, now)
                .await?;
        }
        info!(
            conversation_id = %conversation.id,
            user_id = %user_id,
            marked = changed.len(),
            pointer,
            "conversation marked read"
        );
        Ok(pointer)
    }

    pub async fn delete_message(&self, user_id: Uuid, message_id: Uuid) -> AppResult<Message> {
        self.store.soft_delete(message_id, user_id).await
    }

    pub async fn get_conversations(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<ConversationSummary>> {
        self.store.list_for_user(user_id, page).await
    }

    pub async fn list_messages(
        &self,
        user_id: Uuid,
        partner_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Message>> {
        let conversation = self
            .store
            .find_between(user_id, partner_id)
            .await?
            .ok_or(AppError::NotFound)?;
        self.store
            .list_by_conversation(conversation.id, page)
            .await
    }

    pub async fn typing(&self, from_user_id: Uuid, to_user_id: Uuid, started: bool) {
        let event = if started {
            ServerEvent::TypingStart { from_user_id }
        } else {
            ServerEvent::TypingStop { from_user_id }
        };
        self.live.push(to_user_id, &event).await;
    }

    /// Tell online conversation partners that `user_id` came online or went offline
    pub async fn announce_status(&self, user_id: Uuid, online: bool) -> AppResult<usize> {
        let partners = self.store.partner_ids(user_id).await?;
        let event = ServerEvent::UserStatus {
            user_id,
            online,
            at: Utc::now(),
        };
        let mut reached = 0;
        for partner in partners {
            reached += self.live.push(partner, &event).await;
        }
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::queue::{MemoryJobQueue, DELIVERY_QUEUE, RECEIPT_QUEUE};
    use crate::repository::MemoryStore;
    use crate::services::class_directory::StaticClassDirectory;
    use crate::services::push::LogPushNotifier;
    use std::time::Duration;

    fn service(classes: StaticClassDirectory) -> (MessagingService, LiveChannel) {
        let store: Arc<dyn MessagingStore> = Arc::new(MemoryStore::new());
        let live = LiveChannel::new(Duration::from_millis(50));
        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            live.clone(),
            Arc::new(MemoryJobQueue::new(DELIVERY_QUEUE)),
            Arc::new(MemoryJobQueue::new(RECEIPT_QUEUE)),
            Arc::new(LogPushNotifier),
            &DeliveryConfig::default(),
        ));
        let svc = MessagingService::new(store, live.clone(), delivery, Arc::new(classes));
        (svc, live)
    }

    fn direct(from: Uuid, to: Uuid, content: &str) -> NewDirectMessage {
        NewDirectMessage {
            sender_id: from,
            receiver_id: to,
            content: content.into(),
            attachments: vec![],
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn test_send_validation() {
        let (svc, _) = service(StaticClassDirectory::new());
        let me = Uuid::new_v4();

        let err = svc.send_direct(direct(me, me, "hi")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));

        let err = svc
            .send_direct(direct(me, Uuid::new_v4(), "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        let err = svc
            .send_direct(direct(me, Uuid::new_v4(), &long))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_reply_rules() {
        let (svc, _) = service(StaticClassDirectory::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let parent = svc.send_direct(direct(alice, bob, "question")).await.unwrap();

        let reply = svc
            .reply(bob, parent.id, "answer".into(), vec![])
            .await
            .unwrap();
        assert_eq!(reply.receiver_id, Some(alice));
        assert_eq!(reply.parent_id, Some(parent.id));
        assert_eq!(reply.sequence_number, Some(2));

        let err = svc
            .reply(Uuid::new_v4(), parent.id, "intruder".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        let err = svc
            .reply(bob, Uuid::new_v4(), "?".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        svc.delete_message(alice, parent.id).await.unwrap();
        let err = svc
            .reply(bob, parent.id, "late".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_class_message_requires_enrollment() {
        let class = Uuid::new_v4();
        let instructor = Uuid::new_v4();
        let student = Uuid::new_v4();
        let (svc, live) = service(
            StaticClassDirectory::new().with_class(class, vec![instructor, student]),
        );
        let mut student_conn = live.attach(student).await;

        let msg = svc
            .send_class(NewClassMessage {
                sender_id: instructor,
                class_id: class,
                content: "homework is up".into(),
                attachments: vec![],
            })
            .await
            .unwrap();
        assert_eq!(msg.sequence_number, None);
        assert_eq!(msg.class_id, Some(class));

        let frame = student_conn.receiver.recv().await.unwrap();
        assert!(frame.contains("message:new"));

        let err = svc
            .send_class(NewClassMessage {
                sender_id: Uuid::new_v4(),
                class_id: class,
                content: "spam".into(),
                attachments: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn test_mark_read_checks_receiver() {
        let (svc, _) = service(StaticClassDirectory::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let msg = svc.send_direct(direct(alice, bob, "hi")).await.unwrap();

        assert!(matches!(
            svc.mark_read(alice, msg.id).await.unwrap_err(),
            AppError::Forbidden
        ));
        svc.mark_read(bob, msg.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_conversation_read() {
        let (svc, _) = service(StaticClassDirectory::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert!(matches!(
            svc.mark_conversation_read(bob, alice).await.unwrap_err(),
            AppError::NotFound
        ));

        for text in ["one", "two", "three"] {
            svc.send_direct(direct(alice, bob, text)).await.unwrap();
        }
        assert_eq!(svc.mark_conversation_read(bob, alice).await.unwrap(), 3);

        let convs = svc.get_conversations(bob, Page::default()).await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_status_goes_to_online_partners() {
        let (svc, live) = service(StaticClassDirectory::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        svc.send_direct(direct(alice, bob, "hi")).await.unwrap();
        let mut bob_conn = live.attach(bob).await;

        assert_eq!(svc.announce_status(alice, true).await.unwrap(), 1);
        // the live push of "hi" may land first
        loop {
            let frame = bob_conn.receiver.recv().await.unwrap();
            if frame.contains("user:status") {
                break;
            }
        }
    }
}
