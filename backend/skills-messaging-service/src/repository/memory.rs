use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{ConversationRepository, MessageRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    canonical_pair, message::preview_of, Conversation, ConversationSummary, Message,
    NewClassMessage, NewDirectMessage, Page,
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    pairs: HashMap<(Uuid, Uuid), Uuid>,
    messages: HashMap<Uuid, Message>,
    // conversation_id -> sequence_number -> message_id
    sequences: HashMap<Uuid, BTreeMap<i64, Uuid>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Inner {
    fn get_or_create(&mut self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::InvalidOperation(
                "a conversation needs two distinct users".into(),
            ));
        }
        let pair = canonical_pair(a, b);
        if let Some(existing) = self
            .pairs
            .get(&pair)
            .and_then(|id| self.conversations.get(id))
        {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            participant_a: pair.0,
            participant_b: pair.1,
            current_sequence: 0,
            participant_a_last_read: 0,
            participant_b_last_read: 0,
            last_message_at: None,
            last_message_preview: None,
            last_message_sender_id: None,
            message_count: 0,
            created_at: Utc::now(),
        };
        self.pairs.insert(pair, conversation.id);
        self.conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    // Strictly increasing, so sequence order and timestamp order agree
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn allocate(&mut self, conversation_id: Uuid) -> AppResult<i64> {
        let conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        conversation.current_sequence += 1;
        Ok(conversation.current_sequence)
    }
}

/// In-process store behind one mutex.
///
/// Sequence allocation and message insertion happen under the same guard,
/// which gives the same atomicity the SQL store gets from its CTE.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| AppError::Internal)
    }

    /// Remove a message row outright, bypassing soft delete.
    ///
    /// Nothing in the service does this; it reproduces out-of-band data loss.
    pub fn purge_message(&self, id: Uuid) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(message) = inner.messages.remove(&id) else {
            return false;
        };
        if let (Some(conversation_id), Some(seq)) = (message.conversation_id, message.sequence_number)
        {
            if let Some(seqs) = inner.sequences.get_mut(&conversation_id) {
                seqs.remove(&seq);
            }
        }
        true
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn get_or_create(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        self.lock()?.get_or_create(a, b)
    }

    async fn find_between(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
        let inner = self.lock()?;
        Ok(inner
            .pairs
            .get(&canonical_pair(a, b))
            .and_then(|id| inner.conversations.get(id))
            .cloned())
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.lock()?.conversations.get(&id).cloned())
    }

    async fn allocate_sequence(&self, conversation_id: Uuid) -> AppResult<i64> {
        self.lock()?.allocate(conversation_id)
    }

    async fn advance_read_pointer(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        sequence: i64,
    ) -> AppResult<i64> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let target = sequence.min(conversation.current_sequence);
        let pointer = if conversation.participant_a == user_id {
            &mut conversation.participant_a_last_read
        } else if conversation.participant_b == user_id {
            &mut conversation.participant_b_last_read
        } else {
            return Err(AppError::Forbidden);
        };
        *pointer = (*pointer).max(target);
        Ok(*pointer)
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<ConversationSummary>> {
        let inner = self.lock()?;
        let mut conversations: Vec<&Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.involves(user_id))
            .collect();
        // last_message_at DESC NULLS LAST, created_at DESC
        conversations.sort_by(|x, y| {
            match (x.last_message_at, y.last_message_at) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| y.created_at.cmp(&x.created_at))
        });
        Ok(conversations
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .filter_map(|c| ConversationSummary::for_user(c.clone(), user_id))
            .collect())
    }

    async fn partner_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let inner = self.lock()?;
        Ok(inner
            .conversations
            .values()
            .filter_map(|c| c.partner_of(user_id))
            .collect())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create_direct(&self, new: NewDirectMessage) -> AppResult<(Conversation, Message)> {
        let mut inner = self.lock()?;
        let conversation = inner.get_or_create(new.sender_id, new.receiver_id)?;
        let sequence = inner.allocate(conversation.id)?;
        let timestamp = inner.next_timestamp();

        let message = Message {
            id: Uuid::new_v4(),
            sender_id: new.sender_id,
            receiver_id: Some(new.receiver_id),
            conversation_id: Some(conversation.id),
            class_id: None,
            sequence_number: Some(sequence),
            content: new.content,
            attachments: new.attachments,
            parent_id: new.parent_id,
            server_timestamp: timestamp,
            delivered_at: None,
            read_at: None,
            deleted_at: None,
        };

        let updated = {
            let conv = inner
                .conversations
                .get_mut(&conversation.id)
                .ok_or(AppError::NotFound)?;
            conv.last_message_at = Some(timestamp);
            conv.last_message_preview = Some(preview_of(&message.content, &message.attachments));
            conv.last_message_sender_id = Some(message.sender_id);
            conv.message_count += 1;
            conv.clone()
        };

        inner
            .sequences
            .entry(conversation.id)
            .or_default()
            .insert(sequence, message.id);
        inner.messages.insert(message.id, message.clone());
        Ok((updated, message))
    }

    async fn create_class(&self, new: NewClassMessage) -> AppResult<Message> {
        let mut inner = self.lock()?;
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: new.sender_id,
            receiver_id: None,
            conversation_id: None,
            class_id: Some(new.class_id),
            sequence_number: None,
            content: new.content,
            attachments: new.attachments,
            parent_id: None,
            server_timestamp: inner.next_timestamp(),
            delivered_at: None,
            read_at: None,
            deleted_at: None,
        };
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        Ok(self.lock()?.messages.get(&id).cloned())
    }

    async fn mark_delivered(&self, id: Uuid, when: DateTime<Utc>) -> AppResult<Option<Message>> {
        let mut inner = self.lock()?;
        Ok(inner.messages.get_mut(&id).map(|m| {
            m.delivered_at.get_or_insert(when);
            m.clone()
        }))
    }

    async fn mark_read(&self, id: Uuid, when: DateTime<Utc>) -> AppResult<Option<Message>> {
        let mut inner = self.lock()?;
        Ok(inner.messages.get_mut(&id).map(|m| {
            m.delivered_at.get_or_insert(when);
            m.read_at.get_or_insert(when);
            m.clone()
        }))
    }

    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
        when: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        let mut inner = self.lock()?;
        let ids: Vec<Uuid> = match inner.sequences.get(&conversation_id) {
            Some(seqs) => seqs.range(..=up_to).map(|(_, id)| *id).collect(),
            None => return Ok(Vec::new()),
        };

        let mut changed = Vec::new();
        for id in ids {
            if let Some(m) = inner.messages.get_mut(&id) {
                if m.receiver_id == Some(reader_id) && m.read_at.is_none() {
                    m.read_at = Some(when);
                    m.delivered_at.get_or_insert(when);
                    changed.push(id);
                }
            }
        }
        Ok(changed)
    }

    async fn soft_delete(&self, id: Uuid, requester_id: Uuid) -> AppResult<Message> {
        let mut inner = self.lock()?;
        let message = inner.messages.get_mut(&id).ok_or(AppError::NotFound)?;
        if message.sender_id != requester_id {
            return Err(AppError::Forbidden);
        }
        message.deleted_at.get_or_insert_with(Utc::now);
        Ok(message.clone())
    }

    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Message>> {
        let inner = self.lock()?;
        let Some(seqs) = inner.sequences.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(seqs
            .values()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| !m.is_deleted())
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect())
    }

    async fn list_missing_after(
        &self,
        conversation_id: Uuid,
        since: i64,
    ) -> AppResult<Vec<Message>> {
        let inner = self.lock()?;
        let Some(seqs) = inner.sequences.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(seqs
            .range(since.saturating_add(1)..)
            .filter_map(|(_, id)| inner.messages.get(id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn direct(sender: Uuid, receiver: Uuid, content: &str) -> NewDirectMessage {
        NewDirectMessage {
            sender_id: sender,
            receiver_id: receiver,
            content: content.to_string(),
            attachments: Vec::new(),
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_canonical() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ab = store.get_or_create(a, b).await.unwrap();
        let ba = store.get_or_create(b, a).await.unwrap();
        assert_eq!(ab.id, ba.id);
        assert_eq!(ab.current_sequence, 0);
    }

    #[tokio::test]
    async fn test_self_conversation_rejected() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let err = store.get_or_create(a, a).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_create_direct_updates_conversation_stats() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_, first) = store.create_direct(direct(a, b, "one")).await.unwrap();
        let (conv, second) = store.create_direct(direct(b, a, "two")).await.unwrap();

        assert_eq!(first.sequence_number, Some(1));
        assert_eq!(second.sequence_number, Some(2));
        assert!(first.server_timestamp < second.server_timestamp);
        assert_eq!(conv.current_sequence, 2);
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.last_message_preview.as_deref(), Some("two"));
        assert_eq!(conv.last_message_sender_id, Some(b));
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_unique() {
        let store = Arc::new(MemoryStore::new());
        let conv = store
            .get_or_create(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        let conversation_id = conv.id;

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.allocate_sequence(conversation_id).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_read_pointer_is_monotonic_and_bounded() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for i in 0..3 {
            store
                .create_direct(direct(a, b, &format!("m{i}")))
                .await
                .unwrap();
        }
        let conv = store.find_between(a, b).await.unwrap().unwrap();

        assert_eq!(store.advance_read_pointer(conv.id, b, 2).await.unwrap(), 2);
        assert_eq!(store.advance_read_pointer(conv.id, b, 1).await.unwrap(), 2);
        assert_eq!(store.advance_read_pointer(conv.id, b, 99).await.unwrap(), 3);

        let outsider = store
            .advance_read_pointer(conv.id, Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(outsider, AppError::Forbidden));
    }

    #[tokio::test]
    async fn test_receipts_never_regress() {
        let store = MemoryStore::new();
        let (_, msg) = store
            .create_direct(direct(Uuid::new_v4(), Uuid::new_v4(), "hi"))
            .await
            .unwrap();

        let read = store.mark_read(msg.id, Utc::now()).await.unwrap().unwrap();
        let read_at = read.read_at;
        assert!(read_at.is_some());
        assert!(read.delivered_at.is_some());

        let later = store
            .mark_delivered(msg.id, Utc::now() + Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.read_at, read_at);
        assert_eq!(later.delivered_at, read.delivered_at);
    }

    #[tokio::test]
    async fn test_soft_delete_requires_sender() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (conv, msg) = store.create_direct(direct(a, b, "oops")).await.unwrap();

        let err = store.soft_delete(msg.id, b).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        let deleted = store.soft_delete(msg.id, a).await.unwrap();
        assert!(deleted.is_deleted());

        let listed = store
            .list_by_conversation(conv.id, Page::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
        let missing = store.list_missing_after(conv.id, 0).await.unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_up_to_only_touches_reader_messages() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_, m1) = store.create_direct(direct(a, b, "1")).await.unwrap();
        let (_, _m2) = store.create_direct(direct(b, a, "2")).await.unwrap();
        let (conv, m3) = store.create_direct(direct(a, b, "3")).await.unwrap();

        let changed = store
            .mark_read_up_to(conv.id, b, 3, Utc::now())
            .await
            .unwrap();
        assert_eq!(changed, vec![m1.id, m3.id]);

        let again = store
            .mark_read_up_to(conv.id, b, 3, Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}
