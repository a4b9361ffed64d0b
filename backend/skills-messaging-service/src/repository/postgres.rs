use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::{types::Json, Row};
use uuid::Uuid;

use super::{ConversationRepository, MessageRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    canonical_pair, message::preview_of, Attachment, Conversation, ConversationSummary,
    Message, NewClassMessage, NewDirectMessage, Page,
};

const UPSERT_CONVERSATION: &str = r#"
    INSERT INTO conversations (id, participant_a, participant_b)
    VALUES ($1, $2, $3)
    ON CONFLICT (participant_a, participant_b)
    DO UPDATE SET participant_a = EXCLUDED.participant_a
    RETURNING id, participant_a, participant_b, current_sequence,
              participant_a_last_read, participant_b_last_read,
              last_message_at, last_message_preview, last_message_sender_id,
              message_count, created_at
"#;

const SELECT_CONVERSATION: &str = r#"
    SELECT id, participant_a, participant_b, current_sequence,
           participant_a_last_read, participant_b_last_read,
           last_message_at, last_message_preview, last_message_sender_id,
           message_count, created_at
    FROM conversations
"#;

const SELECT_MESSAGE: &str = r#"
    SELECT id, sender_id, receiver_id, conversation_id, class_id, sequence_number,
           content, attachments, parent_id, server_timestamp,
           delivered_at, read_at, deleted_at
    FROM messages
"#;

const MESSAGE_RETURNING: &str = r#"
    RETURNING id, sender_id, receiver_id, conversation_id, class_id, sequence_number,
              content, attachments, parent_id, server_timestamp,
              delivered_at, read_at, deleted_at
"#;

fn conversation_from_row(row: &Row) -> AppResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        participant_a: row.try_get("participant_a")?,
        participant_b: row.try_get("participant_b")?,
        current_sequence: row.try_get("current_sequence")?,
        participant_a_last_read: row.try_get("participant_a_last_read")?,
        participant_b_last_read: row.try_get("participant_b_last_read")?,
        last_message_at: row.try_get("last_message_at")?,
        last_message_preview: row.try_get("last_message_preview")?,
        last_message_sender_id: row.try_get("last_message_sender_id")?,
        message_count: row.try_get("message_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &Row) -> AppResult<Message> {
    let Json(attachments): Json<Vec<Attachment>> = row.try_get("attachments")?;
    Ok(Message {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        conversation_id: row.try_get("conversation_id")?,
        class_id: row.try_get("class_id")?,
        sequence_number: row.try_get("sequence_number")?,
        content: row.try_get("content")?,
        attachments,
        parent_id: row.try_get("parent_id")?,
        server_timestamp: row.try_get("server_timestamp")?,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

/// PostgreSQL store over a deadpool pool.
///
/// Sequence allocation, message insert and conversation stats share one
/// statement (a data-modifying CTE) inside one transaction. The row lock
/// taken on `conversations` serializes concurrent senders per pair.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn message_exists(&self, id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT 1 FROM messages WHERE id = $1", &[&id])
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ConversationRepository for PgStore {
    async fn get_or_create(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::InvalidOperation(
                "a conversation needs two distinct users".into(),
            ));
        }
        let (low, high) = canonical_pair(a, b);
        let client = self.pool.get().await?;
        let row = client
            .query_one(UPSERT_CONVERSATION, &[&Uuid::new_v4(), &low, &high])
            .await?;
        conversation_from_row(&row)
    }

    async fn find_between(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
        let (low, high) = canonical_pair(a, b);
        let client = self.pool.get().await?;
        let sql = format!("{SELECT_CONVERSATION} WHERE participant_a = $1 AND participant_b = $2");
        client
            .query_opt(sql.as_str(), &[&low, &high])
            .await?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let sql = format!("{SELECT_CONVERSATION} WHERE id = $1");
        client
            .query_opt(sql.as_str(), &[&id])
            .await?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn allocate_sequence(&self, conversation_id: Uuid) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE conversations SET current_sequence = current_sequence + 1 \
                 WHERE id = $1 RETURNING current_sequence",
                &[&conversation_id],
            )
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(row.try_get(0)?)
    }

    async fn advance_read_pointer(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        sequence: i64,
    ) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                UPDATE conversations
                   SET participant_a_last_read = CASE WHEN participant_a = $2
                           THEN GREATEST(participant_a_last_read, LEAST($3, current_sequence))
                           ELSE participant_a_last_read END,
                       participant_b_last_read = CASE WHEN participant_b = $2
                           THEN GREATEST(participant_b_last_read, LEAST($3, current_sequence))
                           ELSE participant_b_last_read END
                 WHERE id = $1 AND (participant_a = $2 OR participant_b = $2)
             RETURNING CASE WHEN participant_a = $2
                           THEN participant_a_last_read
                           ELSE participant_b_last_read END
                "#,
                &[&conversation_id, &user_id, &sequence],
            )
            .await?;

        match row {
            Some(row) => Ok(row.try_get(0)?),
            None => match self.get_conversation(conversation_id).await? {
                Some(_) => Err(AppError::Forbidden),
                None => Err(AppError::NotFound),
            },
        }
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<ConversationSummary>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "{SELECT_CONVERSATION} WHERE participant_a = $1 OR participant_b = $1 \
             ORDER BY last_message_at DESC NULLS LAST, created_at DESC \
             LIMIT $2 OFFSET $3"
        );
        let rows = client
            .query(sql.as_str(), &[&user_id, &page.limit(), &page.offset()])
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(summary) = ConversationSummary::for_user(conversation_from_row(&row)?, user_id)
            {
                out.push(summary);
            }
        }
        Ok(out)
    }

    async fn partner_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT CASE WHEN participant_a = $1 THEN participant_b ELSE participant_a END \
                 FROM conversations WHERE participant_a = $1 OR participant_b = $1",
                &[&user_id],
            )
            .await?;
        rows.iter()
            .map(|r| r.try_get(0).map_err(AppError::from))
            .collect()
    }
}

#[async_trait]
impl MessageRepository for PgStore {
    async fn create_direct(&self, new: NewDirectMessage) -> AppResult<(Conversation, Message)> {
        if new.sender_id == new.receiver_id {
            return Err(AppError::InvalidOperation(
                "a conversation needs two distinct users".into(),
            ));
        }
        let (low, high) = canonical_pair(new.sender_id, new.receiver_id);
        let preview = preview_of(&new.content, &new.attachments);
        let id = Uuid::new_v4();

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let conversation_id: Uuid = tx
            .query_one(UPSERT_CONVERSATION, &[&Uuid::new_v4(), &low, &high])
            .await?
            .try_get("id")?;

        let sql = format!(
            r#"
            WITH next AS (
                UPDATE conversations
                   SET current_sequence = current_sequence + 1,
                       message_count = message_count + 1,
                       last_message_at = clock_timestamp(),
                       last_message_preview = $6,
                       last_message_sender_id = $2
                 WHERE id = $4
             RETURNING current_sequence, last_message_at
            )
            INSERT INTO messages (
                id, sender_id, receiver_id, conversation_id, sequence_number,
                content, attachments, parent_id, server_timestamp
            )
            SELECT $1, $2, $3, $4, next.current_sequence, $5, $7, $8, next.last_message_at
            FROM next
            {MESSAGE_RETURNING}
            "#
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &id,
                    &new.sender_id,
                    &new.receiver_id,
                    &conversation_id,
                    &new.content,
                    &preview,
                    &Json(&new.attachments),
                    &new.parent_id,
                ],
            )
            .await?;
        let message = message_from_row(&row)?;

        let select = format!("{SELECT_CONVERSATION} WHERE id = $1");
        let conversation = conversation_from_row(&tx.query_one(select.as_str(), &[&conversation_id]).await?)?;

        tx.commit().await?;
        Ok((conversation, message))
    }

    async fn create_class(&self, new: NewClassMessage) -> AppResult<Message> {
        let client = self.pool.get().await?;
        let sql = format!(
            "INSERT INTO messages (id, sender_id, class_id, content, attachments) \
             VALUES ($1, $2, $3, $4, $5) {MESSAGE_RETURNING}"
        );
        let row = client
            .query_one(
                sql.as_str(),
                &[
                    &Uuid::new_v4(),
                    &new.sender_id,
                    &new.class_id,
                    &new.content,
                    &Json(&new.attachments),
                ],
            )
            .await?;
        message_from_row(&row)
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!("{SELECT_MESSAGE} WHERE id = $1");
        client
            .query_opt(sql.as_str(), &[&id])
            .await?
            .as_ref()
            .map(message_from_row)
            .transpose()
    }

    async fn mark_delivered(&self, id: Uuid, when: DateTime<Utc>) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE messages SET delivered_at = COALESCE(delivered_at, $2) \
             WHERE id = $1 {MESSAGE_RETURNING}"
        );
        client
            .query_opt(sql.as_str(), &[&id, &when])
            .await?
            .as_ref()
            .map(message_from_row)
            .transpose()
    }

    async fn mark_read(&self, id: Uuid, when: DateTime<Utc>) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE messages SET read_at = COALESCE(read_at, $2), \
                                 delivered_at = COALESCE(delivered_at, $2) \
             WHERE id = $1 {MESSAGE_RETURNING}"
        );
        client
            .query_opt(sql.as_str(), &[&id, &when])
            .await?
            .as_ref()
            .map(message_from_row)
            .transpose()
    }

    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
        when: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                UPDATE messages
                   SET read_at = $4,
                       delivered_at = COALESCE(delivered_at, $4)
                 WHERE conversation_id = $1
                   AND receiver_id = $2
                   AND sequence_number <= $3
                   AND read_at IS NULL
             RETURNING id
                "#,
                &[&conversation_id, &reader_id, &up_to, &when],
            )
            .await?;
        rows.iter()
            .map(|r| r.try_get(0).map_err(AppError::from))
            .collect()
    }

    async fn soft_delete(&self, id: Uuid, requester_id: Uuid) -> AppResult<Message> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE messages SET deleted_at = COALESCE(deleted_at, NOW()) \
             WHERE id = $1 AND sender_id = $2 {MESSAGE_RETURNING}"
        );
        let row = client.query_opt(sql.as_str(), &[&id, &requester_id]).await?;
        drop(client);

        match row {
            Some(row) => message_from_row(&row),
            None if self.message_exists(id).await? => Err(AppError::Forbidden),
            None => Err(AppError::NotFound),
        }
    }

    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "{SELECT_MESSAGE} WHERE conversation_id = $1 AND deleted_at IS NULL \
             ORDER BY sequence_number ASC LIMIT $2 OFFSET $3"
        );
        let rows = client
            .query(
                sql.as_str(),
                &[&conversation_id, &page.limit(), &page.offset()],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_missing_after(
        &self,
        conversation_id: Uuid,
        since: i64,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "{SELECT_MESSAGE} WHERE conversation_id = $1 AND sequence_number > $2 \
             ORDER BY sequence_number ASC"
        );
        let rows = client.query(sql.as_str(), &[&conversation_id, &since]).await?;
        rows.iter().map(message_from_row).collect()
    }
}
