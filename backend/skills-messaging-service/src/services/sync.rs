use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::Message;
use crate::repository::MessagingStore;
use crate::services::delivery::DeliveryService;

/// Answer to a reconnecting client asking what it missed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub conversation_id: Option<Uuid>,
    /// Messages after the client's last known sequence, soft-deleted ones left out
    pub messages: Vec<Message>,
    pub current_sequence: i64,
    pub has_gap: bool,
    pub missing_sequences: Vec<i64>,
}

impl SyncResponse {
    fn empty(conversation_id: Option<Uuid>, current_sequence: i64) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            current_sequence,
            has_gap: false,
            missing_sequences: Vec::new(),
        }
    }
}

/// Sequence numbers in `(last_known, current]` with no stored row
pub fn missing_sequences(last_known: i64, current: i64, present: &BTreeSet<i64>) -> Vec<i64> {
    ((last_known + 1)..=current)
        .filter(|seq| !present.contains(seq))
        .collect()
}

pub struct SyncCoordinator {
    store: Arc<dyn MessagingStore>,
    delivery: Arc<DeliveryService>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn MessagingStore>, delivery: Arc<DeliveryService>) -> Self {
        Self { store, delivery }
    }

    pub async fn sync_missed_messages(
        &self,
        user_id: Uuid,
        partner_id: Uuid,
        last_known_sequence: i64,
    ) -> AppResult<SyncResponse> {
        if user_id == partner_id {
            return Err(AppError::InvalidOperation(
                "cannot sync a conversation with yourself".into(),
            ));
        }

        let Some(conversation) = self.store.find_between(user_id, partner_id).await? else {
            return Ok(SyncResponse::empty(None, 0));
        };

        let last_known = last_known_sequence.max(0);
        let current = conversation.current_sequence;
        if last_known >= current {
            return Ok(SyncResponse::empty(Some(conversation.id), current));
        }

        let rows = self
            .store
            .list_missing_after(conversation.id, last_known)
            .await?;

        // soft-deleted rows still occupy their sequence number
        let present: BTreeSet<i64> = rows.iter().filter_map(|m| m.sequence_number).collect();
        let missing = missing_sequences(last_known, current, &present);
        let has_gap = !missing.is_empty();

        if has_gap {
            metrics::record_sync_gap();
            warn!(
                conversation_id = %conversation.id,
                user_id = %user_id,
                last_known,
                current,
                missing = missing.len(),
                "sequence gap detected during sync"
            );
        }

        let messages: Vec<Message> = rows.into_iter().filter(|m| !m.is_deleted()).collect();
        debug!(
            conversation_id = %conversation.id,
            user_id = %user_id,
            returned = messages.len(),
            "sync served"
        );

        Ok(SyncResponse {
            conversation_id: Some(conversation.id),
            messages,
            current_sequence: current,
            has_gap,
            missing_sequences: missing,
        })
    }

    /// `connection:ready`: pull the user's queued deliveries forward
    pub async fn on_connection_ready(&self, user_id: Uuid) -> AppResult<u64> {
        self.delivery.flush_for_user(user_id).await
    }
}
