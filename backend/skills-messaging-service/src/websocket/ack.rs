use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSignal {
    Acked,
    /// The receiver's last connection closed while we were waiting
    ReceiverGone,
}

struct PendingAck {
    token: u64,
    receiver_id: Uuid,
    tx: oneshot::Sender<AckSignal>,
}

/// Outstanding `message:ack:delivered` waits, keyed by message id
#[derive(Default, Clone)]
pub struct AckRegistry {
    pending: Arc<DashMap<Uuid, PendingAck>>,
    next_token: Arc<AtomicU64>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `receiver_id` to ack `message_id`.
    ///
    /// A newer wait for the same message replaces the older one, whose
    /// receiver then sees a closed channel.
    pub fn register(
        &self,
        message_id: Uuid,
        receiver_id: Uuid,
    ) -> (u64, oneshot::Receiver<AckSignal>) {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            message_id,
            PendingAck {
                token,
                receiver_id,
                tx,
            },
        );
        (token, rx)
    }

    /// Complete the wait if `user_id` is the receiver it belongs to
    pub fn resolve(&self, message_id: Uuid, user_id: Uuid) -> bool {
        match self
            .pending
            .remove_if(&message_id, |_, p| p.receiver_id == user_id)
        {
            Some((_, pending)) => pending.tx.send(AckSignal::Acked).is_ok(),
            None => false,
        }
    }

    /// Drop a wait that timed out, unless it was replaced in the meantime
    pub fn discard(&self, message_id: Uuid, token: u64) {
        self.pending.remove_if(&message_id, |_, p| p.token == token);
    }

    /// Wake every wait addressed to `receiver_id`. Returns how many were cancelled.
    pub fn cancel_for_receiver(&self, receiver_id: Uuid) -> usize {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.receiver_id == receiver_id)
            .map(|entry| *entry.key())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&id, |_, p| p.receiver_id == receiver_id)
            {
                let _ = pending.tx.send(AckSignal::ReceiverGone);
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
