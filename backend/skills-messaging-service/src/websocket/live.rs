use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AckRegistry, AckSignal, ConnectionId, PresenceTracker, ServerEvent};
use crate::models::Message;

/// Result of pushing a message live and waiting for the client's ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    TimedOut,
    /// Last connection closed during the wait
    ReceiverGone,
    /// No open connection to push to
    NotConnected,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::Acked => "acked",
            AckOutcome::TimedOut => "timed_out",
            AckOutcome::ReceiverGone => "receiver_gone",
            AckOutcome::NotConnected => "not_connected",
        }
    }
}

pub struct LiveAttachment {
    pub connection_id: ConnectionId,
    pub receiver: UnboundedReceiver<String>,
    /// The user had no other open connection
    pub first_connection: bool,
}

/// Pushes server events to connected users
#[derive(Clone)]
pub struct LiveChannel {
    presence: PresenceTracker,
    acks: AckRegistry,
    ack_timeout: Duration,
}

impl LiveChannel {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            presence: PresenceTracker::new(),
            acks: AckRegistry::new(),
            ack_timeout,
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn acks(&self) -> &AckRegistry {
        &self.acks
    }

    pub async fn attach(&self, user_id: Uuid) -> LiveAttachment {
        let (connection_id, receiver, first_connection) = self.presence.register(user_id).await;
        LiveAttachment {
            connection_id,
            receiver,
            first_connection,
        }
    }

    /// Returns true when the user went offline. Pending ack waits for them end early.
    pub async fn detach(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let last = self.presence.mark_offline(user_id, connection_id).await;
        if last {
            let cancelled = self.acks.cancel_for_receiver(user_id);
            if cancelled > 0 {
                debug!(user_id = %user_id, cancelled, "cancelled ack waits on disconnect");
            }
        }
        last
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.presence.is_online(user_id).await
    }

    /// Send to all of the user's connections. Returns how many were reached.
    pub async fn push(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        match serde_json::to_string(event) {
            Ok(frame) => self.presence.send_to_user(user_id, frame).await,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to encode server event");
                0
            }
        }
    }

    /// Push `message:new` and wait up to the ack timeout for `message:ack:delivered`
    pub async fn deliver_with_ack(&self, receiver_id: Uuid, message: &Message) -> AckOutcome {
        // register first so an ack racing the push is not lost
        let (token, rx) = self.acks.register(message.id, receiver_id);

        let reached = self
            .push(receiver_id, &ServerEvent::MessageNew(message.clone()))
            .await;
        if reached == 0 {
            self.acks.discard(message.id, token);
            return AckOutcome::NotConnected;
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(AckSignal::Acked)) => AckOutcome::Acked,
            Ok(Ok(AckSignal::ReceiverGone)) | Ok(Err(_)) => AckOutcome::ReceiverGone,
            Err(_) => {
                self.acks.discard(message.id, token);
                AckOutcome::TimedOut
            }
        }
    }
}
