use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod ack;
pub mod events;
pub mod handlers;
pub mod live;

pub use ack::{AckRegistry, AckSignal};
pub use events::{ClientEvent, ReceiptNotice, ServerEvent};
pub use live::{AckOutcome, LiveAttachment, LiveChannel};

/// Unique identifier for one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

struct Connection {
    id: ConnectionId,
    sender: UnboundedSender<String>,
}

/// Which users are online, and through which connections.
///
/// A user may hold several connections (tabs, devices). They are online
/// while at least one is open.
#[derive(Default, Clone)]
pub struct PresenceTracker {
    // user_id -> open connections
    inner: Arc<RwLock<HashMap<Uuid, Vec<Connection>>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for `user_id`.
    ///
    /// Returns the connection id, the receiving end of its outbound channel,
    /// and whether this is the user's first open connection.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, UnboundedReceiver<String>, bool) {
        let (tx, rx) = unbounded_channel();
        let id = ConnectionId::new();
        let first = self.mark_online(user_id, id, tx).await;
        (id, rx, first)
    }

    /// Returns true when the user had no other open connection
    pub async fn mark_online(
        &self,
        user_id: Uuid,
        id: ConnectionId,
        sender: UnboundedSender<String>,
    ) -> bool {
        let mut guard = self.inner.write().await;
        let connections = guard.entry(user_id).or_default();
        let first = connections.is_empty();
        connections.push(Connection { id, sender });

        tracing::debug!(
            user_id = %user_id,
            connections = connections.len(),
            "connection registered"
        );
        first
    }

    /// Returns true when the user has no open connection left.
    ///
    /// A user whose entry is already gone counts as going offline here:
    /// `send_to_user` may have pruned the closed connection first.
    pub async fn mark_offline(&self, user_id: Uuid, id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;
        let Some(connections) = guard.get_mut(&user_id) else {
            return true;
        };

        connections.retain(|c| c.id != id);
        if connections.is_empty() {
            guard.remove(&user_id);
            tracing::debug!(user_id = %user_id, "last connection closed");
            return true;
        }
        false
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .get(&user_id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    pub async fn online_user_ids(&self) -> HashSet<Uuid> {
        self.inner.read().await.keys().copied().collect()
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .get(&user_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Send to every open connection of `user_id`. Returns how many were reached.
    ///
    /// Connections whose receiver is gone are dropped.
    pub async fn send_to_user(&self, user_id: Uuid, msg: String) -> usize {
        let mut guard = self.inner.write().await;
        let Some(connections) = guard.get_mut(&user_id) else {
            return 0;
        };

        let before = connections.len();
        connections.retain(|c| c.sender.send(msg.clone()).is_ok());
        let reached = connections.len();

        if before != reached {
            tracing::debug!(
                user_id = %user_id,
                dead = before - reached,
                "dead connections cleaned up"
            );
        }
        if connections.is_empty() {
            guard.remove(&user_id);
        }
        reached
    }
}
