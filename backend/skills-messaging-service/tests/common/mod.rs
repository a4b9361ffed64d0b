#![allow(dead_code)]

use skills_messaging_service::config::{Config, DeliveryConfig};
use skills_messaging_service::repository::MemoryStore;
use skills_messaging_service::services::{ClassDirectory, DenyAllClassDirectory};
use skills_messaging_service::state::{AppState, Backends, Workers};
use skills_messaging_service::websocket::{ConnectionId, ServerEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

pub const ACK_TIMEOUT: Duration = Duration::from_millis(150);

pub struct Harness {
    pub state: AppState,
    pub workers: Workers,
    pub store: Arc<MemoryStore>,
}

/// Zero queue delays so tests drive the workers by hand with `drain_due`
pub fn config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        db_max_connections: 1,
        redis_url: "redis://unused".to_string(),
        port: 0,
        jwt_secret: "integration-secret-0123456789".to_string(),
        push_gateway_url: None,
        enrollment_service_url: None,
        delivery: DeliveryConfig {
            ack_timeout: ACK_TIMEOUT,
            initial_delay: Duration::ZERO,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            ..DeliveryConfig::default()
        },
    }
}

pub fn harness() -> Harness {
    harness_with_classes(Arc::new(DenyAllClassDirectory))
}

pub fn harness_with_classes(classes: Arc<dyn ClassDirectory>) -> Harness {
    build(config(), classes)
}

pub fn harness_with_config(config: Config) -> Harness {
    build(config, Arc::new(DenyAllClassDirectory))
}

fn build(config: Config, classes: Arc<dyn ClassDirectory>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let mut backends = Backends::in_memory(classes);
    backends.store = store.clone();
    let (state, workers) = AppState::assemble(config, backends);
    Harness {
        state,
        workers,
        store,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn decode(frame: &str) -> ServerEvent {
    serde_json::from_str(frame).expect("server frame decodes")
}

/// Connected client that never acks
pub struct Client {
    pub user_id: Uuid,
    pub connection_id: ConnectionId,
    pub frames: UnboundedReceiver<String>,
}

impl Client {
    pub async fn connect(state: &AppState, user_id: Uuid) -> Self {
        let attachment = state.live.attach(user_id).await;
        Self {
            user_id,
            connection_id: attachment.connection_id,
            frames: attachment.receiver,
        }
    }

    pub async fn next_event(&mut self) -> ServerEvent {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("frame before timeout")
            .expect("connection open");
        decode(&frame)
    }

    /// Skip frames until one matches
    pub async fn next_matching(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn disconnect(self, state: &AppState) -> bool {
        state.live.detach(self.user_id, self.connection_id).await
    }
}

/// Connected client that acks every `message:new` it sees and forwards all events
pub async fn acking_client(
    state: &AppState,
    user_id: Uuid,
) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
    let mut client = Client::connect(state, user_id).await;
    let connection_id = client.connection_id;
    let (tx, rx) = mpsc::unbounded_channel();
    let state = state.clone();
    tokio::spawn(async move {
        while let Some(frame) = client.frames.recv().await {
            let event = decode(&frame);
            if let ServerEvent::MessageNew(message) = &event {
                if message.receiver_id == Some(user_id) {
                    let _ = state
                        .messaging
                        .acknowledge_delivered(user_id, message.id)
                        .await;
                }
            }
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    (connection_id, rx)
}
