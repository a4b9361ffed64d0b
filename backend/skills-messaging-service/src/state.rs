use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    error::AppResult,
    middleware::JwtVerifier,
    queue::{JobQueue, MemoryJobQueue, QueueWorker, DELIVERY_QUEUE, RECEIPT_QUEUE},
    repository::{MemoryStore, MessagingStore},
    services::{
        ClassDirectory, DeliveryHandler, DeliveryService, LogPushNotifier, MessagingService,
        PushNotifier, ReceiptHandler, SyncCoordinator,
    },
    websocket::LiveChannel,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: JwtVerifier,
    pub store: Arc<dyn MessagingStore>,
    pub live: LiveChannel,
    pub delivery: Arc<DeliveryService>,
    pub messaging: Arc<MessagingService>,
    pub sync: Arc<SyncCoordinator>,
}

/// Storage, queues and outside collaborators the services are built on
pub struct Backends {
    pub store: Arc<dyn MessagingStore>,
    pub delivery_queue: Arc<dyn JobQueue>,
    pub receipt_queue: Arc<dyn JobQueue>,
    pub push: Arc<dyn PushNotifier>,
    pub classes: Arc<dyn ClassDirectory>,
}

impl Backends {
    /// Process-local storage and queues, for tests and single-node development
    pub fn in_memory(classes: Arc<dyn ClassDirectory>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            delivery_queue: Arc::new(MemoryJobQueue::new(DELIVERY_QUEUE)),
            receipt_queue: Arc::new(MemoryJobQueue::new(RECEIPT_QUEUE)),
            push: Arc::new(LogPushNotifier),
            classes,
        }
    }
}

/// The two queue workers, not yet running
pub struct Workers {
    pub delivery: QueueWorker,
    pub receipts: QueueWorker,
}

impl Workers {
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.delivery.run(shutdown.clone())),
            tokio::spawn(self.receipts.run(shutdown)),
        ]
    }

    /// Run whatever is due on both queues, deliveries first
    pub async fn drain_due(&self) -> AppResult<usize> {
        let delivered = self.delivery.drain_due().await?;
        let receipts = self.receipts.drain_due().await?;
        Ok(delivered + receipts)
    }
}

impl AppState {
    /// Wire every service once, explicitly
    pub fn assemble(config: Config, backends: Backends) -> (Self, Workers) {
        let Backends {
            store,
            delivery_queue,
            receipt_queue,
            push,
            classes,
        } = backends;
        let cfg = &config.delivery;

        let live = LiveChannel::new(cfg.ack_timeout);
        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            live.clone(),
            delivery_queue.clone(),
            receipt_queue.clone(),
            push,
            cfg,
        ));
        let messaging = Arc::new(MessagingService::new(
            store.clone(),
            live.clone(),
            delivery.clone(),
            classes,
        ));
        let sync = Arc::new(SyncCoordinator::new(store.clone(), delivery.clone()));

        let workers = Workers {
            delivery: QueueWorker::new(
                delivery_queue,
                Arc::new(DeliveryHandler::new(store.clone(), live.clone())),
                cfg,
                delivery.delivery_wake(),
            ),
            receipts: QueueWorker::new(
                receipt_queue,
                Arc::new(ReceiptHandler::new(store.clone(), live.clone())),
                cfg,
                delivery.receipt_wake(),
            ),
        };

        let state = Self {
            auth: JwtVerifier::new(&config.jwt_secret),
            config: Arc::new(config),
            store,
            live,
            delivery,
            messaging,
            sync,
        };
        (state, workers)
    }
}

#[cfg(test)]
pub fn test_state() -> (AppState, Workers) {
    use crate::services::DenyAllClassDirectory;

    AppState::assemble(
        Config::test_defaults(),
        Backends::in_memory(Arc::new(DenyAllClassDirectory)),
    )
}
