pub mod class_directory;
pub mod delivery;
pub mod messaging;
pub mod push;
pub mod sync;

pub use class_directory::{
    ClassDirectory, DenyAllClassDirectory, HttpClassDirectory, StaticClassDirectory,
};
pub use delivery::{DeliveryHandler, DeliveryService, QueueStatsReport, ReceiptHandler};
pub use messaging::MessagingService;
pub use push::{HttpPushNotifier, LogPushNotifier, PushNotifier};
pub use sync::{SyncCoordinator, SyncResponse};
