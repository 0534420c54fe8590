pub mod conflict;
pub mod handler;
pub mod repository;
pub mod service;
pub mod types;

pub use conflict::ConflictResolver;
pub use handler::{EntityHandler, HandlerRegistry, VersionedEntityHandler};
pub use repository::{
    SqliteSyncQueueRepository, SqliteSyncRecordRepository, SyncQueueRepository,
    SyncRecordRepository,
};
pub use service::{SyncService, SyncServiceImpl};
pub use types::{
    BatchSyncResponse, ItemOutcome, SyncItem, SyncItemResult, SyncOperation, SyncRecord,
    SyncRecordStatus, SyncType,
};
