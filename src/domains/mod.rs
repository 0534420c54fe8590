pub mod sync;

pub use sync::{SyncService, SyncServiceImpl};
