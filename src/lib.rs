pub mod config;
pub mod engine;
pub mod error;
pub mod integrations;
pub mod logging;
pub mod models;
pub mod scanner;
pub mod storage;
pub mod sync_state;
pub mod task_line;

pub use engine::{Conflict, CreateLineOutcome, SyncEngine, SyncResult, SyncSettings};
pub use error::SyncError;
