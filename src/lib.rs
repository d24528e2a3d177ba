pub mod buggify;
pub mod config;
pub mod data;
pub mod io;
pub mod migration;
pub mod observability;
pub mod store;

pub use config::MigrationConfig;
pub use data::{Key, ValueType};
pub use migration::{
    MigrationError, MigrationOrchestrator, RunOutcome, RunState, RunStatus, RunSummary,
};
pub use store::{DestinationStore, InMemoryStore, SourceStore, StoreError};
