pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use error::{MergeError, MergeResult, RegistryError};

// Export logic types
pub use logic::{ChangeReconciler, DocumentMerger, ReconcileSummary, UnitOfWork};

// Export all model types
pub use model::*;

// Export store types
pub use store::{
    EntityLoader, FlushReport, MemorySession, MemoryStore, PersistenceSession, RowRef,
};
