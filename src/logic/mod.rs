pub mod merge;
pub mod reconcile;
pub mod unit_of_work;

pub use merge::DocumentMerger;
pub use reconcile::{ChangeReconciler, ReconcileSummary};
pub use unit_of_work::UnitOfWork;
