pub mod catalog;
pub mod data;

pub use catalog::*;
pub use data::seed_store;
