pub mod entity;
pub mod graph;
pub mod key;
pub mod metadata;
pub mod state;
pub mod surface;

pub use entity::*;
pub use graph::*;
pub use key::*;
pub use metadata::*;
pub use state::*;
pub use surface::*;
