pub mod models;
pub mod restore;
pub mod writer;

pub use restore::restore_state;
pub use writer::{DbWriter, PersistEvent, PersistHandle};
