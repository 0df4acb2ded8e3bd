pub mod error;
pub mod event;
pub mod store;

pub use error::*;
pub use event::*;
pub use store::*;
