pub mod events;
pub mod queue;
pub mod task;

pub use events::*;
pub use queue::*;
pub use task::*;
