pub mod coordinator;
pub mod dispatcher;
pub mod fleet;
pub mod mission;
pub mod planner;
pub mod publisher;

pub use coordinator::*;
pub use dispatcher::*;
pub use fleet::*;
pub use mission::*;
pub use planner::*;
pub use publisher::*;
