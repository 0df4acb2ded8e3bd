pub mod agv;
pub mod events;
pub mod registry;

pub use agv::*;
pub use events::*;
pub use registry::*;
