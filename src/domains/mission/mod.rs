pub mod events;
pub mod machine;
pub mod stage;

pub use events::*;
pub use machine::*;
pub use stage::*;
