pub mod cell;
pub mod layout;
pub mod location;
pub mod map;

pub use cell::*;
pub use layout::*;
pub use location::*;
pub use map::*;
