pub mod pathfinder;
pub mod reservation;
pub mod route;

pub use pathfinder::*;
pub use reservation::*;
pub use route::*;
