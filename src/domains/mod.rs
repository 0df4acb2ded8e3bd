pub mod fleet;
pub mod mission;
pub mod planning;
pub mod tasks;
pub mod world;
