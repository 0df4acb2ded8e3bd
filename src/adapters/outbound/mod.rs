pub mod broadcast_sink;
pub mod fanout_sink;
pub mod kafka_sink;
pub mod logging_sink;
pub mod memory_sink;
pub mod memory_store;
pub mod postgres_store;

pub use broadcast_sink::*;
pub use fanout_sink::*;
pub use kafka_sink::*;
pub use logging_sink::*;
pub use memory_sink::*;
pub use memory_store::*;
pub use postgres_store::*;
