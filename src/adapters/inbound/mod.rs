pub mod order_feed;

pub use order_feed::*;
