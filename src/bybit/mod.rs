pub mod rest;
pub mod ws;

pub use rest::BybitRest;
pub use ws::{FeedClient, FeedCommand, FeedState};
