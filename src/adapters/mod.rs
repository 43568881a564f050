//! Concrete collaborators used by the binary.

pub mod feed;
pub mod http;

pub use feed::{FeedEntry, FeedFetcher};
pub use http::{HttpHook, HttpProcessor};
