mod cache;

pub use cache::{CacheError, CacheStore};
