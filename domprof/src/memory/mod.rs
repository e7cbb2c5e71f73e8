//! Guest memory access: address translation and the page cache

pub mod page_cache;
pub mod translate;

pub use page_cache::{CacheStats, GuestMemory, DEFAULT_MAX_CACHED_PAGES};
pub use translate::translate;
