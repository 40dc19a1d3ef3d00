//! Storage services below the catalog: the local persistence manager, the
//! buffer manager, the remote object-store gateway contract, and the
//! result cache.

pub mod buffer;
pub mod object_store;
pub mod persistence;
pub mod result_cache;
pub mod testing;

pub use buffer::{BufferManager, Page, PageKey};
pub use object_store::{DisabledGateway, ObjectStoreGateway};
pub use persistence::{ObjectAddr, PersistenceManager};
pub use result_cache::{CacheStats, CachedResult, ResultCacheManager};
