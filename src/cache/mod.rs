//! Caching layer: vector cache manager with write-behind list stores

mod vector_cache;

pub use vector_cache::VectorCacheManager;
