mod connection;
mod metadata_store;
mod row;
mod schema;
mod write_queue;

pub use connection::Database;
pub use metadata_store::{CacheEntry, LibSqlMetadataStore, MemoryStats, MetadataStore};
