mod hnsw;

pub use hnsw::{HnswConfig, VectorRecord, VectorStore};
