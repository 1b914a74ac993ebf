pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod models;
pub mod services;
pub mod vector;

pub use config::Config;
pub use error::{EngineError, Result};
pub use models::{Memory, MemoryKind, MemoryStatus, ScoredMemory};
pub use services::{
    AddInput, DreamConsolidator, Healer, HealthStatus, MemoryService, SearchInput, SetInput,
    UpdateInput,
};
