mod dream;
mod healer;
mod memory;

pub use dream::{parse_dream_reply, DreamConsolidator, DreamReply, DreamRunSummary, FactEntry, PreferenceEntry};
pub use healer::{Healer, HealerRunSummary};
pub use memory::{AddInput, HealthStatus, MemoryService, SearchInput, SetInput, UpdateInput};
