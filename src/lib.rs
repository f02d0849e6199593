pub mod browser;
pub mod content;
pub mod core;
pub mod llm;
pub mod memory;
pub mod navigator;
pub mod nlp;
pub mod registry;
pub mod research;
pub mod search;

// --- Primary core exports ---
pub use crate::core::config::{load_core_config, CoreConfig};
pub use crate::core::error::{BlockKind, ResearchError};
pub use crate::core::events::EventSink;
pub use crate::core::state::{CoreBuilder, ResearchCore};
pub use crate::core::types;
pub use crate::core::types::{
    Finding, Intelligence, Intent, ResearchMode, ResearchRequest, ResearchResult,
};
