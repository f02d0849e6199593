pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod types;

pub use self::config::{load_core_config, CoreConfig};
pub use self::error::{BlockKind, ResearchError};
pub use self::state::ResearchCore;
