pub mod intelligence;
pub mod orchestrator;
pub mod requirements;
pub mod vendor_search;

pub use self::intelligence::IntelligenceGatherer;
pub use self::orchestrator::ResearchOrchestrator;
pub use self::requirements::{ProductRequirements, RequirementsReasoner, RequirementsReasoning};
pub use self::vendor_search::VendorSearch;
