pub mod embedding;
pub mod fingerprint;
pub mod hybrid;
pub mod knowledge;
pub mod research_index;
pub mod response_cache;

pub use self::embedding::EmbeddingService;
pub use self::fingerprint::compute_fingerprint;
pub use self::knowledge::{KnowledgeContext, KnowledgeRetriever};
pub use self::research_index::{ResearchIndex, ResearchIndexEntry};
pub use self::response_cache::{CacheCandidate, ResponseCache, ResponseCacheEntry};
