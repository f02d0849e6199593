pub mod bm25;
pub mod rerank;

pub use self::bm25::Bm25;
pub use self::rerank::Reranker;
