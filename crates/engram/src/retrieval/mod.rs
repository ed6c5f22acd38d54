pub mod pipeline;
pub mod rerank;

pub use pipeline::{RetrievalOutcome, RetrievalPipeline, SearchRequest};
pub use rerank::recursive_rerank;
