pub mod bm25;
pub mod fusion;

pub use bm25::{tokenize, Bm25Params, Bm25Scorer};
pub use fusion::{reciprocal_rank_fusion, weighted_fusion, FusionOptions, RankedSource};
