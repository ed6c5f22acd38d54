pub mod tag_graph;

pub use tag_graph::{TagGraph, TagGraphStats, TagInfo};
