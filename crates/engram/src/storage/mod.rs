pub mod chunk_store;

pub use chunk_store::{blob_to_embedding, embedding_to_blob, ChunkPatch, ChunkStore};
