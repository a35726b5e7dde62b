//! KV backends implementing `epochstore::backend::Backend`.

#![deny(clippy::all)]

pub mod heed_backend;
pub mod memory;

pub use heed_backend::{HeedBackend, HeedError};
pub use memory::MemoryBackend;
