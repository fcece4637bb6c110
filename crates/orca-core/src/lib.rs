//! orca-core: shared types, record codec, wire format, and signing primitives.
//! All other Orca crates depend on this one.

pub mod config;
pub mod crypto;
pub mod record;
pub mod wire;

pub use record::{HolderEntry, SignedEntry};
pub use wire::{ChunkRequest, ChunkResponse};
