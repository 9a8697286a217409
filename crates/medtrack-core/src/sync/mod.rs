//! Dual-store synchronization.
//!
//! - [`store`]: `AuthoritativeStore` / `MirrorStore` traits
//! - [`rest`], [`mirror`]: reqwest clients for both stores
//! - [`memory`]: in-memory stores with failure injection
//! - [`retry`]: bounded exponential backoff
//! - [`queue`]: per-path coalescing of mirror snapshots
//! - [`synchronizer`]: write-through then best-effort replication

pub mod memory;
pub mod mirror;
pub mod queue;
pub mod rest;
pub mod retry;
pub mod store;
pub mod synchronizer;
pub mod types;

pub use memory::{MemoryAuthoritativeStore, MemoryMirror, MirrorOp};
pub use mirror::HttpMirror;
pub use queue::{MirrorQueue, MirrorWrite};
pub use rest::RestStore;
pub use retry::RetryPolicy;
pub use store::{AuthoritativeStore, MirrorStore};
pub use synchronizer::Synchronizer;
pub use types::{DoseStatusUpdate, MirrorPath, ReminderStatusUpdate};
