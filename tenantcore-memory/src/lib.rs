//! In-memory backends for `tenantcore`.
//!
//! [`MemoryBackend`] implements the repository seam over JSON documents held in
//! process memory, and [`MemoryLockStore`] implements the lock store with TTL
//! expiry. [`MemoryTransaction`] stages writes on a copy until commit. They
//! are useful for testing and development scenarios where a real database or
//! Redis is not available. They honour the same contracts as the
//! production backends, which the `tenantcore-testing` suites verify.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod backend;
pub mod eval;
mod lock_store;

pub use backend::{MemoryBackend, MemoryCollection, MemoryTransaction};
pub use lock_store::MemoryLockStore;
