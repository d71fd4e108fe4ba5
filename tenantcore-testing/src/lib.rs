//! Shared test support for `tenantcore` backends.
//!
//! - [`fixtures`]: small entity types exercising both tenant-scoped and
//!   unscoped storage.
//! - [`contract`]: behavioral scenarios every [`tenantcore::StoreBackend`] and
//!   [`tenantcore::LockStore`] must pass, with macros that expand them into
//!   `#[tokio::test]` functions.
//!
//! ```ignore
//! async fn backend() -> MemoryBackend {
//!     MemoryBackend::new()
//! }
//!
//! tenantcore_testing::repository_contract_tests! {
//!     suite = memory,
//!     make_backend = backend,
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod contract;
pub mod fixtures;

pub use contract::{ContractTestFailure, ContractTestResult};
pub use fixtures::{Label, LogRecord};
