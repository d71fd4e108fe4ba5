//! `tenantcore` - request context, soft-delete repositories and distributed
//! locks for multi-tenant services.
//!
//! The crate has three cooperating parts:
//!
//! - [`context`]: the per-request [`ExecutionContext`] (request id and acting
//!   user), bound as a task-local for the request's whole async extent.
//! - [`repository`]: one [`EntityRepository`] contract with soft-delete
//!   semantics, implemented once in [`Repository`] over pluggable
//!   [`StoreBackend`]s, and wrapped by [`InstrumentedRepository`] for timing.
//!   [`transaction`] lets callers group writes in one store transaction.
//! - [`lock`] and [`locked`]: a [`DistributedLock`] over an atomic key-value
//!   store and the [`Locked`] wrapper that serializes conflicting operations
//!   across replicas.
//!
//! Store drivers live in sibling crates (`tenantcore-postgres`,
//! `tenantcore-mongo`, `tenantcore-redis`, `tenantcore-memory`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod criteria;
pub mod entity;
pub mod errors;
pub mod id;
pub mod instrumented;
pub mod lock;
pub mod locked;
pub mod repository;
pub mod telemetry;
pub mod transaction;
pub mod types;

pub use context::{CurrentUser, EmployeeType, ExecutionContext};
pub use criteria::{FieldValue, Filter, FindOptions, Patch, SortDirection};
pub use entity::{fields, Document, Entity, EntityMeta};
pub use errors::{ConfigError, LockError, LockResult, Operation, StoreError, StoreResult};
pub use instrumented::{
    InstrumentedRepository, OperationKind, OperationRecorder, RepositoryMetrics, TracingRecorder,
};
pub use lock::{DistributedLock, LockGuard, LockStore, LockToken, LockTtl, ReleaseOutcome};
pub use locked::Locked;
pub use repository::{BackendKind, EntityRepository, QueryHandle, Repository, StoreBackend};
pub use transaction::{transactional, StoreTransaction, TransactionalBackend};
pub use types::{
    CollectionName, EntityId, RequestId, RequestIdError, TenantId, Timestamp, UserId,
};
