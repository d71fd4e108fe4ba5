//! Behavioral contracts every backend must satisfy.
//!
//! Each `test_*` function runs one scenario against a freshly built backend and
//! reports the first violated expectation as a [`ContractTestFailure`]. The
//! [`repository_contract_tests!`], [`transaction_contract_tests!`] and
//! [`lock_contract_tests!`] macros expand to one `#[tokio::test]` per
//! scenario, so a backend crate opts into the whole suite with a single
//! invocation and picks up new scenarios automatically.
//!
//! Scenarios isolate themselves by tenant id, request id or key prefix, so
//! they can run in parallel against a shared database.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tenantcore::context::{self, CurrentUser, ExecutionContext};
use tenantcore::entity::fields;
use tenantcore::id::next_snowflake;
use tenantcore::lock::{DistributedLock, LockStore, LockToken, LockTtl};
use tenantcore::locked::Locked;
use tenantcore::{
    transactional, Entity, EntityId, EntityRepository, Filter, FindOptions, LockError, Patch,
    Repository, RequestId, StoreBackend, StoreError, TenantId, Timestamp, TransactionalBackend,
    UserId,
};

use crate::fixtures::{Label, LogRecord};

/// A violated contract expectation.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn lock_error(scenario: &'static str, operation: &'static str, error: &LockError) -> Self {
        Self::new(
            scenario,
            format!("{operation} returned unexpected lock error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn ensure(scenario: &'static str, condition: bool, detail: impl FnOnce() -> String) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(scenario, detail()))
    }
}

fn scenario_tenant() -> TenantId {
    TenantId::new(next_snowflake())
}

fn acting_as(user_id: i64, tenant: TenantId) -> ExecutionContext {
    ExecutionContext::new(
        RequestId::generate().expect("generated request ids are valid"),
        Some(CurrentUser::new(user_id, tenant)),
    )
}

fn repository<E, B>(scenario: &'static str, backend: B) -> Result<Repository<E, B>, ContractTestFailure>
where
    E: Entity,
    B: StoreBackend,
{
    Repository::new(backend).map_err(|error| ContractTestFailure::store_error(scenario, "new", &error))
}

macro_rules! step {
    ($scenario:expr, $operation:literal, $call:expr) => {
        $call
            .await
            .map_err(|error| ContractTestFailure::store_error($scenario, $operation, &error))?
    };
}

fn saved_id(scenario: &'static str, label: &Label) -> Result<EntityId, ContractTestFailure> {
    label
        .meta
        .id
        .clone()
        .ok_or_else(|| ContractTestFailure::assertion(scenario, "saved entity has no id"))
}

/// `save` stamps audit fields and `find_by_id` reads the entity back active.
pub async fn test_save_then_find_by_id<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "save_then_find_by_id";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let saved = step!(
        SCENARIO,
        "save",
        context::run(acting_as(11, tenant), labels.save(Label::new("urgent")))
    );
    let id = saved_id(SCENARIO, &saved)?;

    ensure(SCENARIO, saved.meta.created_at > 0, || {
        "created_at was not stamped".to_string()
    })?;
    ensure(SCENARIO, saved.meta.created_at <= saved.meta.updated_at, || {
        format!(
            "created_at {} is after updated_at {}",
            saved.meta.created_at, saved.meta.updated_at
        )
    })?;
    ensure(SCENARIO, saved.meta.created_by == UserId::new(11), || {
        format!("created_by = {}, expected 11", saved.meta.created_by)
    })?;
    ensure(SCENARIO, saved.meta.tenant_id == tenant, || {
        format!("tenant_id = {}, expected {tenant}", saved.meta.tenant_id)
    })?;

    let found = step!(SCENARIO, "find_by_id", labels.find_by_id(&id)).ok_or_else(|| {
        ContractTestFailure::assertion(SCENARIO, format!("label {id} not found after save"))
    })?;

    ensure(SCENARIO, found.name == "urgent", || {
        format!("read back name `{}`", found.name)
    })?;
    ensure(SCENARIO, found.meta.deleted_at.is_none(), || {
        "freshly saved label is marked deleted".to_string()
    })?;
    ensure(
        SCENARIO,
        found.meta.created_at == saved.meta.created_at && found.meta.tenant_id == tenant,
        || format!("stored meta {:?} differs from saved {:?}", found.meta, saved.meta),
    )
}

/// `soft_delete` hides an entity from default reads and records the actor.
pub async fn test_soft_delete_hides_entity<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "soft_delete_hides_entity";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let saved = step!(
        SCENARIO,
        "save",
        context::run(acting_as(11, tenant), labels.save(Label::new("obsolete")))
    );
    let id = saved_id(SCENARIO, &saved)?;
    let by_id = labels.backend().id_criterion(&id);

    let deleted = step!(
        SCENARIO,
        "soft_delete",
        context::run(acting_as(21, tenant), labels.soft_delete(by_id.clone()))
    );
    ensure(SCENARIO, deleted == 1, || {
        format!("soft_delete affected {deleted} rows, expected 1")
    })?;

    let hidden = step!(SCENARIO, "find_by_id", labels.find_by_id(&id));
    ensure(SCENARIO, hidden.is_none(), || {
        "soft-deleted label still visible to find_by_id".to_string()
    })?;

    let tombstone = step!(
        SCENARIO,
        "find_by_id_with_deleted",
        labels.find_by_id_with_deleted(&id)
    )
    .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "soft-deleted label vanished"))?;
    ensure(SCENARIO, tombstone.meta.deleted_at.is_some(), || {
        "deleted_at not set by soft_delete".to_string()
    })?;
    ensure(SCENARIO, tombstone.meta.deleted_by == UserId::new(21), || {
        format!("deleted_by = {}, expected 21", tombstone.meta.deleted_by)
    })?;

    let active = step!(SCENARIO, "count", labels.count(Filter::tenant(tenant)));
    let all = step!(
        SCENARIO,
        "count_with_deleted",
        labels.count_with_deleted(Filter::tenant(tenant))
    );
    let only_deleted = step!(
        SCENARIO,
        "find_all_deleted",
        labels.find_all_deleted(FindOptions::new(Filter::tenant(tenant)))
    );
    ensure(
        SCENARIO,
        active == 0 && all == 1 && only_deleted.len() == 1,
        || {
            format!(
                "counts active={active} all={all} deleted={}, expected 0/1/1",
                only_deleted.len()
            )
        },
    )?;

    // A second soft delete must not move the original marker.
    let again = step!(
        SCENARIO,
        "soft_delete",
        context::run(acting_as(22, tenant), labels.soft_delete(by_id))
    );
    let unchanged = step!(
        SCENARIO,
        "find_by_id_with_deleted",
        labels.find_by_id_with_deleted(&id)
    );
    ensure(
        SCENARIO,
        again == 0
            && unchanged.is_some_and(|label| {
                label.meta.deleted_by == UserId::new(21)
                    && label.meta.deleted_at == tombstone.meta.deleted_at
            }),
        || format!("repeated soft_delete affected {again} rows or rewrote the marker"),
    )
}

/// `hard_delete` physically removes active and soft-deleted rows alike.
pub async fn test_hard_delete_removes_rows<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "hard_delete_removes_rows";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let saved = step!(
        SCENARIO,
        "save_many",
        context::run(
            acting_as(3, tenant),
            labels.save_many(vec![Label::new("keep"), Label::new("drop")]),
        )
    );
    let first = saved
        .first()
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "save_many returned nothing"))?;
    let first_id = saved_id(SCENARIO, first)?;
    step!(
        SCENARIO,
        "soft_delete",
        labels.soft_delete(Filter::tenant(tenant).and(Filter::eq("name", "drop")))
    );

    let removed = step!(SCENARIO, "hard_delete", labels.hard_delete(Filter::tenant(tenant)));
    ensure(SCENARIO, removed == 2, || {
        format!("hard_delete removed {removed} rows, expected 2")
    })?;

    let remaining = step!(
        SCENARIO,
        "count_with_deleted",
        labels.count_with_deleted(Filter::tenant(tenant))
    );
    let lookup = step!(
        SCENARIO,
        "find_by_id_with_deleted",
        labels.find_by_id_with_deleted(&first_id)
    );
    ensure(SCENARIO, remaining == 0 && lookup.is_none(), || {
        format!("{remaining} rows survived hard_delete")
    })
}

/// `find_and_count` pages active matches and counts them all.
pub async fn test_find_and_count_pages_active_rows<B: StoreBackend>(
    backend: B,
) -> ContractTestResult {
    const SCENARIO: &str = "find_and_count_pages_active_rows";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let mut batch: Vec<Label> = (1..=15).map(|n| Label::new(format!("box-{n:02}"))).collect();
    batch.extend((1..=3).map(|n| Label::new(format!("fox-{n:02}"))));
    batch.extend((1..=2).map(|n| Label::new(format!("plain-{n:02}"))));
    step!(
        SCENARIO,
        "save_many",
        context::run(acting_as(1, tenant), labels.save_many(batch))
    );
    step!(
        SCENARIO,
        "soft_delete",
        labels.soft_delete(Filter::tenant(tenant).and(Filter::contains("name", "fox")))
    );

    let matching = Filter::tenant(tenant).and(Filter::contains("name", "X"));
    let (first_page, total) = step!(
        SCENARIO,
        "find_and_count",
        labels.find_and_count(
            FindOptions::new(matching.clone())
                .order_by_asc("name")
                .page(1, 10)
        )
    );
    ensure(SCENARIO, first_page.len() == 10 && total == 15, || {
        format!(
            "page 1 returned {} rows of {total}, expected 10 of 15",
            first_page.len()
        )
    })?;
    ensure(
        SCENARIO,
        first_page
            .iter()
            .all(|label| label.name.starts_with("box-") && label.meta.deleted_at.is_none()),
        || "page 1 contains deleted or non-matching rows".to_string(),
    )?;
    ensure(SCENARIO, first_page[0].name == "box-01", || {
        format!("page 1 starts at `{}`, expected box-01", first_page[0].name)
    })?;

    let (second_page, total) = step!(
        SCENARIO,
        "find_and_count",
        labels.find_and_count(FindOptions::new(matching).order_by_asc("name").page(2, 10))
    );
    ensure(SCENARIO, second_page.len() == 5 && total == 15, || {
        format!(
            "page 2 returned {} rows of {total}, expected 5 of 15",
            second_page.len()
        )
    })?;

    let (deleted, deleted_total) = step!(
        SCENARIO,
        "find_and_count_deleted",
        labels.find_and_count_deleted(FindOptions::new(Filter::tenant(tenant)))
    );
    ensure(SCENARIO, deleted.len() == 3 && deleted_total == 3, || {
        format!("{deleted_total} soft-deleted rows, expected 3")
    })?;

    let (everything, everything_total) = step!(
        SCENARIO,
        "find_and_count_with_deleted",
        labels.find_and_count_with_deleted(FindOptions::new(Filter::tenant(tenant)).take(4))
    );
    ensure(SCENARIO, everything.len() == 4 && everything_total == 20, || {
        format!(
            "with_deleted returned {} of {everything_total}, expected 4 of 20",
            everything.len()
        )
    })
}

/// `update` patches matching rows and refreshes the update stamps.
pub async fn test_update_patches_and_stamps<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "update_patches_and_stamps";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let saved = step!(
        SCENARIO,
        "save",
        context::run(acting_as(11, tenant), labels.save(Label::new("draft")))
    );
    let id = saved_id(SCENARIO, &saved)?;

    let affected = step!(
        SCENARIO,
        "update",
        context::run(
            acting_as(12, tenant),
            labels.update(
                Filter::tenant(tenant),
                Patch::new().set("description", "edited"),
            ),
        )
    );
    ensure(SCENARIO, affected == 1, || {
        format!("update affected {affected} rows, expected 1")
    })?;

    // Matched rows count even when nothing changes.
    let repeated = step!(
        SCENARIO,
        "update",
        context::run(
            acting_as(12, tenant),
            labels.update(
                Filter::tenant(tenant),
                Patch::new().set("description", "edited"),
            ),
        )
    );
    ensure(SCENARIO, repeated == 1, || {
        format!("repeated update reported {repeated} rows, expected 1")
    })?;

    let updated = step!(SCENARIO, "find_by_id", labels.find_by_id(&id))
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "updated label vanished"))?;
    ensure(SCENARIO, updated.description == "edited", || {
        format!("description = `{}`", updated.description)
    })?;
    ensure(
        SCENARIO,
        updated.meta.updated_by == UserId::new(12) && updated.meta.created_by == UserId::new(11),
        || {
            format!(
                "created_by/updated_by = {}/{}, expected 11/12",
                updated.meta.created_by, updated.meta.updated_by
            )
        },
    )?;
    ensure(SCENARIO, updated.meta.updated_at >= updated.meta.created_at, || {
        "updated_at moved before created_at".to_string()
    })?;

    // Saving the read-back entity again keeps its identity.
    let mut renamed = updated;
    renamed.name = "final".to_string();
    step!(SCENARIO, "save", labels.save(renamed));
    let count = step!(
        SCENARIO,
        "count_with_deleted",
        labels.count_with_deleted(Filter::tenant(tenant))
    );
    let reread = step!(SCENARIO, "find_by_id", labels.find_by_id(&id));
    ensure(
        SCENARIO,
        count == 1 && reread.is_some_and(|label| label.name == "final"),
        || format!("re-save produced {count} rows instead of replacing"),
    )
}

/// Ordering, `find_one` and `In` filters behave alike on every backend.
pub async fn test_queries_filter_and_order<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "queries_filter_and_order";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    step!(
        SCENARIO,
        "save_many",
        context::run(
            acting_as(4, tenant),
            labels.save_many(vec![Label::new("alpha"), Label::new("charlie"), Label::new("bravo")]),
        )
    );

    let descending = step!(
        SCENARIO,
        "find_all",
        labels.find_all(FindOptions::new(Filter::tenant(tenant)).order_by_desc("name"))
    );
    let names: Vec<&str> = descending.iter().map(|label| label.name.as_str()).collect();
    ensure(SCENARIO, names == ["charlie", "bravo", "alpha"], || {
        format!("descending order was {names:?}")
    })?;

    let bravo = step!(
        SCENARIO,
        "find_one",
        labels.find_one(FindOptions::new(
            Filter::tenant(tenant).and(Filter::eq("name", "bravo"))
        ))
    );
    ensure(SCENARIO, bravo.is_some_and(|label| label.name == "bravo"), || {
        "find_one did not return bravo".to_string()
    })?;

    let picked = step!(
        SCENARIO,
        "find_all",
        labels.find_all(FindOptions::new(
            Filter::tenant(tenant).and(Filter::any_of("name", ["alpha", "charlie", "zulu"]))
        ))
    );
    ensure(SCENARIO, picked.len() == 2, || {
        format!("IN filter matched {} rows, expected 2", picked.len())
    })?;

    let either = step!(
        SCENARIO,
        "count",
        labels.count(
            Filter::tenant(tenant)
                .and(Filter::eq("name", "alpha").or(Filter::eq("name", "bravo")))
        )
    );
    ensure(SCENARIO, either == 2, || {
        format!("OR filter counted {either} rows, expected 2")
    })?;

    let missing = step!(
        SCENARIO,
        "find_one_with_deleted",
        labels.find_one_with_deleted(FindOptions::new(
            Filter::tenant(tenant).and(Filter::eq("name", "delta"))
        ))
    );
    ensure(SCENARIO, missing.is_none(), || {
        "find_one_with_deleted invented a row".to_string()
    })
}

/// Entities that are not tenant scoped never inherit the caller's tenant.
pub async fn test_unscoped_entities_skip_tenant<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "unscoped_entities_skip_tenant";

    let records = repository::<LogRecord, B>(SCENARIO, backend)?;
    let marker = format!("req-{}", next_snowflake());

    let mut record = LogRecord::new("warn", "disk almost full");
    record.request_id.clone_from(&marker);
    let saved = step!(
        SCENARIO,
        "save",
        context::run(acting_as(5, TenantId::new(9)), records.save(record))
    );
    ensure(SCENARIO, saved.meta.tenant_id == TenantId::UNASSIGNED, || {
        format!("unscoped entity got tenant {}", saved.meta.tenant_id)
    })?;
    ensure(SCENARIO, saved.meta.created_by == UserId::new(5), || {
        format!("created_by = {}, expected 5", saved.meta.created_by)
    })?;

    let found = step!(
        SCENARIO,
        "find_all",
        records.find_all(FindOptions::new(Filter::eq("request_id", marker.as_str())))
    );
    ensure(SCENARIO, found.len() == 1 && found[0].level == "warn", || {
        format!("found {} records for {marker}", found.len())
    })
}

/// Audit times filter by instant, whatever form the backend stores them in.
pub async fn test_audit_time_filters<B: StoreBackend>(backend: B) -> ContractTestResult {
    const SCENARIO: &str = "audit_time_filters";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let saved = step!(
        SCENARIO,
        "save",
        context::run(acting_as(6, tenant), labels.save(Label::new("stamped")))
    );
    let at = |seconds: i64| {
        Timestamp::from_unix_seconds(seconds).ok_or_else(|| {
            ContractTestFailure::assertion(SCENARIO, format!("{seconds} is out of range"))
        })
    };
    let created = at(saved.meta.created_at)?;
    let hour_later = at(saved.meta.created_at + 3600)?;

    let since = step!(
        SCENARIO,
        "count",
        labels.count(Filter::tenant(tenant).and(Filter::gte(fields::CREATED_AT, created)))
    );
    let before = step!(
        SCENARIO,
        "count",
        labels.count(Filter::tenant(tenant).and(Filter::lt(fields::CREATED_AT, created)))
    );
    let touched = step!(
        SCENARIO,
        "find_all",
        labels.find_all(FindOptions::new(
            Filter::tenant(tenant).and(Filter::lte(fields::UPDATED_AT, hour_later))
        ))
    );
    ensure(SCENARIO, since == 1 && before == 0 && touched.len() == 1, || {
        format!(
            "created_at >= / < matched {since}/{before} and updated_at <= matched {}, expected 1/0/1",
            touched.len()
        )
    })
}

#[derive(Debug)]
enum Abandoned {
    OnPurpose,
    Mismatch(String),
    Store(StoreError),
}

impl From<StoreError> for Abandoned {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Writes made in a rolled-back transaction never become visible.
pub async fn test_rolled_back_writes_are_invisible<B: TransactionalBackend>(
    backend: B,
) -> ContractTestResult {
    const SCENARIO: &str = "rolled_back_writes_are_invisible";

    let labels = repository::<Label, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();

    let kept = step!(
        SCENARIO,
        "save",
        context::run(acting_as(7, tenant), labels.save(Label::new("kept")))
    );
    let kept_id = saved_id(SCENARIO, &kept)?;
    let by_id = labels.backend().id_criterion(&kept_id);

    let outside = &labels;
    let outcome = context::run(
        acting_as(7, tenant),
        transactional(labels.backend(), |tx| {
            let inside = labels.within(&tx);
            async move {
                inside.save(Label::new("discarded")).await?;
                inside.soft_delete(by_id).await?;

                let seen_inside = inside.count(Filter::tenant(tenant)).await?;
                let seen_outside = outside.count(Filter::tenant(tenant)).await?;
                if seen_inside != 1 || seen_outside != 1 {
                    return Err(Abandoned::Mismatch(format!(
                        "mid-transaction counts inside/outside = {seen_inside}/{seen_outside}, expected 1/1"
                    )));
                }
                Err::<(), _>(Abandoned::OnPurpose)
            }
        }),
    )
    .await;
    match outcome {
        Err(Abandoned::OnPurpose) => {}
        Err(Abandoned::Mismatch(detail)) => {
            return Err(ContractTestFailure::assertion(SCENARIO, detail));
        }
        Err(Abandoned::Store(error)) => {
            return Err(ContractTestFailure::store_error(SCENARIO, "transaction", &error));
        }
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "transaction body unexpectedly succeeded",
            ));
        }
    }

    let total = step!(
        SCENARIO,
        "count_with_deleted",
        labels.count_with_deleted(Filter::tenant(tenant))
    );
    let restored = step!(SCENARIO, "find_by_id", labels.find_by_id(&kept_id));
    ensure(
        SCENARIO,
        total == 1 && restored.is_some_and(|label| label.meta.deleted_at.is_none()),
        || format!("{total} rows after rollback, or the soft delete survived"),
    )
}

/// A committed transaction publishes every write across repositories.
pub async fn test_committed_batch_is_visible<B: TransactionalBackend>(
    backend: B,
) -> ContractTestResult {
    const SCENARIO: &str = "committed_batch_is_visible";

    let labels = repository::<Label, B>(SCENARIO, backend.clone())?;
    let records = repository::<LogRecord, B>(SCENARIO, backend)?;
    let tenant = scenario_tenant();
    let marker = format!("batch-{}", next_snowflake());

    let written = step!(
        SCENARIO,
        "transaction",
        context::run(
            acting_as(8, tenant),
            transactional(labels.backend(), |tx| {
                let labels = labels.within(&tx);
                let records = records.within(&tx);
                let mut record = LogRecord::new("info", "labels rotated");
                record.request_id.clone_from(&marker);
                async move {
                    let saved = labels
                        .save_many(vec![Label::new("north"), Label::new("south")])
                        .await?;
                    labels
                        .soft_delete(Filter::tenant(tenant).and(Filter::eq("name", "south")))
                        .await?;
                    records.save(record).await?;
                    Ok::<_, StoreError>(saved.len())
                }
            }),
        )
    );
    ensure(SCENARIO, written == 2, || {
        format!("batch saved {written} labels, expected 2")
    })?;

    let active = step!(SCENARIO, "count", labels.count(Filter::tenant(tenant)));
    let all = step!(
        SCENARIO,
        "count_with_deleted",
        labels.count_with_deleted(Filter::tenant(tenant))
    );
    let logged = step!(
        SCENARIO,
        "find_all",
        records.find_all(FindOptions::new(Filter::eq("request_id", marker.as_str())))
    );
    ensure(
        SCENARIO,
        active == 1 && all == 2 && logged.len() == 1,
        || {
            format!(
                "after commit active={active} all={all} logs={}, expected 1/2/1",
                logged.len()
            )
        },
    )
}

fn contract_lock<S: LockStore>(scenario: &'static str, store: S) -> DistributedLock<S> {
    DistributedLock::new(store, format!("contract-{scenario}-{}", next_snowflake()))
        .with_retry_interval(Duration::from_millis(20))
}

fn ttl(scenario: &'static str, seconds: u64) -> Result<LockTtl, ContractTestFailure> {
    LockTtl::try_new(seconds)
        .map_err(|error| ContractTestFailure::assertion(scenario, format!("bad ttl: {error}")))
}

/// A held key blocks other acquirers until released.
pub async fn test_exclusive_acquire<S: LockStore>(store: S) -> ContractTestResult {
    const SCENARIO: &str = "exclusive_acquire";

    let lock = contract_lock(SCENARIO, store);
    let ttl = ttl(SCENARIO, 30)?;

    let token = lock
        .acquire("job", ttl, None)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", &error))?;

    match lock.acquire("job", ttl, Some(Duration::from_millis(200))).await {
        Err(LockError::Timeout { .. }) => {}
        Err(error) => return Err(ContractTestFailure::lock_error(SCENARIO, "acquire", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "second acquire succeeded while the key was held",
            ))
        }
    }

    let released = lock
        .release("job", &token)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;
    ensure(SCENARIO, released, || "holder could not release".to_string())?;

    let again = lock
        .acquire("job", ttl, Some(Duration::from_millis(200)))
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "re-acquire", &error))?;
    lock.release("job", &again)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;
    Ok(())
}

/// Releasing with a token that is not stored is a no-op.
pub async fn test_stale_token_release_is_noop<S: LockStore>(store: S) -> ContractTestResult {
    const SCENARIO: &str = "stale_token_release_is_noop";

    let lock = contract_lock(SCENARIO, store);
    let ttl = ttl(SCENARIO, 30)?;

    let token = lock
        .acquire("job", ttl, None)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", &error))?;

    let stale = lock
        .release("job", &LockToken::from_stored("0"))
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;
    ensure(SCENARIO, !stale, || "stale token released the key".to_string())?;

    let blocked = lock
        .acquire("job", ttl, Some(Duration::from_millis(100)))
        .await;
    ensure(SCENARIO, blocked.as_ref().is_err_and(LockError::is_timeout), || {
        "key was freed by a stale release".to_string()
    })?;

    let released = lock
        .release("job", &token)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;
    ensure(SCENARIO, released, || "holder could not release".to_string())
}

/// Concurrent holders of one key never overlap.
pub async fn test_concurrent_holders_never_overlap<S: LockStore>(store: S) -> ContractTestResult {
    const SCENARIO: &str = "concurrent_holders_never_overlap";
    const CONTENDERS: usize = 4;

    let lock = contract_lock(SCENARIO, store);
    let ttl = ttl(SCENARIO, 30)?;
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let tasks = (0..CONTENDERS).map(|_| {
        let lock = lock.clone();
        let inside = Arc::clone(&inside);
        let overlaps = Arc::clone(&overlaps);
        tokio::spawn(async move {
            let token = lock.acquire("shared", ttl, None).await?;
            if inside.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            inside.store(false, Ordering::SeqCst);
            lock.release("shared", &token).await
        })
    });

    for outcome in futures::future::join_all(tasks).await {
        let released = outcome
            .map_err(|error| ContractTestFailure::assertion(SCENARIO, format!("task failed: {error}")))?
            .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire/release", &error))?;
        ensure(SCENARIO, released, || "a holder could not release".to_string())?;
    }

    let overlaps = overlaps.load(Ordering::SeqCst);
    ensure(SCENARIO, overlaps == 0, || {
        format!("{overlaps} holders ran while another held the lock")
    })
}

/// An expired lock can be taken over, and the old holder can no longer
/// release it.
pub async fn test_expired_lock_is_reclaimable<S: LockStore>(store: S) -> ContractTestResult {
    const SCENARIO: &str = "expired_lock_is_reclaimable";

    let lock = contract_lock(SCENARIO, store);

    let first = lock
        .acquire("job", ttl(SCENARIO, 1)?, None)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", &error))?;

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let second = lock
        .acquire("job", ttl(SCENARIO, 30)?, Some(Duration::from_secs(1)))
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire after expiry", &error))?;

    let old_release = lock
        .release("job", &first)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;
    ensure(SCENARIO, !old_release, || {
        "expired holder released the new holder's lock".to_string()
    })?;

    let new_release = lock
        .release("job", &second)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;
    ensure(SCENARIO, new_release, || "new holder could not release".to_string())
}

#[derive(Debug)]
enum InvokeError {
    Lock(LockError),
    Rejected,
}

impl From<LockError> for InvokeError {
    fn from(error: LockError) -> Self {
        Self::Lock(error)
    }
}

/// `Locked::invoke` releases on failure and refuses to run while the key is
/// held elsewhere.
pub async fn test_locked_invocation<S: LockStore>(store: S) -> ContractTestResult {
    const SCENARIO: &str = "locked_invocation";

    let lock = contract_lock(SCENARIO, store);
    let ttl = ttl(SCENARIO, 30)?;
    let locked = Locked::<S, serde_json::Value>::builder("label")
        .key("{args.id}")
        .ttl(ttl)
        .acquire_timeout(Some(Duration::from_millis(200)))
        .client(lock.clone())
        .build()
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "build", &error))?;

    // A failing operation still releases its lock.
    let failed: Result<(), InvokeError> = locked
        .invoke(json!({ "id": 7 }), |_| async { Err(InvokeError::Rejected) })
        .await;
    ensure(SCENARIO, matches!(failed, Err(InvokeError::Rejected)), || {
        format!("operation error was not passed through: {failed:?}")
    })?;
    let token = lock
        .acquire("label:7", ttl, Some(Duration::from_millis(200)))
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire after failure", &error))?;

    // While the key is held the operation never runs.
    let ran = Arc::new(AtomicBool::new(false));
    let blocked: Result<u32, InvokeError> = locked
        .invoke(json!({ "id": 7 }), |_| {
            let ran = Arc::clone(&ran);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(1)
            }
        })
        .await;
    ensure(
        SCENARIO,
        matches!(blocked, Err(InvokeError::Lock(LockError::Timeout { .. })))
            && !ran.load(Ordering::SeqCst),
        || format!("contended invoke returned {blocked:?}"),
    )?;

    lock.release("label:7", &token)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", &error))?;

    // Once free, the result comes back unchanged.
    let value: Result<u64, InvokeError> = locked
        .invoke(json!({ "id": 7 }), |args| async move {
            Ok(args["id"].as_u64().map_or(0, |id| id * 6))
        })
        .await;
    ensure(SCENARIO, matches!(value, Ok(42)), || {
        format!("free invoke returned {value:?}")
    })
}

/// Expands to one test per repository scenario.
///
/// `make_backend` is an async function returning a fresh [`StoreBackend`].
/// Leading attributes (such as `#[ignore]`) are applied to every test.
#[macro_export]
macro_rules! repository_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            #[allow(unused_imports)]
            use super::*;
            use $crate::contract::{
                test_find_and_count_pages_active_rows, test_hard_delete_removes_rows,
                test_queries_filter_and_order, test_save_then_find_by_id,
                test_audit_time_filters, test_soft_delete_hides_entity,
                test_unscoped_entities_skip_tenant, test_update_patches_and_stamps,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn save_then_find_by_id_contract() {
                test_save_then_find_by_id($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn soft_delete_hides_entity_contract() {
                test_soft_delete_hides_entity($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn hard_delete_removes_rows_contract() {
                test_hard_delete_removes_rows($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn find_and_count_pages_active_rows_contract() {
                test_find_and_count_pages_active_rows($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn update_patches_and_stamps_contract() {
                test_update_patches_and_stamps($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn queries_filter_and_order_contract() {
                test_queries_filter_and_order($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn unscoped_entities_skip_tenant_contract() {
                test_unscoped_entities_skip_tenant($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn audit_time_filters_contract() {
                test_audit_time_filters($make_backend().await)
                    .await
                    .expect("repository contract failed");
            }
        }
    };
}

pub use repository_contract_tests;

/// Expands to one test per transaction scenario.
///
/// `make_backend` is an async function returning a fresh
/// [`TransactionalBackend`].
#[macro_export]
macro_rules! transaction_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            #[allow(unused_imports)]
            use super::*;
            use $crate::contract::{
                test_committed_batch_is_visible, test_rolled_back_writes_are_invisible,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn rolled_back_writes_are_invisible_contract() {
                test_rolled_back_writes_are_invisible($make_backend().await)
                    .await
                    .expect("transaction contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn committed_batch_is_visible_contract() {
                test_committed_batch_is_visible($make_backend().await)
                    .await
                    .expect("transaction contract failed");
            }
        }
    };
}

pub use transaction_contract_tests;

/// Expands to one test per lock scenario.
///
/// `make_store` is an async function returning a fresh [`LockStore`].
#[macro_export]
macro_rules! lock_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            #[allow(unused_imports)]
            use super::*;
            use $crate::contract::{
                test_concurrent_holders_never_overlap, test_exclusive_acquire,
                test_expired_lock_is_reclaimable, test_locked_invocation,
                test_stale_token_release_is_noop,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn exclusive_acquire_contract() {
                test_exclusive_acquire($make_store().await)
                    .await
                    .expect("lock contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn stale_token_release_is_noop_contract() {
                test_stale_token_release_is_noop($make_store().await)
                    .await
                    .expect("lock contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_holders_never_overlap_contract() {
                test_concurrent_holders_never_overlap($make_store().await)
                    .await
                    .expect("lock contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn expired_lock_is_reclaimable_contract() {
                test_expired_lock_is_reclaimable($make_store().await)
                    .await
                    .expect("lock contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn locked_invocation_contract() {
                test_locked_invocation($make_store().await)
                    .await
                    .expect("lock contract failed");
            }
        }
    };
}

pub use lock_contract_tests;
