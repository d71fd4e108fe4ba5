//! Request-scoped execution context.
//!
//! An [`ExecutionContext`] carries the identity of the request being served (the
//! request id and the acting user). [`run`] binds it to a future as a tokio
//! task-local, so every `.await` inside that future (timers, store calls,
//! chained service calls) sees the same context without it being passed
//! around explicitly. Nested [`run`] calls shadow the outer context for their
//! extent only.
//!
//! Task-locals do not follow `tokio::spawn` on their own. Work that leaves the
//! current task must go through [`spawn`] or [`ScopeFutureExt::in_current_scope`].
//!
//! Readers never fail: outside a request every accessor returns a safe default
//! (user id `0`, request id `"system"`, timezone [`DEFAULT_TIMEZONE`]).
//!
//! ```rust,ignore
//! use tenantcore::context::{self, CurrentUser, ExecutionContext};
//!
//! let ctx = ExecutionContext::begin(headers.get("x-request-id"), Some(user))?;
//! context::run(ctx, async {
//!     let tenant = context::tenant_id();
//!     label_service.list(tenant, query).await
//! })
//! .await
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::futures::TaskLocalFuture;
use tokio::task::JoinHandle;
use tracing::{info, Instrument};

use crate::types::{RequestId, RequestIdError, TenantId, UserId};

/// Request id reported when no request is active.
pub const SYSTEM_REQUEST_ID: &str = "system";

/// Timezone reported when the user has none, or no user is present.
pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";

tokio::task_local! {
    static SCOPE: Option<Arc<ExecutionContext>>;
}

/// Role of the acting user inside their tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum EmployeeType {
    /// Tenant owner; the privileged operator role.
    Boss,
    /// Regular member.
    Normal,
    /// Read-mostly guest.
    Visitor,
    /// Missing or unrecognised role code.
    #[default]
    Unknown,
}

impl From<i32> for EmployeeType {
    fn from(code: i32) -> Self {
        match code {
            1 => Self::Boss,
            2 => Self::Normal,
            3 => Self::Visitor,
            _ => Self::Unknown,
        }
    }
}

impl From<EmployeeType> for i32 {
    fn from(kind: EmployeeType) -> Self {
        match kind {
            EmployeeType::Boss => 1,
            EmployeeType::Normal => 2,
            EmployeeType::Visitor => 3,
            EmployeeType::Unknown => 0,
        }
    }
}

/// The authenticated user of a request.
///
/// Field names follow the `X-User-Data` header document written by the
/// gateway; the tenant arrives as `companyId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    /// Acting user
    #[serde(default)]
    pub user_id: UserId,
    /// Tenant the user belongs to
    #[serde(default, rename = "companyId", alias = "tenantId")]
    pub tenant_id: TenantId,
    /// Role inside the tenant
    #[serde(default)]
    pub employee_type: EmployeeType,
    /// IANA timezone name
    #[serde(default, rename = "timeZone", alias = "timezone")]
    pub timezone: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: String,
}

impl CurrentUser {
    /// Creates a user with the given ids and no role, timezone or name.
    pub fn new(user_id: impl Into<UserId>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            employee_type: EmployeeType::Unknown,
            timezone: None,
            name: String::new(),
        }
    }

    /// Sets the role.
    #[must_use]
    pub const fn with_employee_type(mut self, employee_type: EmployeeType) -> Self {
        self.employee_type = employee_type;
        self
    }

    /// Sets the timezone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parses the JSON user document forwarded by the gateway.
    pub fn from_header_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Identity of the request currently being served.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Correlation id for request tracing.
    pub request_id: RequestId,
    /// Authenticated user, if the request carried one.
    pub user: Option<CurrentUser>,
}

impl ExecutionContext {
    /// Creates a context from already-resolved parts.
    pub const fn new(request_id: RequestId, user: Option<CurrentUser>) -> Self {
        Self { request_id, user }
    }

    /// Builds the context for an inbound request.
    ///
    /// Adopts the caller's request id when it is present and non-blank,
    /// otherwise generates one.
    pub fn begin(
        request_id_header: Option<&str>,
        user: Option<CurrentUser>,
    ) -> Result<Self, RequestIdError> {
        let request_id = match request_id_header.map(|raw| RequestId::try_new(raw)) {
            Some(Ok(request_id)) => request_id,
            _ => {
                let generated = RequestId::generate()?;
                info!(request_id = %generated, "request carried no request id; generated one");
                generated
            }
        };
        Ok(Self::new(request_id, user))
    }
}

/// Runs `future` with `ctx` as the ambient context for its whole async extent.
pub async fn run<F>(ctx: ExecutionContext, future: F) -> F::Output
where
    F: Future,
{
    let span = tracing::info_span!("request", request_id = %ctx.request_id);
    SCOPE
        .scope(Some(Arc::new(ctx)), future)
        .instrument(span)
        .await
}

/// Returns the ambient context, or `None` outside any [`run`] scope.
pub fn current() -> Option<Arc<ExecutionContext>> {
    SCOPE.try_with(Clone::clone).ok().flatten()
}

/// Returns the acting user, if any.
pub fn current_user() -> Option<CurrentUser> {
    current().and_then(|ctx| ctx.user.clone())
}

fn with_user<T>(read: impl FnOnce(&CurrentUser) -> T) -> Option<T> {
    current().and_then(|ctx| ctx.user.as_ref().map(read))
}

/// Acting user id; [`UserId::SYSTEM`] when absent.
pub fn user_id() -> UserId {
    with_user(|user| user.user_id).unwrap_or_default()
}

/// Tenant of the acting user; [`TenantId::UNASSIGNED`] when absent.
pub fn tenant_id() -> TenantId {
    with_user(|user| user.tenant_id).unwrap_or_default()
}

/// Request id; [`SYSTEM_REQUEST_ID`] when absent.
pub fn request_id() -> String {
    current().map_or_else(
        || SYSTEM_REQUEST_ID.to_string(),
        |ctx| ctx.request_id.to_string(),
    )
}

/// Timezone of the acting user; [`DEFAULT_TIMEZONE`] when absent.
pub fn timezone() -> String {
    with_user(|user| user.timezone.clone())
        .flatten()
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string())
}

/// Role of the acting user; [`EmployeeType::Unknown`] when absent.
pub fn employee_type() -> EmployeeType {
    with_user(|user| user.employee_type).unwrap_or_default()
}

/// Display name of the acting user; empty when absent.
pub fn user_name() -> String {
    with_user(|user| user.name.clone()).unwrap_or_default()
}

/// True iff the acting user is the tenant's privileged operator.
pub fn is_privileged() -> bool {
    employee_type() == EmployeeType::Boss
}

/// A future carrying a snapshot of the ambient context.
pub type Scoped<F> = TaskLocalFuture<Option<Arc<ExecutionContext>>, F>;

/// Extension for carrying the ambient context across task boundaries.
pub trait ScopeFutureExt: Future + Sized {
    /// Binds the caller's current context (or its absence) to this future.
    fn in_current_scope(self) -> Scoped<Self> {
        SCOPE.scope(current(), self)
    }
}

impl<F: Future> ScopeFutureExt for F {}

/// Spawns `future` on the runtime with the caller's context and tracing span.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.in_current_scope().in_current_span())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx(request_id: &str, user: Option<CurrentUser>) -> ExecutionContext {
        ExecutionContext::new(RequestId::try_new(request_id).unwrap(), user)
    }

    #[tokio::test]
    async fn accessors_default_outside_any_scope() {
        assert!(current().is_none());
        assert_eq!(user_id(), UserId::SYSTEM);
        assert_eq!(tenant_id(), TenantId::UNASSIGNED);
        assert_eq!(request_id(), "system");
        assert_eq!(timezone(), DEFAULT_TIMEZONE);
        assert_eq!(user_name(), "");
        assert!(!is_privileged());
    }

    #[tokio::test]
    async fn run_exposes_user_across_awaits() {
        let user = CurrentUser::new(11, 7).with_timezone("Europe/Berlin");

        run(ctx("req-1", Some(user)), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(user_id(), UserId::new(11));
            assert_eq!(tenant_id(), TenantId::new(7));
            assert_eq!(request_id(), "req-1");
            assert_eq!(timezone(), "Europe/Berlin");
        })
        .await;

        assert!(current().is_none());
    }

    #[tokio::test]
    async fn context_without_user_still_reports_request_id() {
        run(ctx("req-anon", None), async {
            assert_eq!(request_id(), "req-anon");
            assert_eq!(user_id(), UserId::SYSTEM);
            assert_eq!(timezone(), DEFAULT_TIMEZONE);
        })
        .await;
    }

    #[tokio::test]
    async fn nested_run_shadows_and_restores() {
        run(ctx("outer", Some(CurrentUser::new(1, 1))), async {
            run(ctx("inner", Some(CurrentUser::new(2, 2))), async {
                assert_eq!(user_id(), UserId::new(2));
                assert_eq!(request_id(), "inner");
            })
            .await;

            assert_eq!(user_id(), UserId::new(1));
            assert_eq!(request_id(), "outer");
        })
        .await;
    }

    #[tokio::test]
    async fn spawned_subtask_observes_scope_after_body_returns() {
        // Given: a request scope that spawns work and returns immediately
        let handle = run(ctx("req-spawn", Some(CurrentUser::new(42, 9))), async {
            spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                (user_id(), tenant_id(), request_id())
            })
        })
        .await;

        // When: the sub-task finishes after the scope has ended
        let (user, tenant, request) = handle.await.expect("task should not panic");

        // Then: it still observed the scope it was spawned from
        assert_eq!(user, UserId::new(42));
        assert_eq!(tenant, TenantId::new(9));
        assert_eq!(request, "req-spawn");
    }

    #[tokio::test]
    async fn plain_tokio_spawn_does_not_inherit_scope() {
        let handle = run(ctx("req-plain", Some(CurrentUser::new(3, 3))), async {
            tokio::spawn(async { current().is_none() })
        })
        .await;

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_requests_are_isolated() {
        let first = run(ctx("a", Some(CurrentUser::new(100, 1))), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            user_id()
        });
        let second = run(ctx("b", Some(CurrentUser::new(200, 2))), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            user_id()
        });

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, UserId::new(100));
        assert_eq!(second, UserId::new(200));
    }

    #[tokio::test]
    async fn boss_is_the_privileged_role() {
        let boss = CurrentUser::new(1, 1).with_employee_type(EmployeeType::Boss);
        run(ctx("boss", Some(boss)), async { assert!(is_privileged()) }).await;

        let member = CurrentUser::new(2, 1).with_employee_type(EmployeeType::Normal);
        run(ctx("member", Some(member)), async { assert!(!is_privileged()) }).await;
    }

    #[test]
    fn parses_gateway_user_document() {
        let raw = r#"{"userId":5,"companyId":12,"employeeType":1,"timeZone":"UTC","name":"Ada","email":"a@example.com"}"#;
        let user = CurrentUser::from_header_json(raw).expect("valid header");

        assert_eq!(user.user_id, UserId::new(5));
        assert_eq!(user.tenant_id, TenantId::new(12));
        assert_eq!(user.employee_type, EmployeeType::Boss);
        assert_eq!(user.timezone.as_deref(), Some("UTC"));
        assert_eq!(user.name, "Ada");
    }

    #[test]
    fn begin_generates_missing_request_ids() {
        let adopted = ExecutionContext::begin(Some("abc"), None).unwrap();
        assert_eq!(adopted.request_id.as_ref(), "abc");

        let generated = ExecutionContext::begin(Some("  "), None).unwrap();
        assert_eq!(generated.request_id.as_ref().len(), 32);
        assert_ne!(generated.request_id.as_ref(), "abc");

        let fresh = ExecutionContext::begin(None, None).unwrap();
        assert_ne!(fresh.request_id, generated.request_id);
    }
}
