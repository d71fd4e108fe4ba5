//! Run an operation under a distributed lock.
//!
//! [`Locked`] serializes calls that conflict logically (same tenant, same
//! record) across every replica of a service. Each call resolves a key from a
//! template or a derivation function, acquires `{module}:{key}`, runs the
//! operation and releases the lock on every exit path.
//!
//! ```rust,ignore
//! let assign = Locked::builder("label")
//!     .key("{tenant_id}:{args.label_id}")
//!     .ttl(LockTtl::try_new(30)?)
//!     .client(lock.clone())
//!     .build()?;
//!
//! assign
//!     .invoke(request, |request| async move { service.assign(request).await })
//!     .await?;
//! ```
//!
//! # Key templates
//!
//! Placeholders are written in braces:
//!
//! - `{tenant_id}`, `{user_id}`, `{request_id}` read the ambient context.
//! - `{args}` is the whole argument, `{args.a.b}` / `{args.items.0}` walk into
//!   its serialized form.
//!
//! A placeholder that does not resolve to a scalar is a configuration error,
//! as is a key that renders empty.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::config::LockSettings;
use crate::context;
use crate::errors::{LockError, LockResult};
use crate::lock::{DistributedLock, LockStore, LockTtl};

/// Lock lifetime when none is configured.
pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// Acquisition timeout when none is configured.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

type DeriveKey<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

enum KeySource<A> {
    Template(String),
    Derive(DeriveKey<A>),
}

impl<A> Clone for KeySource<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Template(template) => Self::Template(template.clone()),
            Self::Derive(derive) => Self::Derive(Arc::clone(derive)),
        }
    }
}

impl<A> fmt::Debug for KeySource<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Self::Derive(_) => f.write_str("Derive(..)"),
        }
    }
}

/// Builder for [`Locked`].
pub struct LockedBuilder<S, A> {
    module: String,
    key: Option<KeySource<A>>,
    ttl: Option<LockTtl>,
    acquire_timeout: Option<Duration>,
    client: Option<DistributedLock<S>>,
}

impl<S: LockStore, A> LockedBuilder<S, A> {
    /// Uses a key template. See the module docs for placeholders.
    #[must_use]
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.key = Some(KeySource::Template(template.into()));
        self
    }

    /// Derives the key from the operation's argument.
    #[must_use]
    pub fn key_with<F>(mut self, derive: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key = Some(KeySource::Derive(Arc::new(derive)));
        self
    }

    /// Lock lifetime. Defaults to [`DEFAULT_TTL_SECONDS`] unless
    /// [`settings`](Self::settings) supplied one.
    #[must_use]
    pub const fn ttl(mut self, ttl: LockTtl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// How long to wait for the lock; `None` or zero waits indefinitely.
    /// Defaults to [`DEFAULT_ACQUIRE_TIMEOUT`].
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Takes the lock lifetime and acquisition timeout from loaded settings
    /// (`LOCK_TTL_SECONDS`, `LOCK_TIMEOUT_SECONDS`). Later calls to
    /// [`ttl`](Self::ttl) or [`acquire_timeout`](Self::acquire_timeout)
    /// override them.
    #[must_use]
    pub const fn settings(mut self, settings: &LockSettings) -> Self {
        self.ttl = Some(settings.ttl);
        self.acquire_timeout = settings.acquire_timeout();
        self
    }

    /// The lock client. Required.
    #[must_use]
    pub fn client(mut self, client: DistributedLock<S>) -> Self {
        self.client = Some(client);
        self
    }

    /// Validates the configuration.
    pub fn build(self) -> LockResult<Locked<S, A>> {
        let module = self.module.trim().to_string();
        if module.is_empty() {
            return Err(LockError::Configuration(
                "locked operation needs a module name".to_string(),
            ));
        }
        let client = self.client.ok_or_else(|| {
            LockError::Configuration(format!("no lock client configured for module `{module}`"))
        })?;
        let key = match self.key {
            Some(KeySource::Template(template)) if template.trim().is_empty() => None,
            other => other,
        }
        .ok_or_else(|| {
            LockError::Configuration(format!("no lock key configured for module `{module}`"))
        })?;
        let ttl = match self.ttl {
            Some(ttl) => ttl,
            None => LockTtl::try_new(DEFAULT_TTL_SECONDS)
                .map_err(|err| LockError::Configuration(err.to_string()))?,
        };

        Ok(Locked {
            module,
            key,
            ttl,
            acquire_timeout: self.acquire_timeout,
            client,
        })
    }
}

/// An operation wrapper holding a distributed lock for the duration of each
/// call.
pub struct Locked<S, A> {
    module: String,
    key: KeySource<A>,
    ttl: LockTtl,
    acquire_timeout: Option<Duration>,
    client: DistributedLock<S>,
}

impl<S, A> Clone for Locked<S, A> {
    fn clone(&self) -> Self {
        Self {
            module: self.module.clone(),
            key: self.key.clone(),
            ttl: self.ttl,
            acquire_timeout: self.acquire_timeout,
            client: self.client.clone(),
        }
    }
}

impl<S, A> fmt::Debug for Locked<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked")
            .field("module", &self.module)
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: LockStore, A> Locked<S, A> {
    /// Starts configuring a locked operation for `module`.
    pub fn builder(module: impl Into<String>) -> LockedBuilder<S, A> {
        LockedBuilder {
            module: module.into(),
            key: None,
            ttl: None,
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            client: None,
        }
    }

    /// Module namespace of the lock keys.
    pub fn module(&self) -> &str {
        &self.module
    }
}

impl<S: LockStore, A: Serialize> Locked<S, A> {
    /// Lock key (without the store prefix) for a call with `args`.
    pub fn resolve_key(&self, args: &A) -> LockResult<String> {
        let key = match &self.key {
            KeySource::Derive(derive) => derive(args),
            KeySource::Template(template) => {
                let args = serde_json::to_value(args).map_err(|err| {
                    LockError::Configuration(format!("lock key arguments not serializable: {err}"))
                })?;
                render_key(template, &args)?
            }
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(LockError::Configuration(format!(
                "lock key for module `{}` evaluated empty",
                self.module
            )));
        }
        Ok(format!("{}:{key}", self.module))
    }

    /// Runs `op(args)` while holding the lock.
    ///
    /// Lock failures (configuration, timeout, store) are returned through `E`
    /// before `op` runs. Once `op` has run its result is returned unchanged;
    /// a failed release is logged, not reported.
    pub async fn invoke<F, Fut, T, E>(&self, args: A, op: F) -> Result<T, E>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let key = self.resolve_key(&args)?;
        let guard = self
            .client
            .lock(&key, self.ttl, self.acquire_timeout)
            .await?;

        let result = op(args).await;

        if let Err(err) = guard.release().await {
            error!(key = %key, error = %err, "lock release failed after locked operation");
        }
        result
    }
}

/// Renders a key template against the ambient context and `args`.
pub fn render_key(template: &str, args: &Value) -> LockResult<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            LockError::Configuration(format!("unclosed placeholder in lock key `{template}`"))
        })?;
        let name = after[..close].trim();
        let value = resolve_placeholder(name, args).ok_or_else(|| {
            LockError::Configuration(format!(
                "placeholder `{{{name}}}` in lock key `{template}` did not resolve"
            ))
        })?;
        rendered.push_str(&value);
        rest = &after[close + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn resolve_placeholder(name: &str, args: &Value) -> Option<String> {
    match name {
        "tenant_id" => Some(context::tenant_id().to_string()),
        "user_id" => Some(context::user_id().to_string()),
        "request_id" => Some(context::request_id()),
        "args" => scalar(args),
        _ => {
            let path = name.strip_prefix("args.")?;
            let mut node = args;
            for segment in path.split('.') {
                node = match node {
                    Value::Object(map) => map.get(segment)?,
                    Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            scalar(node)
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
