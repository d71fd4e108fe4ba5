//! Entities shared by the contract suites.

use serde::{Deserialize, Serialize};
use tenantcore::{Entity, EntityMeta};

/// A tenant-scoped tag, the typical relational entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Identity and audit fields
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// Display name
    pub name: String,
    /// Free text
    #[serde(default)]
    pub description: String,
}

impl Label {
    /// A new, unsaved label.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: EntityMeta::new(),
            name: name.into(),
            description: String::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Entity for Label {
    const NAME: &'static str = "Label";
    const COLLECTION: &'static str = "label";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// An operational log line. Not tenant scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Identity and audit fields
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// Severity
    pub level: String,
    /// Message text
    pub message: String,
    /// Request that produced the line
    #[serde(default)]
    pub request_id: String,
}

impl LogRecord {
    /// A new, unsaved record.
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            meta: EntityMeta::new(),
            level: level.into(),
            message: message.into(),
            request_id: String::new(),
        }
    }
}

impl Entity for LogRecord {
    const NAME: &'static str = "LogRecord";
    const COLLECTION: &'static str = "log_record";
    const TENANT_SCOPED: bool = false;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
