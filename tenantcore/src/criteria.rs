//! Backend-neutral query criteria.
//!
//! Repositories accept a [`Filter`] tree, [`FindOptions`] for ordering and paging,
//! and a [`Patch`] for partial updates. Each backend compiles these into its own
//! query language; the soft-delete conditions are added by the repository, never
//! by callers.

use serde_json::Value;

use crate::entity::fields;
use crate::types::{EntityId, TenantId, Timestamp, UserId};

/// A scalar compared against a stored field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Text(String),
    /// Point in time
    Timestamp(Timestamp),
    /// Document-store object id as 24 hex characters
    ObjectId(String),
    /// Arbitrary JSON (nested objects and arrays)
    Json(Value),
}

impl FieldValue {
    /// Renders the value in stored-document form.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) | Self::ObjectId(s) => Value::String(s.clone()),
            Self::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Returns true for [`FieldValue::Null`] and JSON null.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Json(Value::Null))
    }
}

macro_rules! field_value_from {
    ($($source:ty => $variant:ident $(via $conv:expr)?),* $(,)?) => {
        $(
            impl From<$source> for FieldValue {
                fn from(value: $source) -> Self {
                    Self::$variant($( $conv )?(value))
                }
            }
        )*
    };
}

field_value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int via i64::from,
    u32 => Int via i64::from,
    f64 => Float,
    String => Text,
    Timestamp => Timestamp,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<UserId> for FieldValue {
    fn from(value: UserId) -> Self {
        Self::Int(value.get())
    }
}

impl From<TenantId> for FieldValue {
    fn from(value: TenantId) -> Self {
        Self::Int(value.get())
    }
}

impl From<EntityId> for FieldValue {
    fn from(value: EntityId) -> Self {
        match value {
            EntityId::Int(id) => Self::Int(id),
            EntityId::Text(raw) => Self::Text(raw),
        }
    }
}

impl From<&EntityId> for FieldValue {
    fn from(value: &EntityId) -> Self {
        value.clone().into()
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::String(s) => Self::Text(s),
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            other => Self::Json(other),
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

/// A boolean condition over stored fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    /// Matches everything.
    #[default]
    All,
    /// `field <op> value`
    Compare {
        /// Field name
        field: String,
        /// Operator
        op: CompareOp,
        /// Operand
        value: FieldValue,
    },
    /// `field` equals one of `values`.
    In {
        /// Field name
        field: String,
        /// Candidates; an empty list matches nothing
        values: Vec<FieldValue>,
    },
    /// Case-insensitive substring match on a text field.
    Contains {
        /// Field name
        field: String,
        /// Literal substring
        needle: String,
    },
    /// Field is null or absent.
    IsNull(String),
    /// Field is present and not null.
    IsNotNull(String),
    /// Every clause holds.
    And(Vec<Filter>),
    /// At least one clause holds.
    Or(Vec<Filter>),
}

impl Filter {
    fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<FieldValue>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// `field = value`
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// `field <> value`
    pub fn ne(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Gte, value)
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, CompareOp::Lte, value)
    }

    /// `field IN (values...)`
    pub fn any_of<V>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<FieldValue>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Case-insensitive substring match.
    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    /// Field is null or absent.
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull(field.into())
    }

    /// Field is set.
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::IsNotNull(field.into())
    }

    /// `tenant_id = tenant`
    pub fn tenant(tenant: TenantId) -> Self {
        Self::eq(fields::TENANT_ID, tenant)
    }

    /// Rows whose soft-delete marker is unset.
    pub fn active() -> Self {
        Self::is_null(fields::DELETED_AT)
    }

    /// Rows whose soft-delete marker is set.
    pub fn deleted() -> Self {
        Self::is_not_null(fields::DELETED_AT)
    }

    /// Conjunction, flattening nested `And`s and dropping `All`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, other) | (other, Self::All) => other,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (this, Self::And(mut right)) => {
                right.insert(0, this);
                Self::And(right)
            }
            (this, other) => Self::And(vec![this, other]),
        }
    }

    /// Disjunction, flattening nested `Or`s. `All` absorbs the other side.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (this, other) => Self::Or(vec![this, other]),
        }
    }

    /// Returns true if the tree mentions `field` anywhere.
    pub fn references(&self, field: &str) -> bool {
        match self {
            Self::All => false,
            Self::Compare { field: f, .. }
            | Self::In { field: f, .. }
            | Self::Contains { field: f, .. }
            | Self::IsNull(f)
            | Self::IsNotNull(f) => f == field,
            Self::And(clauses) | Self::Or(clauses) => {
                clauses.iter().any(|clause| clause.references(field))
            }
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    /// Smallest first
    #[default]
    Asc,
    /// Largest first
    Desc,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field name
    pub field: String,
    /// Direction
    pub direction: SortDirection,
}

/// Filter plus ordering and paging for reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Row condition
    pub filter: Filter,
    /// Ordering keys, most significant first
    pub order: Vec<SortKey>,
    /// Rows to skip
    pub skip: Option<u64>,
    /// Maximum rows to return
    pub take: Option<u64>,
}

impl FindOptions {
    /// Options selecting rows matching `filter`.
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Adds an ascending ordering key.
    #[must_use]
    pub fn order_by_asc(mut self, field: impl Into<String>) -> Self {
        self.order.push(SortKey {
            field: field.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    /// Adds a descending ordering key.
    #[must_use]
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order.push(SortKey {
            field: field.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    /// Skips the first `rows` matches.
    #[must_use]
    pub const fn skip(mut self, rows: u64) -> Self {
        self.skip = Some(rows);
        self
    }

    /// Limits the result to `rows` matches.
    #[must_use]
    pub const fn take(mut self, rows: u64) -> Self {
        self.take = Some(rows);
        self
    }

    /// Selects the 1-based `page` of `size` rows. Page 0 is treated as page 1.
    #[must_use]
    pub const fn page(self, page: u64, size: u64) -> Self {
        let page = if page == 0 { 1 } else { page };
        self.skip((page - 1).saturating_mul(size)).take(size)
    }

    /// Replaces the filter with its conjunction with `extra`.
    #[must_use]
    pub fn and_filter(mut self, extra: Filter) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(extra);
        self
    }
}

impl From<Filter> for FindOptions {
    fn from(filter: Filter) -> Self {
        Self::new(filter)
    }
}

/// Field assignments applied by a partial update.
///
/// Assignments keep insertion order; setting a field twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    assignments: Vec<(String, FieldValue)>,
}

impl Patch {
    /// An empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `value` to `field`.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    /// Assigns `value` to `field` in place.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        let field = field.into();
        let value = value.into();
        match self.assignments.iter_mut().find(|(name, _)| *name == field) {
            Some((_, existing)) => *existing = value,
            None => self.assignments.push((field, value)),
        }
    }

    /// Assigns `value` only if `field` is not already assigned.
    pub fn insert_if_absent(&mut self, field: &str, value: impl Into<FieldValue>) {
        if !self.contains(field) {
            self.assignments.push((field.to_string(), value.into()));
        }
    }

    /// Value assigned to `field`.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.assignments
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Returns true if `field` is assigned.
    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Returns true if nothing is assigned.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Assignments in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.assignments
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn and_drops_match_all() {
        let f = Filter::eq("name", "x");
        assert_eq!(Filter::All.and(f.clone()), f);
        assert_eq!(f.clone().and(Filter::All), f);
    }

    #[test]
    fn and_flattens_conjunctions() {
        let combined = Filter::eq("a", 1)
            .and(Filter::eq("b", 2))
            .and(Filter::active());

        let Filter::And(clauses) = combined else {
            panic!("expected a conjunction");
        };
        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[2], Filter::IsNull("deleted_at".to_string()));
    }

    #[test]
    fn or_is_absorbed_by_match_all() {
        assert_eq!(Filter::eq("a", 1).or(Filter::All), Filter::All);
    }

    #[test]
    fn references_walks_nested_clauses() {
        let f = Filter::eq("a", 1).or(Filter::deleted());
        assert!(f.references("deleted_at"));
        assert!(!f.references("tenant_id"));
    }

    #[test]
    fn page_zero_is_first_page() {
        let options = FindOptions::default().page(0, 10);
        assert_eq!(options.skip, Some(0));
        assert_eq!(options.take, Some(10));
    }

    #[test]
    fn patch_keeps_last_assignment() {
        let patch = Patch::new().set("name", "a").set("level", 2).set("name", "b");
        let fields: Vec<_> = patch.iter().map(|(name, _)| name).collect();

        assert_eq!(fields, vec!["name", "level"]);
        assert_eq!(patch.get("name"), Some(&FieldValue::Text("b".to_string())));
    }

    #[test]
    fn insert_if_absent_respects_caller_values() {
        let mut patch = Patch::new().set("updated_by", 9i64);
        patch.insert_if_absent("updated_by", 1i64);
        patch.insert_if_absent("updated_at", 5i64);

        assert_eq!(patch.get("updated_by"), Some(&FieldValue::Int(9)));
        assert_eq!(patch.get("updated_at"), Some(&FieldValue::Int(5)));
    }

    #[test]
    fn optional_values_become_null() {
        assert!(FieldValue::from(None::<i64>).is_null());
        assert_eq!(FieldValue::from(Some(3i64)), FieldValue::Int(3));
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let ts = Timestamp::from_unix_seconds(0).unwrap();
        assert_eq!(
            FieldValue::from(ts).to_json(),
            Value::String("1970-01-01T00:00:00+00:00".to_string())
        );
    }

    proptest! {
        #[test]
        fn page_windows_never_overlap(page in 1u64..1_000, size in 1u64..500) {
            let current = FindOptions::default().page(page, size);
            let next = FindOptions::default().page(page + 1, size);
            prop_assert_eq!(current.skip.unwrap() + size, next.skip.unwrap());
        }
    }
}
