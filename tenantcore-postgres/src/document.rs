//! Conversion between documents and table rows.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use tenantcore::entity::fields;
use tenantcore::errors::{StoreError, StoreResult};
use tenantcore::id::next_snowflake;
use tenantcore::types::Timestamp;
use tenantcore::Document;

const ROW: &str = "row";

/// A document split into its column values.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RowValues {
    pub(crate) id: i64,
    pub(crate) tenant_id: i64,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) created_by: i64,
    pub(crate) updated_by: i64,
    pub(crate) deleted_at: Option<DateTime<Utc>>,
    pub(crate) deleted_by: i64,
    pub(crate) body: Value,
}

fn integer(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
}

fn marker(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let timestamp = match value? {
        Value::String(raw) => Timestamp::parse_rfc3339(raw),
        Value::Number(seconds) => seconds.as_i64().and_then(Timestamp::from_unix_seconds),
        _ => None,
    };
    timestamp.map(Timestamp::into_datetime)
}

impl RowValues {
    /// Splits `document`, assigning a snowflake id when it has none.
    pub(crate) fn split(mut document: Document) -> StoreResult<Self> {
        let id = match document.remove(fields::ID) {
            None | Some(Value::Null) => next_snowflake(),
            Some(raw) => integer(Some(&raw)).ok_or_else(|| StoreError::Serialization {
                entity: ROW,
                detail: format!("relational ids must be integers, got {raw}"),
            })?,
        };

        let mut column = |name: &str| integer(document.remove(name).as_ref()).unwrap_or_default();
        let tenant_id = column(fields::TENANT_ID);
        let created_at = column(fields::CREATED_AT);
        let updated_at = column(fields::UPDATED_AT);
        let created_by = column(fields::CREATED_BY);
        let updated_by = column(fields::UPDATED_BY);
        let deleted_by = column(fields::DELETED_BY);
        let deleted_at = marker(document.remove(fields::DELETED_AT).as_ref());

        Ok(Self {
            id,
            tenant_id,
            created_at,
            updated_at,
            created_by,
            updated_by,
            deleted_at,
            deleted_by,
            body: Value::Object(document),
        })
    }
}

/// Reassembles a document from a row selected with [`crate::sql::COLUMNS`].
pub(crate) fn from_row(row: &PgRow) -> Result<Document, sqlx::Error> {
    let body: Json<Value> = row.try_get("body")?;
    let mut document = match body.0 {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    for name in [
        fields::ID,
        fields::TENANT_ID,
        fields::CREATED_AT,
        fields::UPDATED_AT,
        fields::CREATED_BY,
        fields::UPDATED_BY,
        fields::DELETED_BY,
    ] {
        let value: i64 = row.try_get(name)?;
        document.insert(name.to_string(), Value::from(value));
    }

    let deleted_at: Option<DateTime<Utc>> = row.try_get(fields::DELETED_AT)?;
    document.insert(
        fields::DELETED_AT.to_string(),
        deleted_at.map_or(Value::Null, |time| {
            Value::String(Timestamp::from(time).to_rfc3339())
        }),
    );
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[test]
    fn audit_fields_leave_the_body() {
        let row = RowValues::split(doc(json!({
            "id": 17,
            "tenant_id": 3,
            "created_at": 100,
            "updated_at": 110,
            "created_by": 9,
            "updated_by": 9,
            "deleted_at": "2025-10-01T08:00:00+00:00",
            "deleted_by": 4,
            "name": "urgent"
        })))
        .unwrap();

        assert_eq!(row.id, 17);
        assert_eq!(row.tenant_id, 3);
        assert_eq!(row.deleted_by, 4);
        assert_eq!(
            row.deleted_at.map(|time| time.timestamp()),
            Timestamp::parse_rfc3339("2025-10-01T08:00:00Z").map(|ts| ts.unix_seconds())
        );
        assert_eq!(row.body, json!({ "name": "urgent" }));
    }

    #[test]
    fn missing_ids_are_generated_and_numeric_strings_accepted() {
        let generated = RowValues::split(doc(json!({ "name": "a" }))).unwrap();
        assert!(generated.id > 0);
        assert_eq!(generated.deleted_at, None);

        let parsed = RowValues::split(doc(json!({ "id": "42" }))).unwrap();
        assert_eq!(parsed.id, 42);
    }

    #[test]
    fn non_numeric_ids_are_rejected() {
        let error = RowValues::split(doc(json!({ "id": "65f1c0ffee" }))).unwrap_err();
        assert!(matches!(error, StoreError::Serialization { .. }));
    }
}
