//! Compilation of criteria into BSON queries.

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, Document as BsonDocument};
use tenantcore::criteria::{CompareOp, FieldValue, Filter, SortDirection, SortKey};
use tenantcore::entity::fields;
use tenantcore::types::Timestamp;

/// Primary key field of every collection.
pub const PRIMARY_KEY: &str = "_id";

/// Returns true if `raw` is a 24-digit hex object id.
pub fn looks_like_object_id(raw: &str) -> bool {
    raw.len() == 24 && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Stored name of `field`.
pub fn stored_field(field: &str) -> &str {
    if field == fields::ID {
        PRIMARY_KEY
    } else {
        field
    }
}

/// Escapes regex metacharacters so `needle` matches literally.
pub fn escape_regex(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for ch in needle.chars() {
        if "\\.+*?()|[]{}^$-/#&~".contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn seconds_of(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::Timestamp(timestamp) => Some(timestamp.unix_seconds()),
        FieldValue::Int(seconds) => Some(*seconds),
        FieldValue::Text(raw) => Timestamp::parse_rfc3339(raw).map(|ts| ts.unix_seconds()),
        FieldValue::Json(json) => match json {
            serde_json::Value::Number(number) => number.as_i64(),
            serde_json::Value::String(raw) => {
                Timestamp::parse_rfc3339(raw).map(|ts| ts.unix_seconds())
            }
            _ => None,
        },
        _ => None,
    }
}

/// Converts `value` to the BSON stored under `field`.
///
/// Ids that look like object ids become `ObjectId`s. Audit times
/// (`created_at`, `updated_at`, `deleted_at`) are stored as unix seconds.
pub fn field_bson(field: &str, value: &FieldValue) -> Bson {
    if field == fields::DELETED_AT {
        return seconds_of(value).map_or(Bson::Null, Bson::Int64);
    }
    if field == fields::CREATED_AT || field == fields::UPDATED_AT {
        if let Some(seconds) = seconds_of(value) {
            return Bson::Int64(seconds);
        }
    }
    if field == fields::ID {
        if let FieldValue::ObjectId(raw) | FieldValue::Text(raw) = value {
            if let Ok(oid) = ObjectId::parse_str(raw) {
                return Bson::ObjectId(oid);
            }
        }
    }

    match value {
        FieldValue::Null => Bson::Null,
        FieldValue::Bool(flag) => Bson::Boolean(*flag),
        FieldValue::Int(number) => Bson::Int64(*number),
        FieldValue::Float(number) => Bson::Double(*number),
        FieldValue::Text(raw) => Bson::String(raw.clone()),
        FieldValue::ObjectId(raw) => ObjectId::parse_str(raw)
            .map_or_else(|_| Bson::String(raw.clone()), Bson::ObjectId),
        FieldValue::Timestamp(timestamp) => Bson::String(timestamp.to_rfc3339()),
        FieldValue::Json(json) => mongodb::bson::to_bson(json).unwrap_or(Bson::Null),
    }
}

fn never() -> BsonDocument {
    doc! { "$expr": false }
}

/// Compiles `filter` into a query document.
pub fn compile(filter: &Filter) -> BsonDocument {
    match filter {
        Filter::All => BsonDocument::new(),
        Filter::Compare { field, op, value } => {
            let name = stored_field(field);
            if value.is_null() {
                return match op {
                    CompareOp::Eq => doc! { name: Bson::Null },
                    CompareOp::Ne => doc! { name: { "$ne": Bson::Null } },
                    _ => never(),
                };
            }
            let operand = field_bson(field, value);
            match op {
                CompareOp::Eq => doc! { name: { "$eq": operand } },
                // `$ne` alone would also match missing fields.
                CompareOp::Ne => doc! {
                    "$and": [
                        { name: { "$ne": operand } },
                        { name: { "$ne": Bson::Null } },
                    ]
                },
                CompareOp::Gt => doc! { name: { "$gt": operand } },
                CompareOp::Gte => doc! { name: { "$gte": operand } },
                CompareOp::Lt => doc! { name: { "$lt": operand } },
                CompareOp::Lte => doc! { name: { "$lte": operand } },
            }
        }
        Filter::In { field, values } => {
            let operands: Vec<Bson> = values
                .iter()
                .filter(|value| !value.is_null())
                .map(|value| field_bson(field, value))
                .collect();
            doc! { stored_field(field): { "$in": operands } }
        }
        Filter::Contains { field, needle } => doc! {
            stored_field(field): { "$regex": escape_regex(needle), "$options": "i" }
        },
        Filter::IsNull(field) => doc! { stored_field(field): Bson::Null },
        Filter::IsNotNull(field) => doc! { stored_field(field): { "$ne": Bson::Null } },
        Filter::And(clauses) => {
            if clauses.is_empty() {
                return BsonDocument::new();
            }
            let compiled: Vec<BsonDocument> = clauses.iter().map(compile).collect();
            doc! { "$and": compiled }
        }
        Filter::Or(clauses) => {
            if clauses.is_empty() {
                return never();
            }
            let compiled: Vec<BsonDocument> = clauses.iter().map(compile).collect();
            doc! { "$or": compiled }
        }
    }
}

/// Compiles ordering keys. Unordered reads sort by `_id`, which follows
/// insertion order.
pub fn compile_sort(order: &[SortKey]) -> BsonDocument {
    if order.is_empty() {
        return doc! { PRIMARY_KEY: 1 };
    }
    let mut sort = BsonDocument::new();
    for key in order {
        let direction = match key.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        sort.insert(stored_field(&key.field), direction);
    }
    sort
}
