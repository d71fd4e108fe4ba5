//! Conversion between documents and stored BSON.

use mongodb::bson::{Bson, Document as BsonDocument};
use serde_json::{Map, Value};
use tenantcore::criteria::FieldValue;
use tenantcore::entity::fields;
use tenantcore::errors::{StoreError, StoreResult};
use tenantcore::types::Timestamp;
use tenantcore::Document;

use crate::filter::{field_bson, PRIMARY_KEY};

const DOCUMENT: &str = "document";

/// Converts a document for storage, renaming `id` to `_id`.
pub fn to_stored(mut document: Document) -> StoreResult<BsonDocument> {
    let id = document.remove(fields::ID).filter(|id| !id.is_null());
    let marker = document.remove(fields::DELETED_AT);

    let mut stored = mongodb::bson::to_document(&Value::Object(document)).map_err(|error| {
        StoreError::Serialization {
            entity: DOCUMENT,
            detail: error.to_string(),
        }
    })?;

    if let Some(id) = id {
        stored.insert(PRIMARY_KEY, field_bson(fields::ID, &FieldValue::from(id)));
    }
    stored.insert(
        fields::DELETED_AT,
        field_bson(fields::DELETED_AT, &FieldValue::from(marker.unwrap_or(Value::Null))),
    );
    Ok(stored)
}

fn marker_json(stored: Bson) -> Value {
    let seconds = match stored {
        Bson::Int64(seconds) => Some(seconds),
        Bson::Int32(seconds) => Some(i64::from(seconds)),
        Bson::DateTime(time) => Some(time.timestamp_millis() / 1_000),
        _ => None,
    };
    seconds
        .and_then(Timestamp::from_unix_seconds)
        .map_or(Value::Null, |ts| Value::String(ts.to_rfc3339()))
}

/// Converts a stored document back, renaming `_id` to `id`.
pub fn from_stored(stored: BsonDocument) -> Document {
    let mut document = Map::new();
    for (key, value) in stored {
        if key == PRIMARY_KEY {
            let id = match value {
                Bson::ObjectId(oid) => Value::String(oid.to_hex()),
                other => other.into_relaxed_extjson(),
            };
            document.insert(fields::ID.to_string(), id);
        } else if key == fields::DELETED_AT {
            document.insert(key, marker_json(value));
        } else {
            document.insert(key, value.into_relaxed_extjson());
        }
    }
    document
        .entry(fields::DELETED_AT)
        .or_insert(Value::Null);
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    fn doc_of(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[test]
    fn ids_and_markers_use_native_types() {
        let hex = "65f1c0ffee65f1c0ffee65f1";
        let stored = to_stored(doc_of(json!({
            "id": hex,
            "tenant_id": 3,
            "deleted_at": "2025-10-09T08:53:20+00:00",
            "name": "urgent"
        })))
        .unwrap();

        assert_eq!(stored.get("_id"), Some(&Bson::ObjectId(ObjectId::parse_str(hex).unwrap())));
        assert_eq!(stored.get("deleted_at"), Some(&Bson::Int64(1_760_000_000)));
        assert_eq!(stored.get("tenant_id"), Some(&Bson::Int64(3)));
        assert!(stored.get("id").is_none());
    }

    #[test]
    fn documents_without_id_leave_it_to_the_server() {
        let stored = to_stored(doc_of(json!({ "name": "fresh" }))).unwrap();
        assert!(stored.get("_id").is_none());
        assert_eq!(stored.get("deleted_at"), Some(&Bson::Null));
    }

    #[test]
    fn stored_documents_read_back_as_entity_json() {
        let oid = ObjectId::new();
        let read = from_stored(doc! {
            "_id": oid,
            "tenant_id": 3_i64,
            "deleted_at": 1_760_000_000_i64,
            "name": "urgent",
        });

        assert_eq!(read["id"], json!(oid.to_hex()));
        assert_eq!(read["tenant_id"], json!(3));
        assert_eq!(read["deleted_at"], json!("2025-10-09T08:53:20+00:00"));
        assert_eq!(read["name"], json!("urgent"));
    }

    #[test]
    fn missing_marker_reads_as_null() {
        let read = from_stored(doc! { "_id": 7_i64 });
        assert_eq!(read["id"], json!(7));
        assert_eq!(read["deleted_at"], Value::Null);
    }
}
