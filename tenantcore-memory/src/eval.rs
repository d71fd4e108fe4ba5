//! Evaluation of criteria against JSON documents.

use std::cmp::Ordering;

use serde_json::Value;
use tenantcore::criteria::{CompareOp, FieldValue, Filter, SortDirection, SortKey};
use tenantcore::types::Timestamp;
use tenantcore::Document;

/// Returns true if `document` satisfies `filter`.
pub fn matches(filter: &Filter, document: &Document) -> bool {
    match filter {
        Filter::All => true,
        Filter::Compare { field, op, value } => compare(document.get(field), *op, value),
        Filter::In { field, values } => values
            .iter()
            .any(|value| compare(document.get(field), CompareOp::Eq, value)),
        Filter::Contains { field, needle } => match document.get(field) {
            Some(Value::String(text)) => text.to_lowercase().contains(&needle.to_lowercase()),
            _ => false,
        },
        Filter::IsNull(field) => is_null(document.get(field)),
        Filter::IsNotNull(field) => !is_null(document.get(field)),
        Filter::And(clauses) => clauses.iter().all(|clause| matches(clause, document)),
        Filter::Or(clauses) => clauses.iter().any(|clause| matches(clause, document)),
    }
}

const fn is_null(stored: Option<&Value>) -> bool {
    matches!(stored, None | Some(Value::Null))
}

fn compare(stored: Option<&Value>, op: CompareOp, value: &FieldValue) -> bool {
    if value.is_null() {
        return match op {
            CompareOp::Eq => is_null(stored),
            CompareOp::Ne => !is_null(stored),
            _ => false,
        };
    }
    let Some(stored) = stored.filter(|v| !v.is_null()) else {
        return false;
    };

    match op {
        CompareOp::Eq => order(stored, value) == Some(Ordering::Equal),
        CompareOp::Ne => order(stored, value) != Some(Ordering::Equal),
        CompareOp::Gt => order(stored, value) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            order(stored, value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => order(stored, value) == Some(Ordering::Less),
        CompareOp::Lte => matches!(order(stored, value), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Orders a stored value against an operand, `None` when they are not comparable.
fn order(stored: &Value, value: &FieldValue) -> Option<Ordering> {
    match (stored, value) {
        (Value::Number(n), FieldValue::Int(i)) => match n.as_i64() {
            Some(stored) => Some(stored.cmp(i)),
            #[allow(clippy::cast_precision_loss)]
            None => n.as_f64()?.partial_cmp(&(*i as f64)),
        },
        (Value::Number(n), FieldValue::Float(f)) => n.as_f64()?.partial_cmp(f),
        (Value::String(s), FieldValue::Text(t) | FieldValue::ObjectId(t)) => Some(s.as_str().cmp(t)),
        (Value::Bool(b), FieldValue::Bool(v)) => Some(b.cmp(v)),
        (Value::String(s), FieldValue::Timestamp(ts)) => {
            Timestamp::parse_rfc3339(s).map(|stored| stored.cmp(ts))
        }
        (Value::Number(n), FieldValue::Timestamp(ts)) => {
            n.as_i64().map(|seconds| seconds.cmp(&ts.unix_seconds()))
        }
        (stored, FieldValue::Json(json)) => (stored == json).then_some(Ordering::Equal),
        _ => None,
    }
}

/// Total order over stored values used for sorting. Nulls sort last.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            },
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

/// Sorts documents by `keys`, keeping insertion order for ties.
pub fn sort(documents: &mut [Document], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        keys.iter()
            .map(|key| {
                let ordering = cmp_values(a.get(&key.field), b.get(&key.field));
                match key.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tenantcore::criteria::FindOptions;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[test]
    fn missing_and_null_fields_are_null() {
        let d = doc(json!({ "deleted_at": null }));
        assert!(matches(&Filter::active(), &d));
        assert!(matches(&Filter::is_null("never_set"), &d));
        assert!(!matches(&Filter::deleted(), &d));
    }

    #[test]
    fn contains_ignores_case() {
        let d = doc(json!({ "name": "Quarterly Report" }));
        assert!(matches(&Filter::contains("name", "report"), &d));
        assert!(!matches(&Filter::contains("name", "memo"), &d));
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let d = doc(json!({ "deleted_at": "2025-10-01T08:00:00+00:00" }));
        let before = Timestamp::parse_rfc3339("2025-09-30T00:00:00Z").unwrap();
        let after = Timestamp::parse_rfc3339("2025-10-02T00:00:00Z").unwrap();

        assert!(matches(&Filter::gt("deleted_at", before), &d));
        assert!(matches(&Filter::lt("deleted_at", after), &d));
    }

    #[test]
    fn comparisons_against_absent_fields_fail() {
        let d = doc(json!({}));
        assert!(!matches(&Filter::eq("tenant_id", 7), &d));
        assert!(!matches(&Filter::ne("tenant_id", 7), &d));
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let d = doc(json!({ "level": "warn" }));
        assert!(!matches(&Filter::any_of("level", Vec::<String>::new()), &d));
        assert!(matches(&Filter::any_of("level", ["info", "warn"]), &d));
    }

    #[test]
    fn sort_orders_by_keys_with_nulls_last() {
        let mut docs = vec![
            doc(json!({ "id": 1, "rank": 2 })),
            doc(json!({ "id": 2, "rank": null })),
            doc(json!({ "id": 3, "rank": 1 })),
        ];
        let options = FindOptions::default().order_by_asc("rank");
        sort(&mut docs, &options.order);

        let ids: Vec<_> = docs.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    proptest! {
        #[test]
        fn integer_comparisons_agree_with_i64(stored in any::<i64>(), operand in any::<i64>()) {
            let d = doc(json!({ "n": stored }));
            prop_assert_eq!(matches(&Filter::gt("n", operand), &d), stored > operand);
            prop_assert_eq!(matches(&Filter::lte("n", operand), &d), stored <= operand);
            prop_assert_eq!(matches(&Filter::eq("n", operand), &d), stored == operand);
        }

        #[test]
        fn or_is_the_negation_of_and_of_negations(a in any::<bool>(), b in any::<bool>()) {
            let d = doc(json!({ "a": a, "b": b }));
            let either = Filter::eq("a", true).or(Filter::eq("b", true));
            prop_assert_eq!(matches(&either, &d), a || b);
            let both = Filter::eq("a", true).and(Filter::eq("b", true));
            prop_assert_eq!(matches(&both, &d), a && b);
        }
    }
}
