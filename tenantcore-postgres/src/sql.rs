//! Compilation of criteria into SQL.
//!
//! Audit fields are real columns; every other field lives in the `body` JSONB
//! column and is addressed as `body->'field'`. Values are always bound, never
//! interpolated. Field names end up inside string literals, so single quotes
//! are doubled.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tenantcore::criteria::{CompareOp, FieldValue, Filter, SortDirection, SortKey};
use tenantcore::entity::fields;
use tenantcore::types::Timestamp;

/// Selected columns, in the order [`crate::document::from_row`] reads them.
pub(crate) const COLUMNS: &str =
    "id, tenant_id, created_at, updated_at, created_by, updated_by, deleted_at, deleted_by, body";

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

/// Escapes `LIKE` wildcards so `needle` matches literally.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn push_field(builder: &mut QueryBuilder<'_, Postgres>, field: &str) {
    if fields::is_audit_field(field) {
        builder.push(quote_identifier(field));
    } else {
        builder.push(format!("(body->'{}')", escape_literal(field)));
    }
}

fn push_text_field(builder: &mut QueryBuilder<'_, Postgres>, field: &str) {
    if fields::is_audit_field(field) {
        builder.push(format!("{}::text", quote_identifier(field)));
    } else {
        builder.push(format!("(body->>'{}')", escape_literal(field)));
    }
}

fn push_null_check(builder: &mut QueryBuilder<'_, Postgres>, field: &str, null: bool) {
    let sql = match (fields::is_audit_field(field), null) {
        (true, true) => format!("{} IS NULL", quote_identifier(field)),
        (true, false) => format!("{} IS NOT NULL", quote_identifier(field)),
        (false, true) => {
            let path = escape_literal(field);
            format!("(body->'{path}' IS NULL OR body->'{path}' = 'null'::jsonb)")
        }
        (false, false) => {
            let path = escape_literal(field);
            format!("(body->'{path}' IS NOT NULL AND body->'{path}' <> 'null'::jsonb)")
        }
    };
    builder.push(sql);
}

/// Interprets a value destined for the `deleted_at` column.
fn marker_time(value: &FieldValue) -> Option<DateTime<Utc>> {
    match value {
        FieldValue::Timestamp(timestamp) => Some(timestamp.into_datetime()),
        FieldValue::Int(seconds) => Timestamp::from_unix_seconds(*seconds).map(Timestamp::into_datetime),
        FieldValue::Text(raw) => Timestamp::parse_rfc3339(raw).map(Timestamp::into_datetime),
        FieldValue::Json(Value::String(raw)) => {
            Timestamp::parse_rfc3339(raw).map(Timestamp::into_datetime)
        }
        FieldValue::Json(Value::Number(seconds)) => seconds
            .as_i64()
            .and_then(Timestamp::from_unix_seconds)
            .map(Timestamp::into_datetime),
        _ => None,
    }
}

/// Binds `value` typed for the storage of `field`.
pub(crate) fn push_value(builder: &mut QueryBuilder<'_, Postgres>, field: &str, value: &FieldValue) {
    if !fields::is_audit_field(field) {
        builder.push_bind(Json(value.to_json()));
        return;
    }
    if field == fields::DELETED_AT {
        match marker_time(value) {
            Some(time) => builder.push_bind(time),
            None => builder.push("NULL"),
        };
        return;
    }

    // Remaining audit columns are BIGINT.
    match value {
        FieldValue::Null => builder.push("NULL"),
        FieldValue::Bool(flag) => builder.push_bind(i64::from(*flag)),
        FieldValue::Int(number) => builder.push_bind(*number),
        FieldValue::Float(number) => builder.push_bind(*number),
        FieldValue::Timestamp(timestamp) => builder.push_bind(timestamp.unix_seconds()),
        FieldValue::Text(raw) | FieldValue::ObjectId(raw) => match raw.parse::<i64>() {
            Ok(number) => builder.push_bind(number),
            Err(_) => builder.push_bind(raw.clone()),
        },
        FieldValue::Json(json) => match json.as_i64() {
            Some(number) => builder.push_bind(number),
            None => builder.push_bind(Json(json.clone())),
        },
    };
}

const fn operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => " = ",
        CompareOp::Ne => " <> ",
        CompareOp::Gt => " > ",
        CompareOp::Gte => " >= ",
        CompareOp::Lt => " < ",
        CompareOp::Lte => " <= ",
    }
}

/// Appends `filter` as a parenthesized boolean expression.
pub(crate) fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            builder.push("TRUE");
        }
        Filter::Compare { field, op, value } => {
            if value.is_null() {
                match op {
                    CompareOp::Eq => push_null_check(builder, field, true),
                    CompareOp::Ne => push_null_check(builder, field, false),
                    _ => {
                        builder.push("FALSE");
                    }
                }
                return;
            }
            builder.push("(");
            push_field(builder, field);
            builder.push(operator(*op));
            push_value(builder, field, value);
            builder.push(")");
        }
        Filter::In { field, values } => {
            let values: Vec<&FieldValue> = values.iter().filter(|value| !value.is_null()).collect();
            if values.is_empty() {
                builder.push("FALSE");
                return;
            }
            builder.push("(");
            push_field(builder, field);
            builder.push(" IN (");
            for (index, value) in values.into_iter().enumerate() {
                if index > 0 {
                    builder.push(", ");
                }
                push_value(builder, field, value);
            }
            builder.push("))");
        }
        Filter::Contains { field, needle } => {
            builder.push("(");
            push_text_field(builder, field);
            builder.push(" ILIKE ");
            builder.push_bind(like_pattern(needle));
            builder.push(")");
        }
        Filter::IsNull(field) => push_null_check(builder, field, true),
        Filter::IsNotNull(field) => push_null_check(builder, field, false),
        Filter::And(clauses) => push_junction(builder, clauses, " AND ", "TRUE"),
        Filter::Or(clauses) => push_junction(builder, clauses, " OR ", "FALSE"),
    }
}

fn push_junction(
    builder: &mut QueryBuilder<'_, Postgres>,
    clauses: &[Filter],
    joiner: &str,
    empty: &str,
) {
    if clauses.is_empty() {
        builder.push(empty);
        return;
    }
    builder.push("(");
    for (index, clause) in clauses.iter().enumerate() {
        if index > 0 {
            builder.push(joiner);
        }
        push_filter(builder, clause);
    }
    builder.push(")");
}

/// Appends `ORDER BY`. Unordered reads fall back to id order so paging is
/// stable.
pub(crate) fn push_order(builder: &mut QueryBuilder<'_, Postgres>, order: &[SortKey]) {
    builder.push(" ORDER BY ");
    if order.is_empty() {
        builder.push("\"id\" ASC");
        return;
    }
    for (index, key) in order.iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        push_field(builder, &key.field);
        builder.push(match key.direction {
            SortDirection::Asc => " ASC NULLS LAST",
            SortDirection::Desc => " DESC NULLS LAST",
        });
    }
}

/// Appends `LIMIT`/`OFFSET`.
pub(crate) fn push_window(
    builder: &mut QueryBuilder<'_, Postgres>,
    skip: Option<u64>,
    take: Option<u64>,
) {
    if let Some(take) = take {
        builder.push(" LIMIT ");
        builder.push_bind(i64::try_from(take).unwrap_or(i64::MAX));
    }
    if let Some(skip) = skip.filter(|skip| *skip > 0) {
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(skip).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantcore::criteria::FindOptions;
    use tenantcore::TenantId;

    fn compile(filter: &Filter) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_filter(&mut builder, filter);
        builder.sql().to_string()
    }

    #[test]
    fn audit_fields_are_columns_and_the_rest_is_body() {
        let filter = Filter::tenant(TenantId::new(5)).and(Filter::eq("name", "urgent"));
        assert_eq!(
            compile(&filter),
            "((\"tenant_id\" = $1) AND ((body->'name') = $2))"
        );
    }

    #[test]
    fn null_comparisons_become_null_checks() {
        assert_eq!(compile(&Filter::active()), "\"deleted_at\" IS NULL");
        assert_eq!(
            compile(&Filter::eq("note", FieldValue::Null)),
            "(body->'note' IS NULL OR body->'note' = 'null'::jsonb)"
        );
        assert_eq!(compile(&Filter::gt("note", FieldValue::Null)), "FALSE");
    }

    #[test]
    fn contains_uses_case_insensitive_like() {
        assert_eq!(
            compile(&Filter::contains("name", "x")),
            "((body->>'name') ILIKE $1)"
        );
        assert_eq!(like_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn empty_junctions_and_lists_are_constants() {
        assert_eq!(compile(&Filter::Or(Vec::new())), "FALSE");
        assert_eq!(compile(&Filter::And(Vec::new())), "TRUE");
        assert_eq!(compile(&Filter::any_of("level", Vec::<String>::new())), "FALSE");
        assert_eq!(compile(&Filter::All), "TRUE");
    }

    #[test]
    fn in_lists_bind_every_value() {
        assert_eq!(
            compile(&Filter::any_of("id", [1_i64, 2, 3])),
            "(\"id\" IN ($1, $2, $3))"
        );
    }

    #[test]
    fn field_names_cannot_escape_the_literal() {
        assert_eq!(
            compile(&Filter::eq("a'b", 1)),
            "((body->'a''b') = $1)"
        );
    }

    #[test]
    fn unparsable_marker_values_bind_as_null() {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_value(&mut builder, fields::DELETED_AT, &FieldValue::Bool(true));
        assert_eq!(builder.sql(), "NULL");
    }

    #[test]
    fn order_and_window_follow_find_options() {
        let options = FindOptions::default()
            .order_by_desc("created_at")
            .order_by_asc("name")
            .page(3, 20);
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1");
        push_order(&mut builder, &options.order);
        push_window(&mut builder, options.skip, options.take);
        assert_eq!(
            builder.sql(),
            "SELECT 1 ORDER BY \"created_at\" DESC NULLS LAST, (body->'name') ASC NULLS LAST LIMIT $1 OFFSET $2"
        );
    }

    #[test]
    fn unordered_reads_sort_by_id() {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_order(&mut builder, &[]);
        push_window(&mut builder, Some(0), None);
        assert_eq!(builder.sql(), " ORDER BY \"id\" ASC");
    }
}
