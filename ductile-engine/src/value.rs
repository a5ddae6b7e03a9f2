//! DuckDB value → JSON mapping.
//!
//! Scalars keep their natural JSON form; values JSON cannot carry exactly
//! travel as strings: decimals and huge integers as decimal strings, blobs
//! as base64, dates/times/timestamps in ISO form.

use base64::Engine as _;
use chrono::{NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value as DuckValue};
use serde_json::{json, Value};

pub fn duck_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(v) => json!(v),
        DuckValue::SmallInt(v) => json!(v),
        DuckValue::Int(v) => json!(v),
        DuckValue::BigInt(v) => json!(v),
        DuckValue::HugeInt(v) => match i64::try_from(v) {
            Ok(v) => json!(v),
            Err(_) => Value::String(v.to_string()),
        },
        DuckValue::UTinyInt(v) => json!(v),
        DuckValue::USmallInt(v) => json!(v),
        DuckValue::UInt(v) => json!(v),
        DuckValue::UBigInt(v) => match i64::try_from(v) {
            Ok(v) => json!(v),
            Err(_) => Value::String(v.to_string()),
        },
        DuckValue::Float(v) => json!(v),
        DuckValue::Double(v) => json!(v),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        DuckValue::Date32(days) => Value::String(format_date(days)),
        DuckValue::Time64(unit, v) => Value::String(format_time(unit, v)),
        DuckValue::Timestamp(unit, v) => Value::String(format_timestamp(unit, v)),
        DuckValue::Interval { months, days, nanos } => {
            json!({ "months": months, "days": days, "nanos": nanos })
        }
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(duck_to_json).collect())
        }
        DuckValue::Struct(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), duck_to_json(v.clone())))
                .collect(),
        ),
        DuckValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (scalar_key(k), duck_to_json(v.clone())))
                .collect(),
        ),
        DuckValue::Union(inner) => duck_to_json(*inner),
        other => Value::String(format!("{other:?}")),
    }
}

fn scalar_key(key: &DuckValue) -> String {
    match key {
        DuckValue::Text(s) | DuckValue::Enum(s) => s.clone(),
        other => match duck_to_json(other.clone()) {
            Value::String(s) => s,
            v => v.to_string(),
        },
    }
}

fn format_date(days_since_epoch: i32) -> String {
    // 1970-01-01 is day 719163 of the common era.
    NaiveDate::from_num_days_from_ce_opt(days_since_epoch + 719_163)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| days_since_epoch.to_string())
}

fn unit_to_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

fn format_time(unit: TimeUnit, v: i64) -> String {
    let micros = unit_to_micros(unit, v);
    let secs = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .map(|t| {
            if nanos == 0 {
                t.format("%H:%M:%S").to_string()
            } else {
                t.format("%H:%M:%S%.6f").to_string()
            }
        })
        .unwrap_or_else(|| micros.to_string())
}

fn format_timestamp(unit: TimeUnit, v: i64) -> String {
    let micros = unit_to_micros(unit, v);
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|ts| {
            let naive = ts.naive_utc();
            if micros % 1_000_000 == 0 {
                naive.format("%Y-%m-%d %H:%M:%S").to_string()
            } else {
                naive.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
            }
        })
        .unwrap_or_else(|| micros.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_keep_json_types() {
        assert_eq!(duck_to_json(DuckValue::Boolean(true)), json!(true));
        assert_eq!(duck_to_json(DuckValue::BigInt(42)), json!(42));
        assert_eq!(duck_to_json(DuckValue::Double(1.5)), json!(1.5));
        assert_eq!(
            duck_to_json(DuckValue::Text("x".into())),
            json!("x")
        );
        assert_eq!(duck_to_json(DuckValue::Null), Value::Null);
    }

    #[test]
    fn huge_ints_fall_back_to_strings() {
        let big = i128::from(i64::MAX) + 1;
        assert_eq!(
            duck_to_json(DuckValue::HugeInt(big)),
            Value::String(big.to_string())
        );
        assert_eq!(duck_to_json(DuckValue::HugeInt(7)), json!(7));
    }

    #[test]
    fn blobs_are_base64() {
        assert_eq!(
            duck_to_json(DuckValue::Blob(vec![1, 2, 3])),
            json!("AQID")
        );
    }

    #[test]
    fn dates_and_times_are_iso() {
        // 2024-06-01 is 19875 days after the epoch.
        assert_eq!(duck_to_json(DuckValue::Date32(19_875)), json!("2024-06-01"));
        assert_eq!(
            duck_to_json(DuckValue::Time64(TimeUnit::Microsecond, 45_000_000_000)),
            json!("12:30:00")
        );
        assert_eq!(
            duck_to_json(DuckValue::Timestamp(TimeUnit::Microsecond, 1_717_243_200_000_000)),
            json!("2024-06-01 12:00:00")
        );
    }

    #[test]
    fn lists_recurse() {
        let v = duck_to_json(DuckValue::List(vec![
            DuckValue::Int(1),
            DuckValue::Text("a".into()),
        ]));
        assert_eq!(v, json!([1, "a"]));
    }
}
