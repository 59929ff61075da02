use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::ColumnSpec;
use crate::types::SemanticType;
use crate::value::Value;

const NULL_TOKENS: [&str; 3] = ["nan", "null", "none"];
const TRUE_TOKENS: [&str; 7] = ["true", "t", "1", "yes", "y", "si", "sí"];
const FALSE_TOKENS: [&str; 5] = ["false", "f", "0", "no", "n"];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Convert a raw cell to the column's semantic type.
///
/// NULL-like input yields `Value::Null`; whether NULL is acceptable for the
/// column is decided by the caller.
pub fn coerce_value(column: &ColumnSpec, value: &Value) -> Result<Value> {
    let fail = |message: String| Error::Coercion {
        column: column.name.clone(),
        message,
    };

    if is_null_like(&column.semantic_type, value) {
        return Ok(Value::Null);
    }
    if matches!(value, Value::Default) {
        return Ok(Value::Default);
    }

    match &column.semantic_type {
        SemanticType::SmallInt => {
            to_integer(value, i16::MIN as i64, i16::MAX as i64).map_err(fail)
        }
        SemanticType::Integer => {
            to_integer(value, i32::MIN as i64, i32::MAX as i64).map_err(fail)
        }
        SemanticType::BigInt => to_integer(value, i64::MIN, i64::MAX).map_err(fail),
        SemanticType::Numeric { precision, scale } => {
            to_numeric(value, *precision, *scale).map_err(fail)
        }
        SemanticType::Double => to_double(value).map_err(fail),
        SemanticType::Text => to_text(value).map_err(fail),
        SemanticType::Varchar(limit) => {
            let text = to_text(value).map_err(fail)?;
            if let Value::Text(inner) = &text {
                let length = inner.chars().count();
                if length > *limit as usize {
                    return Err(fail(format!(
                        "value of length {length} exceeds varchar({limit})"
                    )));
                }
            }
            Ok(text)
        }
        SemanticType::Boolean => to_boolean(value).map_err(fail),
        SemanticType::Date => to_date(value).map(Value::Date).map_err(fail),
        SemanticType::Timestamp => to_timestamp(value).map(Value::Timestamp).map_err(fail),
        SemanticType::TimestampTz => to_timestamptz(value).map(Value::TimestampTz).map_err(fail),
        SemanticType::Uuid => to_uuid(value).map_err(fail),
        SemanticType::Json => to_json(value).map_err(fail),
    }
}

fn is_null_like(semantic_type: &SemanticType, value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Float(number) => number.is_nan(),
        Value::Text(text) if !semantic_type.is_textual() => {
            let trimmed = text.trim().to_lowercase();
            trimmed.is_empty() || NULL_TOKENS.contains(&trimmed.as_str())
        }
        _ => false,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Text(text) => format!("'{text}'"),
        other => other.to_string(),
    }
}

fn to_integer(value: &Value, min: i64, max: i64) -> std::result::Result<Value, String> {
    let parsed = match value {
        Value::Int(number) => Some(*number),
        Value::Float(number) => float_to_i64(*number),
        Value::Numeric(text) | Value::Text(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(float_to_i64))
        }
        _ => None,
    };

    let number = parsed.ok_or_else(|| format!("{} is not an integer", describe(value)))?;
    if number < min || number > max {
        return Err(format!("{number} is out of range [{min}, {max}]"));
    }
    Ok(Value::Int(number))
}

fn float_to_i64(number: f64) -> Option<i64> {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < 9.0e18 {
        Some(number as i64)
    } else {
        None
    }
}

fn to_numeric(
    value: &Value,
    precision: Option<u32>,
    scale: Option<u32>,
) -> std::result::Result<Value, String> {
    let raw = match value {
        Value::Int(number) => number.to_string(),
        Value::Float(number) if number.is_finite() => number.to_string(),
        Value::Numeric(text) | Value::Text(text) => text.trim().to_string(),
        _ => return Err(format!("{} is not a decimal number", describe(value))),
    };

    let canonical = canonical_decimal(&raw)
        .ok_or_else(|| format!("{} is not a decimal number", describe(value)))?;

    if let Some(precision) = precision {
        let integer_digits = canonical
            .trim_start_matches('-')
            .split('.')
            .next()
            .map(|digits| digits.trim_start_matches('0').len())
            .unwrap_or(0);
        let allowed = precision.saturating_sub(scale.unwrap_or(0)) as usize;
        if integer_digits > allowed {
            return Err(format!(
                "{canonical} overflows numeric({precision},{})",
                scale.unwrap_or(0)
            ));
        }
    }

    Ok(Value::Numeric(canonical))
}

/// Normalize `[+-]digits[.digits]` text; rejects exponents and stray characters.
fn canonical_decimal(raw: &str) -> Option<String> {
    let (negative, unsigned) = match raw.as_bytes().first()? {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };
    let (integer, fraction) = match unsigned.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (unsigned, None),
    };
    if integer.is_empty() && fraction.is_none_or(str::is_empty) {
        return None;
    }
    let all_digits = |part: &str| part.bytes().all(|byte| byte.is_ascii_digit());
    if !all_digits(integer) || !fraction.is_none_or(all_digits) {
        return None;
    }

    let integer = integer.trim_start_matches('0');
    let integer = if integer.is_empty() { "0" } else { integer };
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(integer);
    if let Some(fraction) = fraction.filter(|fraction| !fraction.is_empty()) {
        out.push('.');
        out.push_str(fraction);
    }
    Some(out)
}

fn to_double(value: &Value) -> std::result::Result<Value, String> {
    let parsed = match value {
        Value::Int(number) => Some(*number as f64),
        Value::Float(number) => Some(*number),
        Value::Numeric(text) | Value::Text(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(number) if number.is_finite() => Ok(Value::Float(number)),
        _ => Err(format!("{} is not a finite number", describe(value))),
    }
}

fn to_text(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Text(text) => Ok(Value::Text(text.clone())),
        Value::Json(serde_json::Value::String(text)) => Ok(Value::Text(text.clone())),
        other => other
            .render()
            .map(Value::Text)
            .ok_or_else(|| format!("{} has no text form", describe(other))),
    }
}

fn to_boolean(value: &Value) -> std::result::Result<Value, String> {
    let parsed = match value {
        Value::Bool(flag) => Some(*flag),
        Value::Int(0) => Some(false),
        Value::Int(1) => Some(true),
        Value::Float(number) if *number == 0.0 => Some(false),
        Value::Float(number) if *number == 1.0 => Some(true),
        Value::Text(text) => {
            let token = text.trim().to_lowercase();
            if TRUE_TOKENS.contains(&token.as_str()) {
                Some(true)
            } else if FALSE_TOKENS.contains(&token.as_str()) {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    };
    parsed
        .map(Value::Bool)
        .ok_or_else(|| format!("{} is not a boolean", describe(value)))
}

fn to_date(value: &Value) -> std::result::Result<NaiveDate, String> {
    match value {
        Value::Date(date) => Ok(*date),
        Value::Timestamp(ts) => Ok(ts.date()),
        Value::TimestampTz(ts) => Ok(ts.date_naive()),
        Value::Text(text) => {
            let trimmed = text.trim();
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
                .or_else(|| parse_naive_timestamp(trimmed).map(|ts| ts.date()))
                .ok_or_else(|| format!("{} is not a date", describe(value)))
        }
        _ => Err(format!("{} is not a date", describe(value))),
    }
}

fn parse_naive_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc).naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            DATE_FORMATS.iter().find_map(|format| {
                NaiveDate::parse_from_str(text, format)
                    .ok()
                    .map(|date| date.and_time(NaiveTime::MIN))
            })
        })
}

fn to_timestamp(value: &Value) -> std::result::Result<NaiveDateTime, String> {
    match value {
        Value::Timestamp(ts) => Ok(*ts),
        Value::TimestampTz(ts) => Ok(ts.naive_utc()),
        Value::Date(date) => Ok(date.and_time(NaiveTime::MIN)),
        Value::Text(text) => parse_naive_timestamp(text.trim())
            .ok_or_else(|| format!("{} is not a timestamp", describe(value))),
        _ => Err(format!("{} is not a timestamp", describe(value))),
    }
}

fn to_timestamptz(value: &Value) -> std::result::Result<DateTime<Utc>, String> {
    match value {
        Value::TimestampTz(ts) => Ok(*ts),
        Value::Timestamp(ts) => Ok(ts.and_utc()),
        Value::Date(date) => Ok(date.and_time(NaiveTime::MIN).and_utc()),
        Value::Text(text) => {
            let trimmed = text.trim();
            DateTime::parse_from_rfc3339(trimmed)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_naive_timestamp(trimmed).map(|ts| ts.and_utc()))
                .ok_or_else(|| format!("{} is not a timestamp", describe(value)))
        }
        _ => Err(format!("{} is not a timestamp", describe(value))),
    }
}

fn to_uuid(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Uuid(id) => Ok(Value::Uuid(*id)),
        Value::Text(text) => Uuid::parse_str(text.trim())
            .map(Value::Uuid)
            .map_err(|err| format!("{} is not a uuid: {err}", describe(value))),
        _ => Err(format!("{} is not a uuid", describe(value))),
    }
}

fn to_json(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Json(json) => Ok(Value::Json(json.clone())),
        Value::Text(text) => serde_json::from_str(text.trim())
            .map(Value::Json)
            .map_err(|err| format!("{} is not valid JSON: {err}", describe(value))),
        Value::Bool(flag) => Ok(Value::Json(serde_json::Value::Bool(*flag))),
        Value::Int(number) => Ok(Value::Json(serde_json::Value::from(*number))),
        Value::Float(number) => serde_json::Number::from_f64(*number)
            .map(|number| Value::Json(serde_json::Value::Number(number)))
            .ok_or_else(|| format!("{number} is not representable in JSON")),
        other => other
            .render()
            .map(|text| Value::Json(serde_json::Value::String(text)))
            .ok_or_else(|| format!("{} has no JSON form", describe(other))),
    }
}
