//! Conversion between AMQP field tables and JSON header maps

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString};
use serde_json::{Map, Number, Value};
use worq_core::domain::Headers;

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), to_amqp(value));
    }
    table
}

fn to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        // AMQP has no unsigned 64-bit type; large u64s travel as text.
        Value::Number(n) => match (n.as_i64(), n.is_u64(), n.as_f64()) {
            (Some(i), _, _) => AMQPValue::LongLongInt(i),
            (None, false, Some(f)) => AMQPValue::Double(f),
            _ => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp).collect::<Vec<_>>()))
        }
        Value::Object(fields) => {
            let mut table = FieldTable::default();
            for (key, value) in fields {
                table.insert(key.as_str().into(), to_amqp(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

/// Headers of a delivery. Fails on values JSON cannot represent (non-finite
/// floats, non-UTF-8 strings).
pub(crate) fn from_field_table(table: Option<&FieldTable>) -> Result<Headers, String> {
    let mut headers = Headers::new();
    if let Some(table) = table {
        for (key, value) in table.inner() {
            let value = from_amqp(value).map_err(|e| format!("header {key}: {e}"))?;
            headers.insert(key.as_str().to_string(), value);
        }
    }
    Ok(headers)
}

fn float(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("non-finite number {f}"))
}

fn from_amqp(value: &AMQPValue) -> Result<Value, String> {
    Ok(match value {
        AMQPValue::Void => Value::Null,
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(u) => Value::from(*u),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(u) => Value::from(*u),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(u) => Value::from(*u),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => float(f64::from(*f))?,
        AMQPValue::Double(f) => float(*f)?,
        AMQPValue::DecimalValue(d) => {
            float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))?
        }
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => Value::from(
            std::str::from_utf8(s.as_bytes()).map_err(|e| format!("invalid UTF-8: {e}"))?,
        ),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().map(|b| Value::from(*b)).collect())
        }
        AMQPValue::FieldArray(items) => Value::Array(
            items
                .as_slice()
                .iter()
                .map(from_amqp)
                .collect::<Result<_, _>>()?,
        ),
        AMQPValue::FieldTable(table) => {
            let mut fields = Map::new();
            for (key, value) in table.inner() {
                fields.insert(key.as_str().to_string(), from_amqp(value)?);
            }
            Value::Object(fields)
        }
    })
}
