//! Workspace variables reported by the compute engine.
//!
//! The compute engine describes variables with a loosely typed JSON dictionary
//! (`name`, `class`, `summary`, `length`, plus class specific keys). These are
//! parsed once at the broker boundary into [`Variable`], which is what clients
//! receive.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason}")]
pub struct VariableError {
    pub reason: String,
}

impl VariableError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub length: u64,
    pub class_name: String,
    pub summary: String,
    pub kind: VariableKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum VariableKind {
    Primitive(PrimitiveValue),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    /// Function source text.
    Function(String),
    Environment(Vec<Variable>),
    DataFrame(DataFrameData),
    List(Vec<Variable>),
    Factor {
        values: Vec<Option<i64>>,
        #[serde(default)]
        levels: Option<Vec<String>>,
    },
    S4Object,
    /// A class the broker does not model, passed through as sent.
    Unknown(Value),
}

/// A vector of R values. `None` entries are `NA`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "values", rename_all = "camelCase")]
pub enum PrimitiveValue {
    Null,
    Boolean(Vec<Option<bool>>),
    Integer(Vec<Option<i64>>),
    Double(#[serde(with = "doubles")] Vec<Option<f64>>),
    String(Vec<Option<String>>),
    Complex(Vec<Option<String>>),
    Raw,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataFrameData {
    pub columns: Vec<DataFrameColumn>,
    pub row_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataFrameColumn {
    pub name: String,
    pub value: PrimitiveValue,
}

impl Variable {
    /// Parses the compute engine's dictionary form of a variable.
    pub fn from_legacy(value: &Value) -> Result<Variable, VariableError> {
        let dict = value
            .as_object()
            .ok_or_else(|| VariableError::new("variable is not an object"))?;
        let name = str_field(dict, "name").ok_or_else(|| VariableError::new("unnamed variable"))?;
        let class_name =
            str_field(dict, "class").ok_or_else(|| VariableError::new("no class name"))?;
        let summary = str_field(dict, "summary").unwrap_or_default();
        let length = dict.get("length").and_then(Value::as_u64).unwrap_or(1);

        let kind = if bool_field(dict, "primitive") {
            let ptype = str_field(dict, "type")
                .ok_or_else(|| VariableError::new("invalid primitive type"))?;
            VariableKind::Primitive(parse_primitive(&ptype, dict.get("value"))?)
        } else if bool_field(dict, "s4") {
            VariableKind::S4Object
        } else {
            parse_classed(&class_name, dict, value)?
        };

        Ok(Variable {
            name,
            length,
            class_name,
            summary,
            kind,
        })
    }
}

fn parse_classed(
    class_name: &str,
    dict: &Map<String, Value>,
    raw: &Value,
) -> Result<VariableKind, VariableError> {
    let kind = match class_name {
        "Date" => {
            let text = dict
                .get("value")
                .and_then(Value::as_str)
                .ok_or_else(|| VariableError::new("invalid date value"))?;
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map_err(|_| VariableError::new(format!("invalid date value {text}")))?;
            VariableKind::Date(date)
        }
        "POSIXct" | "POSIXlt" => {
            let secs = dict
                .get("value")
                .and_then(Value::as_f64)
                .ok_or_else(|| VariableError::new("invalid date value"))?;
            let millis = (secs * 1000.0).round() as i64;
            let stamp = DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| VariableError::new(format!("date out of range {secs}")))?;
            VariableKind::DateTime(stamp)
        }
        "function" => {
            let body =
                str_field(dict, "body").ok_or_else(|| VariableError::new("function w/o body"))?;
            VariableKind::Function(body)
        }
        "environment" => VariableKind::Environment(parse_nested(dict.get("value"))?),
        "list" => VariableKind::List(parse_nested(dict.get("value"))?),
        "factor" => {
            let values = dict
                .get("value")
                .and_then(Value::as_array)
                .ok_or_else(|| VariableError::new("factor without values"))?
                .iter()
                .map(Value::as_i64)
                .collect();
            let levels = dict.get("levels").and_then(Value::as_array).map(|levels| {
                levels
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            });
            VariableKind::Factor { values, levels }
        }
        "data.frame" => VariableKind::DataFrame(parse_data_frame(dict)?),
        _ => VariableKind::Unknown(raw.clone()),
    };
    Ok(kind)
}

fn parse_nested(value: Option<&Value>) -> Result<Vec<Variable>, VariableError> {
    match value {
        Some(Value::Array(items)) => items.iter().map(Variable::from_legacy).collect(),
        _ => Ok(Vec::new()),
    }
}

fn parse_data_frame(dict: &Map<String, Value>) -> Result<DataFrameData, VariableError> {
    let columns = dict
        .get("columns")
        .and_then(Value::as_array)
        .ok_or_else(|| VariableError::new("data.frame without columns"))?
        .iter()
        .map(|col| {
            let col = col
                .as_object()
                .ok_or_else(|| VariableError::new("invalid data.frame column"))?;
            let name =
                str_field(col, "name").ok_or_else(|| VariableError::new("unnamed column"))?;
            let ctype = str_field(col, "type")
                .ok_or_else(|| VariableError::new(format!("column {name} has no type")))?;
            let value = parse_primitive(&ctype, col.get("values"))?;
            Ok(DataFrameColumn { name, value })
        })
        .collect::<Result<Vec<_>, VariableError>>()?;
    let row_names = dict
        .get("row.names")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .map(|n| match n {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(DataFrameData { columns, row_names })
}

fn parse_primitive(ptype: &str, value: Option<&Value>) -> Result<PrimitiveValue, VariableError> {
    let invalid = || VariableError::new(format!("primitive {ptype} with invalid value"));
    let items = || value.and_then(Value::as_array).ok_or_else(invalid);

    let parsed = match ptype {
        "n" => PrimitiveValue::Null,
        "r" => PrimitiveValue::Raw,
        "b" => PrimitiveValue::Boolean(
            items()?
                .iter()
                .map(|v| nullable(v, Value::as_bool).ok_or_else(invalid))
                .collect::<Result<_, _>>()?,
        ),
        "i" => PrimitiveValue::Integer(
            items()?
                .iter()
                .map(|v| nullable(v, Value::as_i64).ok_or_else(invalid))
                .collect::<Result<_, _>>()?,
        ),
        "d" => PrimitiveValue::Double(
            items()?
                .iter()
                .map(parse_double)
                .collect::<Result<_, _>>()?,
        ),
        "s" | "c" => {
            let strings = items()?
                .iter()
                .map(|v| nullable(v, |v| v.as_str().map(str::to_string)).ok_or_else(invalid))
                .collect::<Result<_, _>>()?;
            if ptype == "s" {
                PrimitiveValue::String(strings)
            } else {
                PrimitiveValue::Complex(strings)
            }
        }
        other => {
            return Err(VariableError::new(format!(
                "unknown primitive type: {other}"
            )));
        }
    };
    Ok(parsed)
}

/// `Some(None)` for a JSON null, `Some(Some(_))` for a matching value.
fn nullable<T>(value: &Value, f: impl Fn(&Value) -> Option<T>) -> Option<Option<T>> {
    if value.is_null() {
        Some(None)
    } else {
        f(value).map(Some)
    }
}

fn parse_double(value: &Value) -> Result<Option<f64>, VariableError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| VariableError::new(format!("invalid double value {n}"))),
        Value::String(s) => doubles::from_token(s)
            .map(Some)
            .ok_or_else(|| VariableError::new(format!("invalid string as double value {s}"))),
        other => Err(VariableError::new(format!("invalid double value {other}"))),
    }
}

fn str_field(dict: &Map<String, Value>, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(dict: &Map<String, Value>, key: &str) -> bool {
    dict.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Doubles on the wire: numbers, `null` for NA, and the strings `"Inf"`,
/// `"-Inf"` and `"NaN"` for non-finite values.
mod doubles {
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};
    use serde_json::Value;

    pub fn from_token(token: &str) -> Option<f64> {
        match token {
            "Inf" => Some(f64::INFINITY),
            "-Inf" => Some(f64::NEG_INFINITY),
            "NaN" => Some(f64::NAN),
            _ => None,
        }
    }

    fn to_token(value: f64) -> &'static str {
        if value.is_nan() {
            "NaN"
        } else if value.is_sign_negative() {
            "-Inf"
        } else {
            "Inf"
        }
    }

    pub fn serialize<S: Serializer>(values: &[Option<f64>], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(values.len()))?;
        for value in values {
            match value {
                None => seq.serialize_element(&Option::<f64>::None)?,
                Some(v) if v.is_finite() => seq.serialize_element(v)?,
                Some(v) => seq.serialize_element(to_token(*v))?,
            }
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Option<f64>>, D::Error> {
        Vec::<Value>::deserialize(d)?
            .iter()
            .map(|v| super::parse_double(v).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Collects a set of parsed variables keyed by name.
pub fn keyed_by_name(variables: Vec<Variable>) -> BTreeMap<String, Variable> {
    variables.into_iter().map(|v| (v.name.clone(), v)).collect()
}
