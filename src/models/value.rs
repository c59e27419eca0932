//! Typed column values.

use std::cmp::Ordering;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

/// The format of date values in their string form.
const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");

/// The logical type of a column.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    #[serde(alias = "boolean", alias = "Boolean")]
    Bool,
    #[serde(alias = "Int", alias = "int8", alias = "int16", alias = "int32", alias = "int64", alias = "Int8", alias = "Int16", alias = "Int32", alias = "Int64")]
    Int,
    #[serde(alias = "Float", alias = "float32", alias = "float64", alias = "Float32", alias = "Float64")]
    Float,
    #[serde(alias = "String", alias = "text", alias = "uuid", alias = "UUID", alias = "json", alias = "JSON")]
    String,
    #[serde(alias = "bytes", alias = "bytea")]
    Binary,
    #[serde(alias = "Date32", alias = "date32")]
    Date,
    Timestamp,
    #[serde(alias = "struct", alias = "nested-struct")]
    Nested,
    List,
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Nested => "nested",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// A single typed value of a message field.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(Date),
    Timestamp(OffsetDateTime),
    Struct(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Value {
    /// The logical type of this value, `None` for `Null`.
    pub fn logical_type(&self) -> Option<LogicalType> {
        Some(match self {
            Self::Null => return None,
            Self::Bool(_) => LogicalType::Bool,
            Self::Int(_) => LogicalType::Int,
            Self::Float(_) => LogicalType::Float,
            Self::String(_) => LogicalType::String,
            Self::Bytes(_) => LogicalType::Binary,
            Self::Date(_) => LogicalType::Date,
            Self::Timestamp(_) => LogicalType::Timestamp,
            Self::Struct(_) => LogicalType::Nested,
            Self::List(_) => LogicalType::List,
        })
    }

    /// Check if this value may be stored in a column of the given type.
    pub fn conforms_to(&self, ty: LogicalType) -> bool {
        match self.logical_type() {
            None => true,
            Some(LogicalType::Int) if ty == LogicalType::Float => true,
            Some(own) => own == ty,
        }
    }

    /// Evaluate `self {op} literal`.
    ///
    /// Numeric values are ordered numerically, mixing integers and floats by widening to `f64`.
    /// Strings are compared lexically. Booleans only support equality operators. A `Null` value
    /// never satisfies a comparison. Comparing values of incompatible types is an error, as it
    /// indicates that the bound filter does not match the stream's schema.
    pub fn compare(&self, op: CompareOp, literal: &Literal) -> Result<bool> {
        let ordering = match (self, literal) {
            (Self::Null, _) => return Ok(false),
            (Self::Int(val), Literal::Int(lit)) => val.cmp(lit),
            (Self::Int(val), Literal::Float(lit)) => partial_cmp_f64(*val as f64, *lit)?,
            (Self::Float(val), Literal::Float(lit)) => partial_cmp_f64(*val, *lit)?,
            (Self::Float(val), Literal::Int(lit)) => partial_cmp_f64(*val, *lit as f64)?,
            (Self::String(val), Literal::String(lit)) => val.as_str().cmp(lit.as_str()),
            (Self::Bool(val), Literal::Bool(lit)) => match op {
                CompareOp::Eq => return Ok(val == lit),
                CompareOp::NotEq => return Ok(val != lit),
                _ => bail!("operator {} is not supported for bool values", op),
            },
            (val, lit) => bail!(
                "can not compare value of type {} with literal {}",
                val.logical_type().map(|ty| ty.to_string()).unwrap_or_else(|| "null".into()),
                lit,
            ),
        };
        Ok(op.matches(ordering))
    }

    /// Render this value as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(val) => Json::Bool(*val),
            Self::Int(val) => Json::from(*val),
            Self::Float(val) => serde_json::Number::from_f64(*val).map(Json::Number).unwrap_or(Json::Null),
            Self::String(val) => Json::String(val.clone()),
            Self::Bytes(val) => Json::Array(val.iter().map(|b| Json::from(*b)).collect()),
            Self::Date(val) => Json::String(val.to_string()),
            Self::Timestamp(val) => Json::String(val.format(&Rfc3339).unwrap_or_else(|_| val.to_string())),
            Self::Struct(fields) => Json::Object(fields.iter().map(|(name, val)| (name.clone(), val.to_json())).collect()),
            Self::List(vals) => Json::Array(vals.iter().map(Value::to_json).collect()),
        }
    }

    /// Build a value from JSON. Integral numbers become `Int`, objects become `Struct`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(val) => Self::Bool(*val),
            Json::Number(num) => match num.as_i64() {
                Some(val) => Self::Int(val),
                None => Self::Float(num.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(val) => Self::String(val.clone()),
            Json::Array(vals) => Self::List(vals.iter().map(Self::from_json).collect()),
            Json::Object(map) => Self::Struct(map.iter().map(|(key, val)| (key.clone(), Self::from_json(val))).collect()),
        }
    }

    /// Build a value of the given logical type from JSON.
    ///
    /// Dates are parsed from `YYYY-MM-DD` strings, timestamps from RFC 3339 strings and binary
    /// values from arrays of bytes. Integers are widened for float columns. JSON null is always
    /// decoded as `Null`, whether the column is nullable is for the caller to check.
    pub fn from_json_typed(json: &serde_json::Value, ty: LogicalType) -> Result<Self> {
        use serde_json::Value as Json;
        let val = match (ty, json) {
            (_, Json::Null) => Self::Null,
            (LogicalType::Float, Json::Number(num)) => Self::Float(num.as_f64().with_context(|| format!("invalid float {}", num))?),
            (LogicalType::Date, Json::String(val)) => Self::Date(Date::parse(val, DATE_FORMAT).with_context(|| format!("invalid date {}", val))?),
            (LogicalType::Timestamp, Json::String(val)) => {
                Self::Timestamp(OffsetDateTime::parse(val, &Rfc3339).with_context(|| format!("invalid timestamp {}", val))?)
            }
            (LogicalType::Binary, Json::Array(vals)) => Self::Bytes(
                vals.iter()
                    .map(|val| val.as_u64().and_then(|byte| u8::try_from(byte).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .context("binary values must be arrays of bytes")?,
            ),
            (_, json) => Self::from_json(json),
        };
        if !val.conforms_to(ty) {
            bail!(
                "value of type {} does not conform to type {}",
                val.logical_type().map(|own| own.to_string()).unwrap_or_else(|| "null".into()),
                ty
            );
        }
        Ok(val)
    }
}

fn partial_cmp_f64(left: f64, right: f64) -> Result<Ordering> {
    match left.partial_cmp(&right) {
        Some(ordering) => Ok(ordering),
        None => bail!("can not order NaN float values"),
    }
}

impl From<bool> for Value {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<i32> for Value {
    fn from(val: i32) -> Self {
        Self::Int(val.into())
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Self {
        Self::Int(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Self::Float(val)
    }
}

impl From<&str> for Value {
    fn from(val: &str) -> Self {
        Self::String(val.into())
    }
}

impl From<String> for Value {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

/// A comparison operator supported by row filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
}

impl CompareOp {
    /// Check if the given ordering of `left` relative to `right` satisfies this operator.
    pub fn matches(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Gt => ordering == Ordering::Greater,
            Self::LtEq => ordering != Ordering::Greater,
            Self::GtEq => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::LtEq => "<=",
            Self::GtEq => ">=",
        };
        f.write_str(op)
    }
}

/// A literal value bound from a filter expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(val) => write!(f, "int {}", val),
            Self::Float(val) => write!(f, "float {}", val),
            Self::String(val) => write!(f, "string '{}'", val),
            Self::Bool(val) => write!(f, "bool {}", val),
        }
    }
}
