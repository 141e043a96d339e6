//! Runtime column types.
//!
//! The engine reports each result column's type as a string such as
//! `Nullable(UInt64)` or `Array(Tuple(a String, b DateTime64(3, 'UTC')))`.
//! [`ColumnType`] is the parsed form; it decides which [`Value`] shape a
//! column accepts and how raw JSON cells are read.

use super::Value;
use crate::error::{Result, ScopeError};
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// Parsed engine column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    /// 128/256-bit integers, carried as decimal text.
    WideInt(String),
    Float32,
    Float64,
    /// Carried as decimal text.
    Decimal { precision: u8, scale: u8 },
    Bool,
    String,
    FixedString(usize),
    Uuid,
    Ipv4,
    Ipv6,
    /// Enum8/Enum16 with their definition text.
    Enum(String),
    Date,
    Date32,
    DateTime { timezone: Option<String> },
    DateTime64 { precision: u8, timezone: Option<String> },
    Nullable(Box<ColumnType>),
    Array(Box<ColumnType>),
    /// Elements with their optional names.
    Tuple(Vec<(Option<String>, ColumnType)>),
    Map(Box<ColumnType>, Box<ColumnType>),
    /// Anything else; read as text.
    Other(String),
}

impl ColumnType {
    /// Parses an engine type string.
    pub fn parse(type_name: &str) -> Result<Self> {
        let type_name = type_name.trim();
        let (name, args) = split_call(type_name)?;

        let parsed = match (name, args) {
            ("Int8", None) => Self::Int8,
            ("Int16", None) => Self::Int16,
            ("Int32", None) => Self::Int32,
            ("Int64", None) => Self::Int64,
            ("UInt8", None) => Self::UInt8,
            ("UInt16", None) => Self::UInt16,
            ("UInt32", None) => Self::UInt32,
            ("UInt64", None) => Self::UInt64,
            ("Int128" | "Int256" | "UInt128" | "UInt256", None) => Self::WideInt(name.to_string()),
            ("Float32", None) => Self::Float32,
            ("Float64", None) => Self::Float64,
            ("Bool" | "Boolean", None) => Self::Bool,
            ("String", None) => Self::String,
            ("UUID", None) => Self::Uuid,
            ("IPv4", None) => Self::Ipv4,
            ("IPv6", None) => Self::Ipv6,
            ("Date", None) => Self::Date,
            ("Date32", None) => Self::Date32,
            ("DateTime", None) => Self::DateTime { timezone: None },
            ("DateTime", Some(args)) => Self::DateTime {
                timezone: Some(unquote(args.trim())),
            },
            ("DateTime64", Some(args)) => {
                let parts = split_args(args)?;
                Self::DateTime64 {
                    precision: parse_number(type_name, parts.first().copied())?,
                    timezone: parts.get(1).map(|tz| unquote(tz)),
                }
            }
            ("FixedString", Some(args)) => Self::FixedString(parse_number(type_name, Some(args))?),
            ("Decimal", Some(args)) => {
                let parts = split_args(args)?;
                Self::Decimal {
                    precision: parse_number(type_name, parts.first().copied())?,
                    scale: parse_number(type_name, parts.get(1).copied().or(Some("0")))?,
                }
            }
            ("Decimal32" | "Decimal64" | "Decimal128" | "Decimal256", Some(args)) => {
                let precision = match name {
                    "Decimal32" => 9,
                    "Decimal64" => 18,
                    "Decimal128" => 38,
                    _ => 76,
                };
                Self::Decimal {
                    precision,
                    scale: parse_number(type_name, Some(args))?,
                }
            }
            ("Enum8" | "Enum16", Some(_)) => Self::Enum(type_name.to_string()),
            ("Nullable", Some(inner)) => Self::Nullable(Box::new(Self::parse(inner)?)),
            ("LowCardinality", Some(inner)) => Self::parse(inner)?,
            ("Array", Some(inner)) => Self::Array(Box::new(Self::parse(inner)?)),
            ("Tuple", Some(args)) => Self::Tuple(
                split_args(args)?
                    .into_iter()
                    .map(parse_tuple_element)
                    .collect::<Result<_>>()?,
            ),
            ("Map", Some(args)) => {
                let parts = split_args(args)?;
                let [key, value] = parts.as_slice() else {
                    return Err(ScopeError::decode(format!(
                        "Map type needs two arguments: {type_name}"
                    )));
                };
                Self::Map(Box::new(Self::parse(key)?), Box::new(Self::parse(value)?))
            }
            _ => Self::Other(type_name.to_string()),
        };

        Ok(parsed)
    }

    /// Returns true if `value` has the runtime shape this column produces.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Nullable(inner), v) => v.is_null() || inner.accepts(v),
            (Self::Other(_), _) => true,
            (Self::Int8, Value::Int(v)) => i8::try_from(*v).is_ok(),
            (Self::Int16, Value::Int(v)) => i16::try_from(*v).is_ok(),
            (Self::Int32, Value::Int(v)) => i32::try_from(*v).is_ok(),
            (Self::Int64, Value::Int(_)) => true,
            (Self::UInt8, Value::UInt(v)) => u8::try_from(*v).is_ok(),
            (Self::UInt16, Value::UInt(v)) => u16::try_from(*v).is_ok(),
            (Self::UInt32, Value::UInt(v)) => u32::try_from(*v).is_ok(),
            (Self::UInt64, Value::UInt(_)) => true,
            (Self::Float32 | Self::Float64, Value::Float(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (
                Self::WideInt(_)
                | Self::Decimal { .. }
                | Self::String
                | Self::FixedString(_)
                | Self::Uuid
                | Self::Ipv4
                | Self::Ipv6
                | Self::Enum(_),
                Value::String(_),
            ) => true,
            (Self::Date | Self::Date32, Value::Date(_)) => true,
            (Self::DateTime { .. } | Self::DateTime64 { .. }, Value::DateTime(_)) => true,
            (Self::Array(inner), Value::Array(items)) => items.iter().all(|v| inner.accepts(v)),
            (Self::Tuple(elements), Value::Tuple(items)) => {
                elements.len() == items.len()
                    && elements.iter().zip(items).all(|((_, ty), v)| ty.accepts(v))
            }
            (Self::Map(key, value), Value::Map(pairs)) => pairs
                .iter()
                .all(|(k, v)| key.accepts(k) && value.accepts(v)),
            _ => false,
        }
    }

    /// Reads one JSON cell as produced by the engine's JSON row formats.
    ///
    /// 64-bit and wider integers may arrive quoted.
    pub fn read_json(&self, raw: &serde_json::Value) -> std::result::Result<Value, String> {
        use serde_json::Value as Json;

        match (self, raw) {
            (Self::Nullable(_) | Self::Other(_), Json::Null) => Ok(Value::Null),
            (Self::Nullable(inner), raw) => inner.read_json(raw),
            // Non-finite floats are written as null.
            (Self::Float32 | Self::Float64, Json::Null) => Ok(Value::Float(f64::NAN)),
            (_, Json::Null) => Err(format!("unexpected NULL for {self}")),

            (Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64, raw) => {
                let v = json_integer::<i64>(raw).ok_or_else(|| self.mismatch(raw))?;
                let fits = match self {
                    Self::Int8 => i8::try_from(v).is_ok(),
                    Self::Int16 => i16::try_from(v).is_ok(),
                    Self::Int32 => i32::try_from(v).is_ok(),
                    _ => true,
                };
                fits.then_some(Value::Int(v))
                    .ok_or_else(|| format!("{v} is out of range for {self}"))
            }
            (Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64, raw) => {
                let v = json_integer::<u64>(raw).ok_or_else(|| self.mismatch(raw))?;
                let fits = match self {
                    Self::UInt8 => u8::try_from(v).is_ok(),
                    Self::UInt16 => u16::try_from(v).is_ok(),
                    Self::UInt32 => u32::try_from(v).is_ok(),
                    _ => true,
                };
                fits.then_some(Value::UInt(v))
                    .ok_or_else(|| format!("{v} is out of range for {self}"))
            }
            (Self::WideInt(_) | Self::Decimal { .. }, Json::Number(n)) => {
                Ok(Value::String(n.to_string()))
            }
            (Self::WideInt(_) | Self::Decimal { .. }, Json::String(s)) => {
                Ok(Value::String(s.clone()))
            }
            (Self::Float32 | Self::Float64, Json::Number(n)) => {
                n.as_f64().map(Value::Float).ok_or_else(|| self.mismatch(raw))
            }
            (Self::Float32 | Self::Float64, Json::String(s)) => {
                parse_float(s).map(Value::Float).ok_or_else(|| self.mismatch(raw))
            }
            (Self::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (
                Self::String
                | Self::FixedString(_)
                | Self::Uuid
                | Self::Ipv4
                | Self::Ipv6
                | Self::Enum(_),
                Json::String(s),
            ) => Ok(Value::String(s.clone())),
            (Self::Date | Self::Date32, Json::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| self.mismatch(raw)),
            (Self::DateTime { .. } | Self::DateTime64 { .. }, Json::String(s)) => {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .map(Value::DateTime)
                    .map_err(|_| self.mismatch(raw))
            }
            (Self::Array(inner), Json::Array(items)) => items
                .iter()
                .map(|item| inner.read_json(item))
                .collect::<std::result::Result<_, _>>()
                .map(Value::Array),
            (Self::Tuple(elements), Json::Array(items)) => {
                if elements.len() != items.len() {
                    return Err(format!(
                        "expected {} tuple elements, got {}",
                        elements.len(),
                        items.len()
                    ));
                }
                elements
                    .iter()
                    .zip(items)
                    .map(|((_, ty), item)| ty.read_json(item))
                    .collect::<std::result::Result<_, _>>()
                    .map(Value::Tuple)
            }
            // Named tuples may be written as objects.
            (Self::Tuple(elements), Json::Object(fields)) => elements
                .iter()
                .map(|(name, ty)| {
                    let field = name
                        .as_deref()
                        .and_then(|name| fields.get(name))
                        .ok_or_else(|| self.mismatch(raw))?;
                    ty.read_json(field)
                })
                .collect::<std::result::Result<_, _>>()
                .map(Value::Tuple),
            (Self::Map(key, value), Json::Object(fields)) => fields
                .iter()
                .map(|(k, v)| {
                    let k = key.read_json(&Json::String(k.clone()))?;
                    Ok((k, value.read_json(v)?))
                })
                .collect::<std::result::Result<_, String>>()
                .map(Value::Map),
            (Self::Other(_), Json::String(s)) => Ok(Value::String(s.clone())),
            (Self::Other(_), other) => Ok(Value::String(other.to_string())),
            _ => Err(self.mismatch(raw)),
        }
    }

    fn mismatch(&self, raw: &serde_json::Value) -> String {
        format!("expected {self}, got {raw}")
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => write!(f, "Int8"),
            Self::Int16 => write!(f, "Int16"),
            Self::Int32 => write!(f, "Int32"),
            Self::Int64 => write!(f, "Int64"),
            Self::UInt8 => write!(f, "UInt8"),
            Self::UInt16 => write!(f, "UInt16"),
            Self::UInt32 => write!(f, "UInt32"),
            Self::UInt64 => write!(f, "UInt64"),
            Self::WideInt(name) | Self::Enum(name) | Self::Other(name) => write!(f, "{name}"),
            Self::Float32 => write!(f, "Float32"),
            Self::Float64 => write!(f, "Float64"),
            Self::Decimal { precision, scale } => write!(f, "Decimal({precision}, {scale})"),
            Self::Bool => write!(f, "Bool"),
            Self::String => write!(f, "String"),
            Self::FixedString(n) => write!(f, "FixedString({n})"),
            Self::Uuid => write!(f, "UUID"),
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
            Self::Date => write!(f, "Date"),
            Self::Date32 => write!(f, "Date32"),
            Self::DateTime { timezone: None } => write!(f, "DateTime"),
            Self::DateTime { timezone: Some(tz) } => write!(f, "DateTime('{tz}')"),
            Self::DateTime64 {
                precision,
                timezone: None,
            } => write!(f, "DateTime64({precision})"),
            Self::DateTime64 {
                precision,
                timezone: Some(tz),
            } => write!(f, "DateTime64({precision}, '{tz}')"),
            Self::Nullable(inner) => write!(f, "Nullable({inner})"),
            Self::Array(inner) => write!(f, "Array({inner})"),
            Self::Tuple(elements) => {
                let inner = elements
                    .iter()
                    .map(|(name, ty)| match name {
                        Some(name) => format!("{name} {ty}"),
                        None => ty.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "Tuple({inner})")
            }
            Self::Map(key, value) => write!(f, "Map({key}, {value})"),
        }
    }
}

/// Splits `Name(args)` into the name and the raw argument text.
fn split_call(type_name: &str) -> Result<(&str, Option<&str>)> {
    let Some(open) = type_name.find('(') else {
        return Ok((type_name, None));
    };
    if !type_name.ends_with(')') {
        return Err(ScopeError::decode(format!(
            "Unbalanced parentheses in type: {type_name}"
        )));
    }
    let name = type_name[..open].trim();
    let args = &type_name[open + 1..type_name.len() - 1];
    Ok((name, Some(args)))
}

/// Splits an argument list on top-level commas, honouring nesting and quotes.
fn split_args(args: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in args.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    ScopeError::decode(format!("Unbalanced parentheses in type arguments: {args}"))
                })?
            }
            ',' if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 || in_quote {
        return Err(ScopeError::decode(format!(
            "Unterminated type arguments: {args}"
        )));
    }
    parts.push(args[start..].trim());
    Ok(parts)
}

/// Parses `name Type` or `Type` inside a Tuple.
fn parse_tuple_element(element: &str) -> Result<(Option<String>, ColumnType)> {
    let paren = element.find('(').unwrap_or(element.len());
    match element.find(' ') {
        Some(space) if space < paren => {
            let name = element[..space].trim_matches('`').to_string();
            Ok((Some(name), ColumnType::parse(&element[space + 1..])?))
        }
        _ => Ok((None, ColumnType::parse(element)?)),
    }
}

fn parse_number<T: std::str::FromStr>(type_name: &str, arg: Option<&str>) -> Result<T> {
    arg.and_then(|a| a.trim().parse().ok())
        .ok_or_else(|| ScopeError::decode(format!("Invalid numeric argument in type: {type_name}")))
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('\'').to_string()
}

fn json_integer<T>(raw: &serde_json::Value) -> Option<T>
where
    T: std::str::FromStr + TryFrom<i64> + TryFrom<u64>,
{
    match raw {
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|v| <T as TryFrom<i64>>::try_from(v).ok())
            .or_else(|| {
                n.as_u64()
                    .and_then(|v| <T as TryFrom<u64>>::try_from(v).ok())
            }),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "nan" | "-nan" => Some(f64::NAN),
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}
