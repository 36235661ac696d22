//! Parameter and result values.
//!
//! Everything crosses the wire in text format. Results are decoded by type
//! OID: `bool` to [`Value::Bool`], `int2`/`int4`/`int8` to [`Value::Int`],
//! `float4`/`float8` to [`Value::Float`], anything else to [`Value::Text`].

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

/// A single parameter or column value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Decode a text-format column value according to its type OID.
    pub fn decode_text(type_oid: Oid, bytes: &[u8]) -> Result<Self> {
        let text = simdutf8::compat::from_utf8(bytes)
            .map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))?;

        match type_oid {
            oid::BOOL => match text {
                "t" | "true" => Ok(Value::Bool(true)),
                "f" | "false" => Ok(Value::Bool(false)),
                _ => Err(Error::Decode(format!("invalid boolean: {:?}", text))),
            },
            oid::INT2 | oid::INT4 | oid::INT8 => text
                .parse()
                .map(Value::Int)
                .map_err(|e| Error::Decode(format!("invalid integer {:?}: {}", text, e))),
            oid::FLOAT4 | oid::FLOAT8 => parse_float(text).map(Value::Float),
            _ => Ok(Value::Text(text.to_string())),
        }
    }

    /// Text encoding sent in a Bind message, `None` for NULL.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Bool(true) => Some(Cow::Borrowed("t")),
            Value::Bool(false) => Some(Cow::Borrowed("f")),
            Value::Int(v) => Some(Cow::Owned(v.to_string())),
            Value::Float(v) if v.is_nan() => Some(Cow::Borrowed("NaN")),
            Value::Float(v) if v.is_infinite() => Some(Cow::Borrowed(if *v > 0.0 {
                "Infinity"
            } else {
                "-Infinity"
            })),
            Value::Float(v) => Some(Cow::Owned(v.to_string())),
            Value::Text(s) => Some(Cow::Borrowed(s.as_str())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
        }
    }
}

fn parse_float(text: &str) -> Result<f64> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse()
            .map_err(|e| Error::Decode(format!("invalid float {:?}: {}", text, e))),
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Trait for reading a [`Value`] as a Rust type.
pub trait FromValue<'a>: Sized {
    /// Decode from NULL.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from a non-NULL value.
    fn from_value(value: &'a Value) -> Result<Self>;

    #[doc(hidden)]
    fn decode(value: &'a Value) -> Result<Self> {
        match value {
            Value::Null => Self::from_null(),
            v => Self::from_value(v),
        }
    }
}

fn mismatch<T>(expected: &str, value: &Value) -> Result<T> {
    Err(Error::Decode(format!(
        "cannot read {} value as {}",
        value.kind(),
        expected
    )))
}

impl<'a, T: FromValue<'a>> FromValue<'a> for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_value(value: &'a Value) -> Result<Self> {
        T::from_value(value).map(Some)
    }
}

impl FromValue<'_> for Value {
    fn from_null() -> Result<Self> {
        Ok(Value::Null)
    }

    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue<'_> for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(*v),
            v => mismatch("bool", v),
        }
    }
}

macro_rules! impl_from_value_int {
    ($($ty:ty),*) => {
        $(
            impl FromValue<'_> for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    match value {
                        Value::Int(v) => <$ty>::try_from(*v).map_err(|_| {
                            Error::Decode(format!("{} out of range for {}", v, stringify!($ty)))
                        }),
                        v => mismatch(stringify!($ty), v),
                    }
                }
            }
        )*
    };
}

impl_from_value_int!(i16, i32, i64);

impl FromValue<'_> for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            v => mismatch("f64", v),
        }
    }
}

impl FromValue<'_> for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue<'_> for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Null => mismatch("String", value),
            // numbers and booleans keep their wire spelling
            v => Ok(v.to_text().map(Cow::into_owned).unwrap_or_default()),
        }
    }
}

impl<'a> FromValue<'a> for &'a str {
    fn from_value(value: &'a Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.as_str()),
            v => mismatch("&str", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_by_oid() {
        assert_eq!(Value::decode_text(oid::BOOL, b"t").unwrap(), Value::Bool(true));
        assert_eq!(Value::decode_text(oid::INT8, b"-42").unwrap(), Value::Int(-42));
        assert_eq!(Value::decode_text(oid::FLOAT8, b"1.5").unwrap(), Value::Float(1.5));
        assert_eq!(
            Value::decode_text(oid::FLOAT4, b"-Infinity").unwrap(),
            Value::Float(f64::NEG_INFINITY)
        );
        // numeric (1700) stays text
        assert_eq!(
            Value::decode_text(1700, b"12.30").unwrap(),
            Value::Text("12.30".into())
        );
        assert!(Value::decode_text(oid::INT4, b"abc").is_err());
    }

    #[test]
    fn text_encoding() {
        assert_eq!(Value::Null.to_text(), None);
        assert_eq!(Value::from(true).to_text().as_deref(), Some("t"));
        assert_eq!(Value::from(7_i32).to_text().as_deref(), Some("7"));
        assert_eq!(Value::from(0.25).to_text().as_deref(), Some("0.25"));
        assert_eq!(Value::Float(f64::NAN).to_text().as_deref(), Some("NaN"));
        assert_eq!(Value::from("O'Brien").to_text().as_deref(), Some("O'Brien"));
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn typed_reads() {
        assert_eq!(i32::decode(&Value::Int(5)).unwrap(), 5);
        assert!(i16::decode(&Value::Int(70_000)).is_err());
        assert_eq!(Option::<i64>::decode(&Value::Null).unwrap(), None);
        assert!(i64::decode(&Value::Null).is_err());
        assert_eq!(String::decode(&Value::Int(3)).unwrap(), "3");
        assert_eq!(<&str>::decode(&Value::Text("x".into())).unwrap(), "x");
        assert!(bool::decode(&Value::Text("t".into())).is_err());
    }
}
