//! Engine-independent values.
//!
//! [`DbValue`] is what every engine adapter decodes native columns into and what
//! parameters carry into the engine. [`FromDbValue`] converts a value into the type a
//! caller asked for, following the conversion rules used by scalar results and row
//! readers alike:
//!
//! - a NULL source converts to [`FromDbValue::from_null`] (the type's default, or
//!   `None` for `Option<T>`);
//! - numeric, boolean and textual values convert between each other when the value
//!   fits the target;
//! - anything else is a conversion error carrying a human readable message.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A single value read from or sent to a database engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DbValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Unsigned values that do not fit an `i64` (MySQL `BIGINT UNSIGNED`)
    UInt(u64),
    Float(f64),
    /// Exact numeric kept in its database text representation
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl DbValue {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Uuid(_) => "uuid",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
        }
    }

    /// Render the value as JSON. Binary data is base64 encoded.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::Number((*v).into()),
            Self::UInt(v) => JsonValue::Number((*v).into()),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Decimal(v) | Self::Text(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            Self::Json(v) => v.clone(),
            Self::Uuid(v) => JsonValue::String(v.to_string()),
            Self::Date(v) => JsonValue::String(v.to_string()),
            Self::Time(v) => JsonValue::String(v.to_string()),
            Self::Timestamp(v) => JsonValue::String(v.to_string()),
            Self::TimestampTz(v) => JsonValue::String(v.to_rfc3339()),
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Decimal(s) => Some(s.trim()),
            _ => None,
        }
    }
}

impl std::fmt::Display for DbValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Decimal(v) | Self::Text(v) => write!(f, "{}", v),
            Self::Bytes(v) => match std::str::from_utf8(v) {
                Ok(s) => write!(f, "{}", s),
                Err(_) => write!(f, "{}", STANDARD.encode(v)),
            },
            Self::Json(v) => write!(f, "{}", v),
            Self::Uuid(v) => write!(f, "{}", v),
            Self::Date(v) => write!(f, "{}", v),
            Self::Time(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v),
            Self::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

macro_rules! impl_from_for_db_value {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for DbValue {
                fn from(v: $ty) -> Self {
                    DbValue::$variant(v.into())
                }
            }
        )+
    };
}

impl_from_for_db_value! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    JsonValue => Json,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
}

impl From<u64> for DbValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => DbValue::Int(i),
            Err(_) => DbValue::UInt(v),
        }
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DbValue::Null)
    }
}

/// Conversion from a [`DbValue`] into a caller-requested type.
pub trait FromDbValue: Sized {
    /// Value produced when the source is NULL or absent.
    fn from_null() -> Self;

    /// Convert a non-NULL value.
    fn from_non_null(value: &DbValue) -> Result<Self, String>;

    fn from_db_value(value: &DbValue) -> Result<Self, String> {
        if value.is_null() {
            Ok(Self::from_null())
        } else {
            Self::from_non_null(value)
        }
    }
}

fn mismatch(value: &DbValue, target: &str) -> String {
    format!("cannot convert {} value '{}' to {}", value.type_name(), value, target)
}

fn to_i128(value: &DbValue, target: &str) -> Result<i128, String> {
    match value {
        DbValue::Int(v) => Ok(*v as i128),
        DbValue::UInt(v) => Ok(*v as i128),
        DbValue::Bool(v) => Ok(*v as i128),
        DbValue::Float(v) if v.is_finite() => Ok(v.round() as i128),
        _ => match value.as_text() {
            Some(s) => s
                .parse::<i128>()
                .or_else(|_| s.parse::<f64>().map(|f| f.round() as i128))
                .map_err(|_| mismatch(value, target)),
            None => Err(mismatch(value, target)),
        },
    }
}

macro_rules! impl_from_db_value_int {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FromDbValue for $ty {
                fn from_null() -> Self {
                    0
                }

                fn from_non_null(value: &DbValue) -> Result<Self, String> {
                    let wide = to_i128(value, stringify!($ty))?;
                    <$ty>::try_from(wide).map_err(|_| {
                        format!("value {} is out of range for {}", wide, stringify!($ty))
                    })
                }
            }
        )+
    };
}

impl_from_db_value_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl FromDbValue for f64 {
    fn from_null() -> Self {
        0.0
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Float(v) => Ok(*v),
            DbValue::Int(v) => Ok(*v as f64),
            DbValue::UInt(v) => Ok(*v as f64),
            DbValue::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            _ => value
                .as_text()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| mismatch(value, "f64")),
        }
    }
}

impl FromDbValue for f32 {
    fn from_null() -> Self {
        0.0
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        f64::from_non_null(value).map(|v| v as f32)
    }
}

impl FromDbValue for bool {
    fn from_null() -> Self {
        false
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Bool(v) => Ok(*v),
            DbValue::Int(v) => Ok(*v != 0),
            DbValue::UInt(v) => Ok(*v != 0),
            DbValue::Float(v) => Ok(*v != 0.0),
            _ => match value.as_text().map(|s| s.to_ascii_lowercase()) {
                Some(s) if matches!(s.as_str(), "true" | "t" | "yes" | "y" | "1") => Ok(true),
                Some(s) if matches!(s.as_str(), "false" | "f" | "no" | "n" | "0") => Ok(false),
                _ => Err(mismatch(value, "bool")),
            },
        }
    }
}

impl FromDbValue for String {
    fn from_null() -> Self {
        String::new()
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        Ok(value.to_string())
    }
}

impl FromDbValue for Vec<u8> {
    fn from_null() -> Self {
        Vec::new()
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Bytes(v) => Ok(v.clone()),
            DbValue::Text(s) => Ok(s.as_bytes().to_vec()),
            DbValue::Uuid(u) => Ok(u.as_bytes().to_vec()),
            _ => Err(mismatch(value, "bytes")),
        }
    }
}

impl FromDbValue for Uuid {
    fn from_null() -> Self {
        Uuid::nil()
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Uuid(u) => Ok(*u),
            DbValue::Text(s) => Uuid::parse_str(s.trim()).map_err(|_| mismatch(value, "uuid")),
            DbValue::Bytes(b) => Uuid::from_slice(b).map_err(|_| mismatch(value, "uuid")),
            _ => Err(mismatch(value, "uuid")),
        }
    }
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl FromDbValue for NaiveDateTime {
    fn from_null() -> Self {
        NaiveDateTime::default()
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Timestamp(v) => Ok(*v),
            DbValue::TimestampTz(v) => Ok(v.naive_utc()),
            DbValue::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            DbValue::Text(s) => {
                parse_naive_datetime(s.trim()).ok_or_else(|| mismatch(value, "timestamp"))
            }
            _ => Err(mismatch(value, "timestamp")),
        }
    }
}

impl FromDbValue for DateTime<Utc> {
    fn from_null() -> Self {
        DateTime::<Utc>::default()
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::TimestampTz(v) => Ok(*v),
            DbValue::Timestamp(v) => Ok(v.and_utc()),
            DbValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_naive_datetime(s.trim()).map(|n| n.and_utc()))
                .ok_or_else(|| mismatch(value, "timestamptz")),
            _ => Err(mismatch(value, "timestamptz")),
        }
    }
}

impl FromDbValue for NaiveDate {
    fn from_null() -> Self {
        NaiveDate::default()
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Date(d) => Ok(*d),
            DbValue::Timestamp(v) => Ok(v.date()),
            DbValue::TimestampTz(v) => Ok(v.date_naive()),
            DbValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| mismatch(value, "date")),
            _ => Err(mismatch(value, "date")),
        }
    }
}

impl FromDbValue for NaiveTime {
    fn from_null() -> Self {
        NaiveTime::MIN
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Time(t) => Ok(*t),
            DbValue::Timestamp(v) => Ok(v.time()),
            DbValue::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                .map_err(|_| mismatch(value, "time")),
            _ => Err(mismatch(value, "time")),
        }
    }
}

impl FromDbValue for JsonValue {
    fn from_null() -> Self {
        JsonValue::Null
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        match value {
            DbValue::Text(s) => Ok(serde_json::from_str(s).unwrap_or_else(|_| value.to_json())),
            _ => Ok(value.to_json()),
        }
    }
}

impl FromDbValue for DbValue {
    fn from_null() -> Self {
        DbValue::Null
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        Ok(value.clone())
    }
}

/// Nullable targets yield `None` for NULL instead of the inner type's default.
impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_null() -> Self {
        None
    }

    fn from_non_null(value: &DbValue) -> Result<Self, String> {
        T::from_non_null(value).map(Some)
    }
}
