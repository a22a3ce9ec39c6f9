//! Database-agnostic type mappings.
//!
//! # Architecture
//!
//! Column decoding uses a two-phase approach:
//! 1. `TypeCategory` classifies native column types into logical categories
//! 2. Database-specific decoders turn the column into a [`DbValue`]
//!
//! The reverse direction, abstract [`DbType`] to native output type name, lives here
//! too so each engine keeps its whole type table in one place.

use crate::models::{DbType, DbValue, Engine};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, engine: Engine) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if engine == Engine::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Temporal types before integers: "interval" and "point" contain "int"
    match lower.as_str() {
        "timestamptz" => return TypeCategory::TimestampTz,
        // MySQL TIMESTAMP is stored in UTC
        "timestamp" if engine == Engine::MySQL => return TypeCategory::TimestampTz,
        "timestamp" | "datetime" => return TypeCategory::Timestamp,
        "date" => return TypeCategory::Date,
        "time" => return TypeCategory::Time,
        "interval" | "point" | "timetz" => return TypeCategory::Unknown,
        _ => {}
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Integer types
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    // UUID (PostgreSQL)
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Output Type Mapping
// =============================================================================

/// Native type name used for output parameters and typed NULL casts.
///
/// Total: types an engine has no closer match for fall back to its generic
/// variable-length string type.
pub fn native_output_type(engine: Engine, db_type: DbType) -> &'static str {
    match engine {
        Engine::PostgreSQL => match db_type {
            DbType::Boolean => "boolean",
            DbType::TinyInt | DbType::SmallInt => "smallint",
            DbType::Int => "integer",
            DbType::BigInt => "bigint",
            DbType::Decimal | DbType::Money => "numeric",
            DbType::Real => "real",
            DbType::Float => "double precision",
            DbType::Char | DbType::NChar => "bpchar",
            DbType::Text | DbType::NText => "text",
            DbType::Binary | DbType::VarBinary | DbType::Image => "bytea",
            DbType::Date => "date",
            DbType::Time => "time",
            DbType::DateTime | DbType::DateTime2 | DbType::SmallDateTime | DbType::Timestamp => {
                "timestamp"
            }
            DbType::DateTimeOffset => "timestamptz",
            DbType::Guid => "uuid",
            DbType::Json => "jsonb",
            DbType::Xml => "xml",
            _ => "varchar",
        },
        // CAST targets for reading back session variables
        Engine::MySQL => match db_type {
            DbType::Boolean
            | DbType::TinyInt
            | DbType::SmallInt
            | DbType::Int
            | DbType::BigInt => "SIGNED",
            DbType::Decimal | DbType::Money => "DECIMAL(65,30)",
            DbType::Real | DbType::Float => "DOUBLE",
            DbType::Binary | DbType::VarBinary | DbType::Image => "BINARY",
            DbType::Date => "DATE",
            DbType::Time => "TIME",
            DbType::DateTime
            | DbType::DateTime2
            | DbType::SmallDateTime
            | DbType::Timestamp
            | DbType::DateTimeOffset => "DATETIME(6)",
            DbType::Json => "JSON",
            _ => "CHAR",
        },
        Engine::SQLite => match db_type {
            DbType::Boolean
            | DbType::TinyInt
            | DbType::SmallInt
            | DbType::Int
            | DbType::BigInt => "INTEGER",
            DbType::Real | DbType::Float => "REAL",
            DbType::Decimal | DbType::Money => "NUMERIC",
            DbType::Binary | DbType::VarBinary | DbType::Image => "BLOB",
            _ => "TEXT",
        },
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

// Prepared statements return NUMERIC in binary form, simple queries in text form.
impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            sqlx::postgres::PgValueFormat::Text => {
                let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
                Ok(RawDecimal(s.to_string()))
            }
            sqlx::postgres::PgValueFormat::Binary => {
                let bytes = <&[u8] as Decode<sqlx::Postgres>>::decode(value)?;
                Ok(RawDecimal(pg_numeric_to_string(bytes)?))
            }
        }
    }
}

/// Render the binary NUMERIC wire format as decimal text.
fn pg_numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    if bytes.len() < 8 {
        return Err("NUMERIC value too short".into());
    }
    let read = |i: usize| i16::from_be_bytes([bytes[i], bytes[i + 1]]);
    let ndigits = read(0).max(0) as usize;
    let weight = read(2) as i32;
    let sign = read(4) as u16;
    let dscale = read(6).max(0) as usize;

    if sign == 0xC000 {
        return Ok("NaN".to_string());
    }
    if bytes.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|d| read(8 + d * 2)).collect();

    let mut int_part = String::new();
    for pos in 0..=weight.max(-1) {
        let digit = digits.get(pos as usize).copied().unwrap_or(0);
        if int_part.is_empty() {
            if digit != 0 {
                int_part.push_str(&digit.to_string());
            }
        } else {
            int_part.push_str(&format!("{:04}", digit));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut frac_part = String::new();
    let mut pos = weight + 1;
    while frac_part.len() < dscale {
        let digit = if pos < 0 {
            0
        } else {
            digits.get(pos as usize).copied().unwrap_or(0)
        };
        frac_part.push_str(&format!("{:04}", digit));
        pos += 1;
    }
    frac_part.truncate(dscale);

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    out.push_str(&int_part);
    if dscale > 0 {
        out.push('.');
        out.push_str(&frac_part);
    }
    Ok(out)
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Name and native type of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

/// Convert engine rows into engine-independent values.
pub trait RowToValues {
    fn to_values(&self) -> Vec<DbValue>;
    fn column_info(&self) -> Vec<ColumnInfo>;
}

macro_rules! impl_row_to_values {
    ($row:ty, $engine:expr, $decoder:path) => {
        impl RowToValues for $row {
            fn to_values(&self) -> Vec<DbValue> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $engine);
                        $decoder(self, idx, type_name, category)
                    })
                    .collect()
            }

            fn column_info(&self) -> Vec<ColumnInfo> {
                self.columns()
                    .iter()
                    .map(|col| ColumnInfo {
                        name: col.name().to_string(),
                        type_name: col.type_info().name().to_string(),
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_values!(MySqlRow, Engine::MySQL, mysql::decode_column);
impl_row_to_values!(PgRow, Engine::PostgreSQL, postgres::decode_column);
impl_row_to_values!(SqliteRow, Engine::SQLite, sqlite::decode_column);

fn is_null_at<R: Row>(row: &R, idx: usize) -> bool
where
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

fn undecodable(idx: usize, type_name: &str) -> DbValue {
    tracing::warn!(column = idx, type_name = %type_name, "Unsupported column type, returning NULL");
    DbValue::Null
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbValue {
        if is_null_at(row, idx) {
            return DbValue::Null;
        }
        let value = match category {
            TypeCategory::Decimal => row
                .try_get::<RawDecimal, _>(idx)
                .ok()
                .map(|v| DbValue::Decimal(v.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(DbValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(DbValue::Bytes),
            TypeCategory::Json => row
                .try_get::<serde_json::Value, _>(idx)
                .ok()
                .map(DbValue::Json),
            TypeCategory::Date => row.try_get(idx).ok().map(DbValue::Date),
            TypeCategory::Time => row.try_get(idx).ok().map(DbValue::Time),
            TypeCategory::Timestamp => row.try_get(idx).ok().map(DbValue::Timestamp),
            TypeCategory::TimestampTz => row.try_get(idx).ok().map(DbValue::TimestampTz),
            _ => None,
        };
        value
            .or_else(|| decode_text(row, idx))
            .unwrap_or_else(|| undecodable(idx, type_name))
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<DbValue> {
        // Try signed types
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(DbValue::Int(v));
        }
        // Try unsigned types
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        row.try_get::<u64, _>(idx).ok().map(DbValue::from)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Option<DbValue> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(DbValue::Float(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| DbValue::Float(v.into()))
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Option<DbValue> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(DbValue::Text(v));
        }
        // VARBINARY-backed text such as CAST(@var AS CHAR) on some servers
        row.try_get::<Vec<u8>, _>(idx).ok().map(|bytes| {
            match String::from_utf8(bytes) {
                Ok(s) => DbValue::Text(s),
                Err(e) => DbValue::Bytes(e.into_bytes()),
            }
        })
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbValue {
        if is_null_at(row, idx) {
            return DbValue::Null;
        }
        let value = match category {
            TypeCategory::Decimal => row
                .try_get::<RawDecimal, _>(idx)
                .ok()
                .map(|v| DbValue::Decimal(v.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(DbValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(DbValue::Bytes),
            TypeCategory::Json => row
                .try_get::<serde_json::Value, _>(idx)
                .ok()
                .map(DbValue::Json),
            TypeCategory::Uuid => row.try_get::<uuid::Uuid, _>(idx).ok().map(DbValue::Uuid),
            TypeCategory::Date => row.try_get(idx).ok().map(DbValue::Date),
            TypeCategory::Time => row.try_get(idx).ok().map(DbValue::Time),
            TypeCategory::Timestamp => row.try_get(idx).ok().map(DbValue::Timestamp),
            TypeCategory::TimestampTz => row.try_get(idx).ok().map(DbValue::TimestampTz),
            _ => None,
        };
        value
            .or_else(|| row.try_get::<String, _>(idx).ok().map(DbValue::Text))
            .unwrap_or_else(|| undecodable(idx, type_name))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<DbValue> {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(DbValue::Int(v.into()));
        }
        row.try_get::<i64, _>(idx).ok().map(DbValue::Int)
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<DbValue> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(DbValue::Float(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| DbValue::Float(v.into()))
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbValue {
        if is_null_at(row, idx) {
            return DbValue::Null;
        }
        let value = match category {
            TypeCategory::Integer => row.try_get::<i64, _>(idx).ok().map(DbValue::Int),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(DbValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => {
                row.try_get::<f64, _>(idx).ok().map(DbValue::Float)
            }
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(DbValue::Bytes),
            TypeCategory::Date => row.try_get(idx).ok().map(DbValue::Date),
            TypeCategory::Time => row.try_get(idx).ok().map(DbValue::Time),
            TypeCategory::Timestamp => row.try_get(idx).ok().map(DbValue::Timestamp),
            TypeCategory::TimestampTz => row.try_get(idx).ok().map(DbValue::TimestampTz),
            TypeCategory::Json => row
                .try_get::<String, _>(idx)
                .ok()
                .map(|s| match serde_json::from_str(&s) {
                    Ok(json) => DbValue::Json(json),
                    Err(_) => DbValue::Text(s),
                }),
            _ => None,
        };
        // SQLite columns are dynamically typed: fall back on the stored value
        value
            .or_else(|| decode_dynamic(row, idx))
            .unwrap_or_else(|| undecodable(idx, type_name))
    }

    fn decode_dynamic(row: &SqliteRow, idx: usize) -> Option<DbValue> {
        let storage = row
            .try_get_raw(idx)
            .ok()
            .map(|v| v.type_info().name().to_uppercase())?;
        match storage.as_str() {
            "INTEGER" => row.try_get::<i64, _>(idx).ok().map(DbValue::Int),
            "REAL" => row.try_get::<f64, _>(idx).ok().map(DbValue::Float),
            "BLOB" => row.try_get::<Vec<u8>, _>(idx).ok().map(DbValue::Bytes),
            _ => row.try_get::<String, _>(idx).ok().map(DbValue::Text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT", Engine::MySQL), TypeCategory::Integer);
        assert_eq!(
            categorize_type("BIGINT", Engine::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("TINYINT", Engine::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", Engine::PostgreSQL),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", Engine::MySQL),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", Engine::PostgreSQL),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", Engine::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", Engine::PostgreSQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("TIMESTAMP", Engine::PostgreSQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("TIMESTAMP", Engine::MySQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("DATETIME", Engine::SQLite),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("INTERVAL", Engine::PostgreSQL),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_json_and_text() {
        assert_eq!(
            categorize_type("jsonb", Engine::PostgreSQL),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("VARCHAR", Engine::MySQL),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("BOOLEAN", Engine::MySQL),
            TypeCategory::Boolean
        );
    }

    #[test]
    fn test_native_output_type_is_total() {
        assert_eq!(native_output_type(Engine::PostgreSQL, DbType::Int), "integer");
        assert_eq!(native_output_type(Engine::PostgreSQL, DbType::Variant), "varchar");
        assert_eq!(native_output_type(Engine::MySQL, DbType::BigInt), "SIGNED");
        assert_eq!(native_output_type(Engine::MySQL, DbType::Xml), "CHAR");
        assert_eq!(native_output_type(Engine::SQLite, DbType::Guid), "TEXT");
    }

    #[test]
    fn test_pg_numeric_binary_decoding() {
        // 12345.678: ndigits=3, weight=1, sign=+, dscale=3, digits [1, 2345, 6780]
        let bytes = [0, 3, 0, 1, 0, 0, 0, 3, 0, 1, 0x09, 0x29, 0x1A, 0x7C];
        assert_eq!(pg_numeric_to_string(&bytes).unwrap(), "12345.678");

        // -0.05: ndigits=1, weight=-1, sign=-, dscale=2, digits [500]
        let bytes = [0, 1, 0xFF, 0xFF, 0x40, 0, 0, 2, 0x01, 0xF4];
        assert_eq!(pg_numeric_to_string(&bytes).unwrap(), "-0.05");

        // 0 with scale 0: no digits
        let bytes = [0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(pg_numeric_to_string(&bytes).unwrap(), "0");
    }
}
