//! Engine-agnostic command model.
//!
//! A [`Command`] describes one SQL operation: its text, how the text is interpreted,
//! an optional timeout and an ordered set of named [`Parameter`]s. Parameter names are
//! stored without the `@` prefix used in command text and are unique within a command
//! (compared case-insensitively).
//!
//! Output values never reach a command behind its back: after execution the session
//! hands the engine-reported values to [`Command::store_outputs`], which only touches
//! parameters whose direction is not [`ParameterDirection::Input`].

use serde::{Deserialize, Serialize};

use super::value::{DbValue, FromDbValue};

/// How the command text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    #[default]
    Text,
    /// Text names a stored procedure
    StoredProcedure,
    /// Text names a table whose rows are all returned
    TableDirect,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::StoredProcedure => "StoredProcedure",
            Self::TableDirect => "TableDirect",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    /// True when the engine reports a value back for this parameter.
    pub fn is_output(&self) -> bool {
        !matches!(self, Self::Input)
    }

    /// True when the parameter's current value is sent to the engine.
    pub fn sends_value(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }
}

/// Abstract parameter data type. Each engine maps it to a native type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DbType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Decimal,
    Money,
    Real,
    Float,
    Char,
    NChar,
    #[default]
    VarChar,
    NVarChar,
    Text,
    NText,
    Binary,
    VarBinary,
    Image,
    Date,
    Time,
    DateTime,
    DateTime2,
    SmallDateTime,
    DateTimeOffset,
    Timestamp,
    Guid,
    Json,
    Xml,
    /// Any value; engines treat it as text
    Variant,
}

impl DbType {
    /// Infer a declared type from a value, for parameters created from plain values.
    pub fn infer(value: &DbValue) -> Self {
        match value {
            DbValue::Null | DbValue::Text(_) => Self::VarChar,
            DbValue::Bool(_) => Self::Boolean,
            DbValue::Int(_) | DbValue::UInt(_) => Self::BigInt,
            DbValue::Float(_) => Self::Float,
            DbValue::Decimal(_) => Self::Decimal,
            DbValue::Bytes(_) => Self::VarBinary,
            DbValue::Json(_) => Self::Json,
            DbValue::Uuid(_) => Self::Guid,
            DbValue::Date(_) => Self::Date,
            DbValue::Time(_) => Self::Time,
            DbValue::Timestamp(_) => Self::DateTime,
            DbValue::TimestampTz(_) => Self::DateTimeOffset,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Boolean | Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary | Self::VarBinary | Self::Image)
    }
}

/// One named parameter of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    pub direction: ParameterDirection,
    pub db_type: DbType,
    /// Declared size for variable-length types
    pub size: Option<u32>,
    pub value: DbValue,
}

impl Parameter {
    pub fn new(
        name: impl AsRef<str>,
        direction: ParameterDirection,
        db_type: DbType,
        value: impl Into<DbValue>,
    ) -> Self {
        Self {
            name: normalize_name(name.as_ref()),
            direction,
            db_type,
            size: None,
            value: value.into(),
        }
    }

    /// Input parameter whose type is inferred from the value.
    pub fn input(name: impl AsRef<str>, value: impl Into<DbValue>) -> Self {
        let value = value.into();
        let db_type = DbType::infer(&value);
        Self::new(name, ParameterDirection::Input, db_type, value)
    }

    pub fn output(name: impl AsRef<str>, db_type: DbType) -> Self {
        Self::new(name, ParameterDirection::Output, db_type, DbValue::Null)
    }

    pub fn input_output(name: impl AsRef<str>, db_type: DbType, value: impl Into<DbValue>) -> Self {
        Self::new(name, ParameterDirection::InputOutput, db_type, value)
    }

    pub fn return_value(name: impl AsRef<str>, db_type: DbType) -> Self {
        Self::new(name, ParameterDirection::ReturnValue, db_type, DbValue::Null)
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    /// Parameter name without any `@` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim_start_matches('@'))
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('@').to_string()
}

/// Values reported by the engine for output parameters, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputValues {
    values: Vec<(String, DbValue)>,
}

impl OutputValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: DbValue) {
        let name = name.into();
        match self
            .values
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, v)) => *v = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&DbValue> {
        let name = name.trim_start_matches('@');
        self.values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DbValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// One SQL operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub command_type: CommandType,
    /// Engine-level timeout; `None` uses the configured default
    pub timeout_secs: Option<u64>,
    parameters: Vec<Parameter>,
    retry_safe: bool,
}

impl Command {
    /// Create a plain SQL text command.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command_type: CommandType::Text,
            timeout_secs: None,
            parameters: Vec::new(),
            retry_safe: true,
        }
    }

    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self {
            command_type: CommandType::StoredProcedure,
            ..Self::new(name)
        }
    }

    pub fn table_direct(table: impl Into<String>) -> Self {
        Self {
            command_type: CommandType::TableDirect,
            ..Self::new(table)
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Add a parameter. A parameter with the same name is replaced in place.
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.add_parameter(parameter);
        self
    }

    /// Shorthand for an input parameter whose type is inferred from `value`.
    pub fn with_param(self, name: impl AsRef<str>, value: impl Into<DbValue>) -> Self {
        self.with_parameter(Parameter::input(name, value))
    }

    pub fn add_parameter(&mut self, parameter: Parameter) {
        match self
            .parameters
            .iter_mut()
            .find(|p| p.matches(parameter.name()))
        {
            Some(existing) => *existing = parameter,
            None => self.parameters.push(parameter),
        }
    }

    /// Mark the command as unsafe to re-run on another cluster member once it may
    /// have reached an engine.
    pub fn retry_unsafe(mut self) -> Self {
        self.retry_safe = false;
        self
    }

    pub fn is_retry_safe(&self) -> bool {
        self.retry_safe
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.matches(name))
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.matches(name))
    }

    /// Current value of a parameter converted to `T`.
    pub fn value<T: FromDbValue>(&self, name: &str) -> Result<T, String> {
        match self.parameter(name) {
            Some(p) => T::from_db_value(&p.value),
            None => Err(format!("unknown parameter '{}'", name)),
        }
    }

    pub fn has_outputs(&self) -> bool {
        self.parameters.iter().any(|p| p.direction.is_output())
    }

    /// Copy engine-reported values into the matching output parameters.
    ///
    /// Input parameters are never touched, even when `outputs` carries their name.
    pub fn store_outputs(&mut self, outputs: &OutputValues) {
        for parameter in self
            .parameters
            .iter_mut()
            .filter(|p| p.direction.is_output())
        {
            if let Some(value) = outputs.get(&parameter.name) {
                parameter.value = value.clone();
            }
        }
    }

    /// Copy output parameter values from another instance of the same command.
    pub fn copy_outputs_from(&mut self, other: &Command) {
        let mut outputs = OutputValues::new();
        for p in other.parameters.iter().filter(|p| p.direction.is_output()) {
            outputs.insert(p.name.clone(), p.value.clone());
        }
        self.store_outputs(&outputs);
    }
}
