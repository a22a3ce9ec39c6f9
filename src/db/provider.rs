//! The per-engine provider contract and the registry that selects a provider by
//! engine name.
//!
//! A [`ConnectionProvider`] belongs to exactly one repository. It knows how to open a
//! physical connection and how to translate a [`Command`] into engine SQL. The
//! connection it opens ([`EngineConnection`]) runs bound commands and hands back fully
//! materialized results; everything above this module works only with these two
//! traits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::binding::{BoundCommand, BoundStatement, OutputCapture};
use super::types::{ColumnInfo, RowToValues};
use crate::config::PoolOptions;
use crate::error::{DalError, DalResult};
use crate::models::{Command, DbType, DbValue, Engine, OutputValues};

/// One result set produced by a command.
#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<DbValue>>,
    /// Failure raised by the engine after this set had started streaming
    pub error: Option<DalError>,
}

/// Everything a command produced.
#[derive(Debug, Default)]
pub struct RawOutcome {
    pub sets: Vec<ResultSet>,
    pub rows_affected: u64,
    pub outputs: OutputValues,
}

impl RawOutcome {
    /// First column of the first row of the first set.
    pub fn first_value(&self) -> Option<&DbValue> {
        self.sets
            .first()
            .and_then(|set| set.rows.first())
            .and_then(|row| row.first())
    }

    /// Take the first mid-stream error, if any set carries one.
    pub fn take_error(&mut self) -> Option<DalError> {
        self.sets.iter_mut().find_map(|set| set.error.take())
    }
}

/// Extract output values from the first row of `set`, matching columns to parameter
/// names case-insensitively and falling back to column position.
pub fn outputs_from_row(set: &ResultSet, parameters: &[String]) -> OutputValues {
    let mut outputs = OutputValues::new();
    let Some(row) = set.rows.first() else {
        return outputs;
    };
    for (position, name) in parameters.iter().enumerate() {
        let by_name = set
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name));
        if let Some(value) = by_name.or(Some(position)).and_then(|idx| row.get(idx)) {
            outputs.insert(name.clone(), value.clone());
        }
    }
    outputs
}

/// Groups streamed rows into result sets.
///
/// A set starts with its first row and ends at the statement's completion marker.
/// Statements that return no rows do not produce a set.
#[derive(Debug, Default)]
pub(crate) struct SetCollector {
    sets: Vec<ResultSet>,
    current: Option<ResultSet>,
    rows_affected: u64,
}

impl SetCollector {
    pub fn row<R: RowToValues>(&mut self, row: &R) {
        let set = self.current.get_or_insert_with(|| ResultSet {
            columns: row.column_info(),
            ..Default::default()
        });
        set.rows.push(row.to_values());
    }

    pub fn done(&mut self, rows_affected: u64) {
        self.rows_affected += rows_affected;
        if let Some(set) = self.current.take() {
            self.sets.push(set);
        }
    }

    /// Record an engine failure. Fails outright when nothing was produced yet,
    /// otherwise the error travels with the set being read.
    pub fn fail(&mut self, err: DalError) -> DalResult<()> {
        if self.current.is_none() && self.sets.is_empty() {
            return Err(err);
        }
        let mut set = self.current.take().unwrap_or_default();
        set.error = Some(err);
        self.sets.push(set);
        Ok(())
    }

    pub fn finish(mut self) -> RawOutcome {
        if let Some(set) = self.current.take() {
            self.sets.push(set);
        }
        RawOutcome {
            sets: self.sets,
            rows_affected: self.rows_affected,
            outputs: OutputValues::new(),
        }
    }
}

/// Runs single statements on an engine connection.
#[async_trait]
pub(crate) trait StatementRunner: Send {
    async fn fetch(&mut self, statement: &BoundStatement) -> DalResult<RawOutcome>;
}

/// Run setup statements, the main statement and the output capture in order.
pub(crate) async fn run_bound<R>(runner: &mut R, command: &BoundCommand) -> DalResult<RawOutcome>
where
    R: StatementRunner + ?Sized,
{
    for statement in &command.setup {
        if let Some(err) = runner.fetch(statement).await?.take_error() {
            return Err(err);
        }
    }

    let mut outcome = runner.fetch(&command.main).await?;

    match &command.outputs {
        OutputCapture::None => {}
        OutputCapture::MainRow { parameters } => {
            if !outcome.sets.is_empty() {
                let set = outcome.sets.remove(0);
                if let Some(err) = set.error {
                    return Err(err);
                }
                outcome.outputs = outputs_from_row(&set, parameters);
            }
        }
        OutputCapture::Readback {
            statement,
            parameters,
        } => {
            let mut readback = runner.fetch(statement).await?;
            if let Some(err) = readback.take_error() {
                return Err(err);
            }
            if let Some(set) = readback.sets.first() {
                outcome.outputs = outputs_from_row(set, parameters);
            }
        }
    }
    Ok(outcome)
}

/// An open physical connection.
///
/// Dropping a connection releases it to its pool. [`EngineConnection::discard`] is
/// for connections whose protocol state is unknown, e.g. after a timeout.
#[async_trait]
pub trait EngineConnection: Send {
    async fn begin(&mut self) -> DalResult<()>;
    async fn commit(&mut self) -> DalResult<()>;
    async fn rollback(&mut self) -> DalResult<()>;

    /// Run a bound command and materialize every result set.
    ///
    /// An engine error before anything was produced is returned as `Err`; an error
    /// after rows started arriving is attached to the set being read.
    async fn run(&mut self, command: &BoundCommand) -> DalResult<RawOutcome>;

    /// Return the connection to its pool.
    fn close(self: Box<Self>) -> DalResult<()>;

    /// Drop the connection without returning it to the pool.
    fn discard(self: Box<Self>);
}

/// Per-engine adapter bound to one repository.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + fmt::Debug {
    /// Display name of the engine, used in analytics.
    fn server_type(&self) -> &str;

    fn connection_string(&self) -> &str;

    /// Open a physical connection, applying the repository schema if any.
    async fn open(&self) -> DalResult<Box<dyn EngineConnection>>;

    /// Translate a command into engine SQL.
    fn bind(&self, command: &Command) -> DalResult<BoundCommand>;

    /// Native type for an abstract parameter type. Total: unknown types map to the
    /// engine's generic string type.
    fn native_output_type(&self, db_type: DbType) -> &'static str;

    /// Close any pooled connections.
    async fn shutdown(&self) {}
}

/// Settings a provider is constructed from.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub repository: String,
    pub connection_string: String,
    pub schema: Option<String>,
    pub pool: PoolOptions,
}

pub type ProviderFactory =
    Arc<dyn Fn(ProviderSettings) -> DalResult<Arc<dyn ConnectionProvider>> + Send + Sync>;

/// Engine name to provider constructor.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut engines: Vec<&String> = self.factories.keys().collect();
        engines.sort();
        f.debug_struct("ProviderRegistry")
            .field("engines", &engines)
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ProviderRegistry {
    /// A registry without any engines.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the PostgreSQL, MySQL and SQLite providers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Engine::PostgreSQL.key(), |settings| {
            Ok(Arc::new(super::postgres::PgProvider::new(settings)) as Arc<dyn ConnectionProvider>)
        });
        registry.register(Engine::MySQL.key(), |settings| {
            Ok(Arc::new(super::mysql::MySqlProvider::new(settings)) as Arc<dyn ConnectionProvider>)
        });
        registry.register(Engine::SQLite.key(), |settings| {
            Ok(Arc::new(super::sqlite::SqliteProvider::new(settings)) as Arc<dyn ConnectionProvider>)
        });
        registry
    }

    /// Register (or replace) the constructor for an engine name.
    pub fn register<F>(&mut self, engine: &str, factory: F)
    where
        F: Fn(ProviderSettings) -> DalResult<Arc<dyn ConnectionProvider>> + Send + Sync + 'static,
    {
        self.factories
            .insert(Self::normalize(engine), Arc::new(factory));
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.factories.contains_key(&Self::normalize(engine))
    }

    pub fn create(
        &self,
        engine: &str,
        settings: ProviderSettings,
    ) -> DalResult<Arc<dyn ConnectionProvider>> {
        let factory = self
            .factories
            .get(&Self::normalize(engine))
            .ok_or_else(|| DalError::unsupported_engine(engine))?;
        factory(settings)
    }

    fn normalize(engine: &str) -> String {
        Engine::from_name(engine)
            .map(|e| e.key().to_string())
            .unwrap_or_else(|| engine.trim().to_lowercase())
    }
}
