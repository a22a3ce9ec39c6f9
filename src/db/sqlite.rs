//! SQLite provider.
//!
//! SQLite has neither stored procedures nor output parameters; commands that need
//! either fail at binding time. Schemas are ignored since a database file is its own
//! namespace.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::binding::{BoundArg, BoundCommand, BoundStatement, Dialect, bind_text, quote_identifier};
use super::macros::impl_engine_connection;
use super::provider::{ConnectionProvider, EngineConnection, ProviderSettings};
use super::types::native_output_type;
use crate::error::{DalError, DalResult, Phase};
use crate::models::{Command, CommandType, DbType, Engine, FromDbValue};

const DIALECT: Dialect = Dialect {
    backslash_escapes: false,
    dollar_quotes: false,
    numbered_placeholders: true,
};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Debug)]
pub struct SqliteProvider {
    settings: ProviderSettings,
    pool: OnceCell<SqlitePool>,
}

impl SqliteProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> DalResult<&SqlitePool> {
        let repository = &self.settings.repository;
        self.pool
            .get_or_try_init(|| async {
                let opts = &self.settings.pool;
                let options = SqliteConnectOptions::from_str(&self.settings.connection_string)
                    .map_err(|e| {
                        DalError::connection_open(
                            repository,
                            format!("Invalid SQLite connection string: {}", e),
                            "Use sqlite:path/to/file.db or sqlite::memory:",
                        )
                    })?
                    .create_if_missing(true);

                let pool = SqlitePoolOptions::new()
                    .min_connections(opts.min_connections_or_default())
                    .max_connections(opts.max_connections_or_default(true))
                    .acquire_timeout(Duration::from_secs(opts.acquire_timeout_or_default()))
                    .idle_timeout(Some(Duration::from_secs(opts.idle_timeout_or_default())))
                    .test_before_acquire(opts.test_before_acquire_or_default())
                    .connect_with(options)
                    .await
                    .map_err(|e| DalError::from_sqlx(repository, Phase::Open, e))?;
                info!(repository = %repository, engine = "SQLite", "Created connection pool");
                Ok(pool)
            })
            .await
    }
}

#[async_trait]
impl ConnectionProvider for SqliteProvider {
    fn server_type(&self) -> &str {
        Engine::SQLite.display_name()
    }

    fn connection_string(&self) -> &str {
        &self.settings.connection_string
    }

    async fn open(&self) -> DalResult<Box<dyn EngineConnection>> {
        let repository = &self.settings.repository;
        let conn = self
            .pool()
            .await?
            .acquire()
            .await
            .map_err(|e| DalError::from_sqlx(repository, Phase::Open, e))?;
        debug!(repository = %repository, "Acquired SQLite connection");
        Ok(Box::new(SqliteEngineConnection::new(repository.clone(), conn)))
    }

    fn bind(&self, command: &Command) -> DalResult<BoundCommand> {
        let repository = &self.settings.repository;
        if let Some(p) = command.parameters().iter().find(|p| p.direction.is_output()) {
            return Err(DalError::command_binding(
                repository,
                format!(
                    "SQLite does not support {:?} parameters ('{}')",
                    p.direction,
                    p.name()
                ),
            ));
        }
        match command.command_type {
            CommandType::Text => Ok(BoundCommand::simple(bind_text(command, DIALECT, |pos, _| {
                format!("?{}", pos)
            }))),
            CommandType::TableDirect => Ok(BoundCommand::simple(BoundStatement::new(format!(
                "SELECT * FROM {}",
                quote_identifier(&command.text, '"')
            )))),
            CommandType::StoredProcedure => Err(DalError::command_binding(
                repository,
                "SQLite does not support stored procedures",
            )),
        }
    }

    fn native_output_type(&self, db_type: DbType) -> &'static str {
        native_output_type(Engine::SQLite, db_type)
    }

    async fn shutdown(&self) {
        if let Some(pool) = self.pool.get() {
            info!(repository = %self.settings.repository, "Closing connection pool");
            pool.close().await;
        }
    }
}

impl_engine_connection!(SqliteEngineConnection, Sqlite, bind_arg, begin = "BEGIN");

fn bind_arg<'q>(query: SqliteQuery<'q>, arg: &BoundArg) -> Result<SqliteQuery<'q>, String> {
    let v = &arg.value;
    Ok(match arg.db_type {
        DbType::Boolean => query.bind(Option::<bool>::from_db_value(v)?),
        DbType::TinyInt | DbType::SmallInt | DbType::Int | DbType::BigInt => {
            query.bind(Option::<i64>::from_db_value(v)?)
        }
        DbType::Real | DbType::Float => query.bind(Option::<f64>::from_db_value(v)?),
        DbType::Binary | DbType::VarBinary | DbType::Image => {
            query.bind(Option::<Vec<u8>>::from_db_value(v)?)
        }
        DbType::Date => query.bind(Option::<NaiveDate>::from_db_value(v)?),
        DbType::Time => query.bind(Option::<NaiveTime>::from_db_value(v)?),
        DbType::DateTime | DbType::DateTime2 | DbType::SmallDateTime | DbType::Timestamp => {
            query.bind(Option::<NaiveDateTime>::from_db_value(v)?)
        }
        DbType::DateTimeOffset => query.bind(Option::<DateTime<Utc>>::from_db_value(v)?),
        _ => query.bind(Option::<String>::from_db_value(v)?),
    })
}
