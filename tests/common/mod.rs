//! Shared fixtures for integration tests.
//!
//! `MockProvider` is a scripted engine registered under the name `mock`. Its
//! behaviour comes from the connection string:
//!
//! - `mock://healthy?value=7` answers every command with one row holding `7`
//! - `mock://fail-open` fails to open a connection
//! - `mock://fail-execute` opens, then fails every command
//! - `mock://slow?ms=1500` answers after the given delay
//! - `mock://fail-close?value=7` answers like `healthy`, then fails to close

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster_dal::db::binding::{BoundCommand, BoundStatement, OutputCapture};
use cluster_dal::db::observe::{AnalyticRecorder, CommandAnalyticInfo, ConnectionAnalyticInfo, ErrorReporter};
use cluster_dal::db::provider::{ConnectionProvider, EngineConnection, RawOutcome, ResultSet};
use cluster_dal::db::types::ColumnInfo;
use cluster_dal::{
    ClusterConfig, Command, DalError, DalResult, DataAccessConfig, DbType, DbValue,
    ProviderRegistry, RepositoryConfig,
};
use tempfile::NamedTempFile;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Mode {
    Healthy(i64),
    FailOpen,
    FailExecute,
    Slow(Duration, i64),
    FailClose(i64),
}

#[derive(Debug)]
pub struct MockProvider {
    repository: String,
    connection_string: String,
    mode: Mode,
}

impl MockProvider {
    pub fn new(repository: &str, connection_string: &str) -> Self {
        let url = url::Url::parse(connection_string).expect("mock url");
        let query = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.parse::<i64>().ok())
        };
        let mode = match url.host_str().unwrap_or_default() {
            "fail-open" => Mode::FailOpen,
            "fail-execute" => Mode::FailExecute,
            "fail-close" => Mode::FailClose(query("value").unwrap_or(1)),
            "slow" => Mode::Slow(
                Duration::from_millis(query("ms").unwrap_or(1000) as u64),
                query("value").unwrap_or(1),
            ),
            _ => Mode::Healthy(query("value").unwrap_or(1)),
        };
        Self {
            repository: repository.to_string(),
            connection_string: connection_string.to_string(),
            mode,
        }
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    fn server_type(&self) -> &str {
        "Mock"
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn open(&self) -> DalResult<Box<dyn EngineConnection>> {
        if matches!(self.mode, Mode::FailOpen) {
            return Err(DalError::connection_open(
                &self.repository,
                "connection refused",
                "Check that the server is running",
            ));
        }
        Ok(Box::new(MockConnection {
            repository: self.repository.clone(),
            mode: self.mode.clone(),
        }))
    }

    fn bind(&self, command: &Command) -> DalResult<BoundCommand> {
        let mut main = BoundStatement::new(command.text.clone());
        for p in command.parameters().iter().filter(|p| p.direction.sends_value()) {
            main = main.with_arg(p.value.clone(), p.db_type);
        }
        let outputs: Vec<String> = command
            .parameters()
            .iter()
            .filter(|p| p.direction.is_output())
            .map(|p| p.name().to_string())
            .collect();
        Ok(BoundCommand {
            setup: Vec::new(),
            main,
            outputs: if outputs.is_empty() {
                OutputCapture::None
            } else {
                OutputCapture::MainRow { parameters: outputs }
            },
        })
    }

    fn native_output_type(&self, _db_type: DbType) -> &'static str {
        "TEXT"
    }
}

struct MockConnection {
    repository: String,
    mode: Mode,
}

#[async_trait]
impl EngineConnection for MockConnection {
    async fn begin(&mut self) -> DalResult<()> {
        Ok(())
    }

    async fn commit(&mut self) -> DalResult<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> DalResult<()> {
        Ok(())
    }

    async fn run(&mut self, command: &BoundCommand) -> DalResult<RawOutcome> {
        let value = match self.mode {
            Mode::Healthy(v) | Mode::FailClose(v) => v,
            Mode::Slow(delay, v) => {
                tokio::time::sleep(delay).await;
                v
            }
            Mode::FailExecute => {
                return Err(DalError::execution(&self.repository, "server gone away", None));
            }
            Mode::FailOpen => unreachable!("never opened"),
        };

        let mut outcome = RawOutcome {
            rows_affected: 1,
            ..Default::default()
        };
        match &command.outputs {
            OutputCapture::MainRow { parameters } => {
                for name in parameters {
                    outcome.outputs.insert(name.clone(), DbValue::Int(value));
                }
            }
            _ => outcome.sets.push(ResultSet {
                columns: vec![ColumnInfo {
                    name: "value".to_string(),
                    type_name: "BIGINT".to_string(),
                }],
                rows: vec![vec![DbValue::Int(value)]],
                error: None,
            }),
        }
        Ok(outcome)
    }

    fn close(self: Box<Self>) -> DalResult<()> {
        if matches!(self.mode, Mode::FailClose(_)) {
            return Err(DalError::execution(&self.repository, "connection reset on close", None));
        }
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}

/// Built-in engines plus `mock`.
pub fn registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_builtin();
    registry.register("mock", |settings| {
        Ok(Arc::new(MockProvider::new(
            &settings.repository,
            &settings.connection_string,
        )) as Arc<dyn ConnectionProvider>)
    });
    registry
}

pub fn mock_repository(name: &str, connection_string: &str, sequence: i32) -> RepositoryConfig {
    RepositoryConfig {
        engine: Some("mock".to_string()),
        sequence,
        ..RepositoryConfig::new(name, connection_string)
    }
}

/// Configuration with one cluster `main` over the given mock members, in order.
pub fn mock_config(members: &[(&str, &str)]) -> DataAccessConfig {
    let mut config = DataAccessConfig::default();
    for (i, (name, url)) in members.iter().enumerate() {
        config = config.with_repository(mock_repository(name, url, i as i32));
    }
    let names: Vec<&str> = members.iter().map(|(n, _)| *n).collect();
    config.with_cluster(ClusterConfig::new("main", &names))
}

/// A SQLite database file that outlives the returned guard's scope only as long as
/// the guard is held.
pub fn sqlite_file() -> (tempfile::TempPath, String) {
    let path = NamedTempFile::new().unwrap().into_temp_path();
    let url = format!("sqlite:{}", path.to_str().unwrap());
    (path, url)
}

/// Single-member SQLite configuration with cluster `main`.
pub fn sqlite_config(url: &str) -> DataAccessConfig {
    DataAccessConfig::default()
        .with_repository(RepositoryConfig::new("local", url))
        .with_cluster(ClusterConfig::new("main", &["local"]))
}

/// Counts analytics events and reported errors.
#[derive(Debug, Default)]
pub struct Recorder {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub open_failed: AtomicUsize,
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
    pub errors: Mutex<Vec<String>>,
    pub last_connection_string: Mutex<Option<String>>,
}

impl Recorder {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl AnalyticRecorder for Recorder {
    fn connection_opened(&self, info: &ConnectionAnalyticInfo) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_connection_string.lock().unwrap() = Some(info.connection_string.clone());
    }

    fn connection_closed(&self, _info: &ConnectionAnalyticInfo) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_failed(&self, _info: &ConnectionAnalyticInfo) {
        self.open_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn command_completed(&self, _info: &CommandAnalyticInfo) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn command_failed(&self, _info: &CommandAnalyticInfo) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

impl ErrorReporter for Recorder {
    fn report_error(
        &self,
        error: &DalError,
        message: &str,
        repository: Option<&str>,
        _session: Option<Uuid>,
    ) {
        self.errors.lock().unwrap().push(format!(
            "{}: {} ({})",
            repository.unwrap_or("-"),
            message,
            error
        ));
    }
}
