//! Error types for the data access layer.
//!
//! Every failure that leaves the crate is a [`DalError`]. Repository-scoped variants
//! always carry the repository name so the caller can tell which physical endpoint
//! failed; cluster-scoped variants carry the cluster name.

use thiserror::Error;

/// Phase of an operation in which a driver error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Execute,
}

/// A single failed attempt retained while routing across a cluster.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub repository: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum DalError {
    #[error("Failed to open connection to '{repository}': {message}")]
    ConnectionOpen {
        repository: String,
        message: String,
        suggestion: String,
    },

    #[error("Failed to close connection to '{repository}': {message}")]
    ConnectionClose { repository: String, message: String },

    #[error("Cannot bind command for '{repository}': {message}")]
    CommandBinding { repository: String, message: String },

    #[error("Execution failed on '{repository}': {message}")]
    Execution {
        repository: String,
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        timed_out: bool,
    },

    #[error("Cannot convert result from '{repository}': {message}")]
    ResultConversion { repository: String, message: String },

    #[error("All {attempts} member(s) of cluster '{cluster}' failed; last error: {last}")]
    ClusterExhausted {
        cluster: String,
        attempts: usize,
        last: Box<DalError>,
        history: Vec<AttemptFailure>,
    },

    #[error("Cluster not found: {cluster}")]
    ClusterNotFound { cluster: String },

    #[error("Cluster '{cluster}' is unavailable: {reason}")]
    ClusterUnavailable { cluster: String, reason: String },

    #[error("Repository not found: {repository}")]
    RepositoryNotFound { repository: String },

    #[error("No connection provider registered for engine '{engine}'")]
    UnsupportedEngine { engine: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid session state on '{repository}': {message}")]
    InvalidState { repository: String, message: String },
}

impl DalError {
    /// Create a connection-open error with a helpful suggestion.
    pub fn connection_open(
        repository: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::ConnectionOpen {
            repository: repository.into(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn connection_close(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionClose {
            repository: repository.into(),
            message: message.into(),
        }
    }

    /// Create a binding error (unsupported direction, unknown parameter, ...).
    pub fn command_binding(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandBinding {
            repository: repository.into(),
            message: message.into(),
        }
    }

    /// Create an execution error with optional SQL state.
    pub fn execution(
        repository: impl Into<String>,
        message: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::Execution {
            repository: repository.into(),
            message: message.into(),
            sql_state,
            timed_out: false,
        }
    }

    /// Create an execution error for a command that exceeded its timeout.
    pub fn timeout(repository: impl Into<String>, operation: &str, elapsed_secs: u64) -> Self {
        Self::Execution {
            repository: repository.into(),
            message: format!("{} exceeded {}s", operation, elapsed_secs),
            sql_state: None,
            timed_out: true,
        }
    }

    pub fn result_conversion(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResultConversion {
            repository: repository.into(),
            message: message.into(),
        }
    }

    pub fn cluster_exhausted(
        cluster: impl Into<String>,
        last: DalError,
        history: Vec<AttemptFailure>,
    ) -> Self {
        Self::ClusterExhausted {
            cluster: cluster.into(),
            attempts: history.len().max(1),
            last: Box::new(last),
            history,
        }
    }

    pub fn cluster_not_found(cluster: impl Into<String>) -> Self {
        Self::ClusterNotFound {
            cluster: cluster.into(),
        }
    }

    pub fn cluster_unavailable(cluster: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            cluster: cluster.into(),
            reason: reason.into(),
        }
    }

    pub fn repository_not_found(repository: impl Into<String>) -> Self {
        Self::RepositoryNotFound {
            repository: repository.into(),
        }
    }

    pub fn unsupported_engine(engine: impl Into<String>) -> Self {
        Self::UnsupportedEngine {
            engine: engine.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_state(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            repository: repository.into(),
            message: message.into(),
        }
    }

    /// Map a driver error raised while talking to `repository`.
    pub fn from_sqlx(repository: &str, phase: Phase, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DalError::connection_open(
                repository,
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                match phase {
                    Phase::Open => DalError::connection_open(
                        repository,
                        db_err.message(),
                        "Check that the database exists and the credentials are valid",
                    ),
                    Phase::Execute => DalError::execution(repository, db_err.message(), code),
                }
            }
            sqlx::Error::PoolTimedOut => DalError::connection_open(
                repository,
                "Timed out acquiring a connection from the pool",
                "Increase max_connections or acquire_timeout",
            ),
            sqlx::Error::PoolClosed => DalError::connection_open(
                repository,
                "Connection pool is closed",
                "Recreate the data access layer",
            ),
            sqlx::Error::Io(io_err) => match phase {
                Phase::Open => DalError::connection_open(
                    repository,
                    format!("I/O error: {}", io_err),
                    "Check network connectivity and database server status",
                ),
                Phase::Execute => {
                    DalError::execution(repository, format!("I/O error: {}", io_err), None)
                }
            },
            sqlx::Error::Tls(tls_err) => DalError::connection_open(
                repository,
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => {
                DalError::execution(repository, format!("Protocol error: {}", msg), None)
            }
            sqlx::Error::ColumnDecode { index, source } => DalError::result_conversion(
                repository,
                format!("Failed to decode column {}: {}", index, source),
            ),
            sqlx::Error::Decode(source) => {
                DalError::result_conversion(repository, format!("Decode error: {}", source))
            }
            other => match phase {
                Phase::Open => DalError::connection_open(
                    repository,
                    other.to_string(),
                    "Check database driver configuration",
                ),
                Phase::Execute => DalError::execution(repository, other.to_string(), None),
            },
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionOpen { suggestion, .. } => Some(suggestion),
            Self::Execution {
                timed_out: true, ..
            } => Some("Consider increasing the command timeout or optimizing the query"),
            Self::ClusterExhausted { last, .. } => last.suggestion(),
            _ => None,
        }
    }

    /// Repository the error is scoped to, if any.
    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::ConnectionOpen { repository, .. }
            | Self::ConnectionClose { repository, .. }
            | Self::CommandBinding { repository, .. }
            | Self::Execution { repository, .. }
            | Self::ResultConversion { repository, .. }
            | Self::RepositoryNotFound { repository }
            | Self::InvalidState { repository, .. } => Some(repository),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionOpen { .. }
                | Self::Execution {
                    timed_out: true,
                    ..
                }
        )
    }

    /// True when the failure happened before the command reached the engine,
    /// so re-running it elsewhere cannot duplicate side effects.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::ConnectionOpen { .. } | Self::CommandBinding { .. }
        )
    }

    /// True for failures caused by the command timing out at the engine.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Execution {
                timed_out: true,
                ..
            }
        )
    }
}

/// Result type alias for data access operations.
pub type DalResult<T> = Result<T, DalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_repository() {
        let err = DalError::connection_open("orders-a", "refused", "Check server");
        let text = err.to_string();
        assert!(text.contains("orders-a"));
        assert!(text.contains("refused"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DalError::connection_open("r", "refused", "Check credentials");
        assert_eq!(err.suggestion(), Some("Check credentials"));
        assert!(DalError::timeout("r", "query", 5).suggestion().is_some());
        assert_eq!(DalError::execution("r", "syntax", None).suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DalError::timeout("r", "query", 30).is_retryable());
        assert!(DalError::connection_open("r", "err", "sugg").is_retryable());
        assert!(!DalError::execution("r", "syntax error", None).is_retryable());
    }

    #[test]
    fn test_pre_execution_classification() {
        assert!(DalError::connection_open("r", "x", "y").is_pre_execution());
        assert!(DalError::command_binding("r", "x").is_pre_execution());
        assert!(!DalError::timeout("r", "query", 1).is_pre_execution());
        assert!(!DalError::execution("r", "x", None).is_pre_execution());
    }

    #[test]
    fn test_cluster_exhausted_names_cluster_and_last_error() {
        let last = DalError::execution("db-3", "deadlock", Some("40001".to_string()));
        let history = vec![
            AttemptFailure {
                repository: "db-1".to_string(),
                message: "refused".to_string(),
            },
            AttemptFailure {
                repository: "db-3".to_string(),
                message: "deadlock".to_string(),
            },
        ];
        let err = DalError::cluster_exhausted("orders", last, history);
        let text = err.to_string();
        assert!(text.contains("orders"));
        assert!(text.contains("deadlock"));
        assert!(text.contains("All 2"));
    }

    #[test]
    fn test_repository_accessor() {
        assert_eq!(
            DalError::execution("db-1", "x", None).repository(),
            Some("db-1")
        );
        assert_eq!(DalError::cluster_not_found("c").repository(), None);
    }

    #[test]
    fn test_from_sqlx_maps_phase() {
        let err = DalError::from_sqlx("db-1", Phase::Open, sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DalError::ConnectionOpen { .. }));

        let err = DalError::from_sqlx("db-1", Phase::Execute, sqlx::Error::RowNotFound);
        assert!(matches!(err, DalError::Execution { .. }));
        assert_eq!(err.repository(), Some("db-1"));
    }
}
