//! Database abstraction layer.
//!
//! This module provides everything below the cluster router:
//! - The provider contract and the engine registry
//! - PostgreSQL, MySQL and SQLite providers
//! - Command binding and column decoding
//! - Sessions, pending operations and the row reader
//! - Observability hooks and the process-wide connection counter

pub mod binding;
#[macro_use]
mod macros;
pub mod mysql;
pub mod observe;
pub mod postgres;
pub mod provider;
pub mod reader;
pub mod session;
pub mod sqlite;
pub mod types;

pub use observe::{
    AnalyticRecorder, CommandAnalyticInfo, ConnectionAnalyticInfo, ErrorReporter, NoopAnalytics,
    Observers, TraceWriter, TracingErrorReporter, TracingTraceWriter, active_connection_count,
};
pub use provider::{
    ConnectionProvider, EngineConnection, ProviderRegistry, ProviderSettings, RawOutcome,
    ResultSet,
};
pub use reader::{DataEnumerator, DataReader, FromDataRow};
pub use session::{
    PendingNonQuery, PendingOperation, PendingReader, PendingScalar, Session, SessionState,
};
pub use types::ColumnInfo;
