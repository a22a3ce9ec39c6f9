//! Sessions: one physical connection, at most one transaction and at most one bound
//! command.
//!
//! ```text
//! Closed -(open)-> Open -(begin)-> InTransaction -(commit|rollback)-> Open -(dispose)-> Closed
//! ```
//!
//! Every operation exists once, as a start/complete pair. `start_*` opens the
//! connection if needed and spawns the engine work; `complete_*` waits for it and
//! applies the bookkeeping (health counters, analytics, output parameters, closing a
//! connection opened just for this operation). The one-call forms `execute_*` are
//! literally start followed by complete.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::binding::BoundCommand;
use super::observe::{
    self, CommandAnalyticInfo, ConnectionAnalyticInfo, Observers, mask_connection_string,
};
use super::provider::{EngineConnection, RawOutcome};
use super::reader::{DataReader, SessionRef};
use crate::cluster::Repository;
use crate::config::DEFAULT_COMMAND_TIMEOUT_SECS;
use crate::error::{DalError, DalResult};
use crate::models::{Command, FromDbValue, OutputValues};

/// Type-level tags for [`PendingOperation`].
pub mod kind {
    /// Produces a [`DataReader`](crate::db::DataReader)
    pub enum Reader {}
    /// Produces an affected-row count
    pub enum NonQuery {}
    /// Produces a single converted value
    pub enum Scalar {}
}

pub type PendingReader = PendingOperation<kind::Reader>;
pub type PendingNonQuery = PendingOperation<kind::NonQuery>;
pub type PendingScalar = PendingOperation<kind::Scalar>;

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    InTransaction,
}

enum Link {
    Closed,
    Open(Box<dyn EngineConnection>),
    /// The connection is inside a running operation
    Busy,
}

type TaskOutput = (Option<Box<dyn EngineConnection>>, DalResult<RawOutcome>);

/// Bookkeeping carried from start to completion of one operation.
#[derive(Debug, Clone)]
pub(crate) struct OpContext {
    /// The connection was opened for this operation and closes with it
    pub opened_here: bool,
    /// A transaction was active when the operation started
    pub in_transaction: bool,
    /// Set once the physical connection is available
    pub started: Instant,
    pub command_text: String,
}

/// Handle returned by the `start_*` methods; pass it to the matching `complete_*`.
///
/// Dropping a handle without completing it leaves its session busy; the connection
/// is released in the background once the engine work finishes. A transaction that
/// was active when the operation started is committed first, as on dispose.
#[must_use = "a pending operation must be completed to observe its result"]
pub struct PendingOperation<K> {
    session_id: Uuid,
    handle: Option<JoinHandle<TaskOutput>>,
    ctx: OpContext,
    _kind: PhantomData<fn() -> K>,
}

impl<K> PendingOperation<K> {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// True once the engine work has finished; completing will not wait.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl<K> std::fmt::Debug for PendingOperation<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("session_id", &self.session_id)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl<K> Drop for PendingOperation<K> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        warn!(session_id = %self.session_id, "Pending operation dropped without completion");
        let session_id = self.session_id;
        let in_transaction = self.ctx.in_transaction;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Ok((Some(conn), _)) = handle.await {
                        release_detached(conn, in_transaction, session_id).await;
                    }
                    observe::connection_closed();
                });
            }
            Err(_) => {
                handle.abort();
                observe::connection_closed();
            }
        }
    }
}

pub struct Session {
    id: Uuid,
    repository: Arc<Repository>,
    observers: Observers,
    default_timeout: Duration,
    command: Option<Command>,
    bound: Option<Arc<BoundCommand>>,
    link: Link,
    in_transaction: bool,
    disposed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("repository", &self.repository.name())
            .field("state", &self.state())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A closed session against `repository`. Nothing is opened until needed.
    pub fn new(repository: Arc<Repository>, observers: Observers) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository,
            observers,
            default_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            command: None,
            bound: None,
            link: Link::Closed,
            in_transaction: false,
            disposed: false,
        }
    }

    /// A session with `command` already bound. The physical connection still opens
    /// lazily on first use.
    pub fn open(
        repository: Arc<Repository>,
        command: Option<Command>,
        observers: Observers,
    ) -> DalResult<Self> {
        let mut session = Self::new(repository, observers);
        if let Some(command) = command {
            session.set_command(command)?;
        }
        Ok(session)
    }

    /// Timeout for commands that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn state(&self) -> SessionState {
        match (&self.link, self.in_transaction) {
            (Link::Closed, _) => SessionState::Closed,
            (_, true) => SessionState::InTransaction,
            (_, false) => SessionState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.link, Link::Closed)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The bound command, including output values stored by the last operation.
    pub fn command(&self) -> Option<&Command> {
        self.command.as_ref()
    }

    pub fn take_command(&mut self) -> Option<Command> {
        self.bound = None;
        self.command.take()
    }

    /// Bind `command`, replacing any previous one. A binding failure counts against
    /// the repository.
    pub fn set_command(&mut self, command: Command) -> DalResult<()> {
        self.ensure_usable()?;
        if matches!(self.link, Link::Busy) {
            return Err(self.invalid_state("cannot rebind while an operation is running"));
        }
        self.bound = None;
        self.command = None;
        match self.repository.provider().bind(&command) {
            Ok(bound) => {
                self.bound = Some(Arc::new(bound));
                self.command = Some(command);
                Ok(())
            }
            Err(e) => {
                self.repository.record_failure();
                self.report(&e, "Failed to bind command");
                Err(e)
            }
        }
    }

    /// Open the physical connection now instead of on first use.
    pub async fn connect(&mut self) -> DalResult<()> {
        self.ensure_usable()?;
        self.ensure_open().await.map(|_| ())
    }

    /// Begin a transaction, committing one that is already active.
    pub async fn begin_transaction(&mut self) -> DalResult<()> {
        self.ensure_usable()?;
        if self.in_transaction {
            debug!(session_id = %self.id, "Committing active transaction before starting a new one");
            self.commit().await?;
        }
        self.ensure_open().await?;
        let result = match &mut self.link {
            Link::Open(conn) => conn.begin().await,
            _ => Err(self.invalid_state("connection is busy")),
        };
        match result {
            Ok(()) => {
                self.in_transaction = true;
                debug!(session_id = %self.id, repository = %self.repository.name(), "Transaction started");
                Ok(())
            }
            Err(e) => {
                self.report(&e, "Failed to begin transaction");
                Err(e)
            }
        }
    }

    /// Commit the active transaction. A no-op without one.
    pub async fn commit(&mut self) -> DalResult<()> {
        self.end_transaction(true).await
    }

    /// Roll back the active transaction. A no-op without one.
    pub async fn rollback(&mut self) -> DalResult<()> {
        self.end_transaction(false).await
    }

    async fn end_transaction(&mut self, commit: bool) -> DalResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        let result = match &mut self.link {
            Link::Open(conn) if commit => conn.commit().await,
            Link::Open(conn) => conn.rollback().await,
            Link::Busy => return Err(self.invalid_state("an operation is still running")),
            Link::Closed => Ok(()),
        };
        // The transaction is over either way
        self.in_transaction = false;
        if let Err(e) = &result {
            let message = if commit {
                "Failed to commit transaction"
            } else {
                "Failed to roll back transaction"
            };
            self.report(e, message);
        }
        result
    }

    /// Commit any open transaction, then close the connection. Every step runs even
    /// when an earlier one fails; the first failure is returned. Calling it again is
    /// a no-op.
    ///
    /// A session with a running operation cannot be disposed: complete the operation
    /// first, or drop its handle to release the connection in the background.
    pub async fn dispose(&mut self) -> DalResult<()> {
        if self.disposed {
            return Ok(());
        }
        if matches!(self.link, Link::Busy) {
            return Err(self.invalid_state("cannot dispose while an operation is running"));
        }
        self.disposed = true;

        let committed = self.commit().await;
        let closed = if committed.is_err() {
            // Transaction state is unknown after a failed COMMIT
            self.discard_link();
            Ok(())
        } else {
            self.close_link()
        };
        self.command = None;
        self.bound = None;
        committed.and(closed)
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    pub async fn start_execute_reader(&mut self) -> DalResult<PendingReader> {
        self.start().await
    }

    pub async fn start_execute_non_query(&mut self) -> DalResult<PendingNonQuery> {
        self.start().await
    }

    pub async fn start_execute_scalar(&mut self) -> DalResult<PendingScalar> {
        self.start().await
    }

    /// Wait for a reader operation. Success or failure is recorded when the reader
    /// is released, and a connection opened for the operation closes then.
    pub async fn complete_reader(&mut self, op: PendingReader) -> DalResult<DataReader<'_>> {
        let (ctx, result) = self.finish(op).await?;
        match result {
            Ok(outcome) => {
                self.apply_outputs(&outcome.outputs);
                let shape = self.shape_name();
                Ok(DataReader::new(SessionRef::Borrowed(self), outcome, ctx, shape))
            }
            Err(e) => self.settle(&ctx, Err(e), false),
        }
    }

    /// Like [`Session::complete_reader`], but the reader owns the session.
    pub async fn complete_reader_owned(mut self, op: PendingReader) -> DalResult<DataReader<'static>> {
        let (ctx, result) = self.finish(op).await?;
        match result {
            Ok(outcome) => {
                self.apply_outputs(&outcome.outputs);
                let shape = self.shape_name();
                Ok(DataReader::new(
                    SessionRef::Owned(Box::new(self)),
                    outcome,
                    ctx,
                    shape,
                ))
            }
            Err(e) => self.settle(&ctx, Err(e), false),
        }
    }

    pub async fn complete_non_query(&mut self, op: PendingNonQuery) -> DalResult<u64> {
        let (ctx, result) = self.finish(op).await?;
        let result = result.and_then(|mut outcome| match outcome.take_error() {
            Some(e) => Err(e),
            None => Ok(outcome),
        });
        let result = result.map(|outcome| {
            self.apply_outputs(&outcome.outputs);
            outcome.rows_affected
        });
        self.settle(&ctx, result, false)
    }

    /// Wait for a scalar operation and convert the first column of the first row.
    ///
    /// A NULL or missing value becomes `None` for `Option<T>` and the type's default
    /// otherwise. A value that cannot be converted is a
    /// [`DalError::ResultConversion`].
    pub async fn complete_scalar<T: FromDbValue>(&mut self, op: PendingScalar) -> DalResult<T> {
        let (ctx, result) = self.finish(op).await?;
        let repository = self.repository.name().to_string();
        let result = result.and_then(|mut outcome| {
            if let Some(e) = outcome.take_error() {
                return Err(e);
            }
            self.apply_outputs(&outcome.outputs);
            let value = outcome.first_value().cloned().unwrap_or_default();
            T::from_db_value(&value).map_err(|e| DalError::result_conversion(&repository, e))
        });
        self.settle(&ctx, result, false)
    }

    pub async fn execute_reader(&mut self) -> DalResult<DataReader<'_>> {
        let op = self.start_execute_reader().await?;
        self.complete_reader(op).await
    }

    pub async fn execute_non_query(&mut self) -> DalResult<u64> {
        let op = self.start_execute_non_query().await?;
        self.complete_non_query(op).await
    }

    pub async fn execute_scalar<T: FromDbValue>(&mut self) -> DalResult<T> {
        let op = self.start_execute_scalar().await?;
        self.complete_scalar(op).await
    }

    async fn start<K>(&mut self) -> DalResult<PendingOperation<K>> {
        self.ensure_usable()?;
        if matches!(self.link, Link::Busy) {
            return Err(self.invalid_state("an operation is already running"));
        }
        let (Some(command), Some(bound)) = (&self.command, &self.bound) else {
            return Err(DalError::command_binding(
                self.repository.name(),
                "no command is bound to the session",
            ));
        };
        let bound = Arc::clone(bound);
        let command_text = command.text.clone();
        let limit = command
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        self.observers.trace.write_line(&format!(
            "[{}] {} {}: {}",
            self.id,
            self.repository.name(),
            command.command_type,
            command.text
        ));

        let opened_here = self.ensure_open().await?;
        let in_transaction = self.in_transaction;
        let started = Instant::now();
        let mut conn = match std::mem::replace(&mut self.link, Link::Busy) {
            Link::Open(conn) => conn,
            other => {
                self.link = other;
                return Err(self.invalid_state("connection is not open"));
            }
        };

        debug!(session_id = %self.id, repository = %self.repository.name(), "Executing command");
        let repository = self.repository.name().to_string();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(limit, conn.run(&bound)).await {
                Ok(result) => (Some(conn), result),
                Err(_) => {
                    // Protocol state is unknown after an abandoned call
                    conn.discard();
                    (
                        None,
                        Err(DalError::timeout(&repository, "Command", limit.as_secs())),
                    )
                }
            }
        });

        Ok(PendingOperation {
            session_id: self.id,
            handle: Some(handle),
            ctx: OpContext {
                opened_here,
                in_transaction,
                started,
                command_text,
            },
            _kind: PhantomData,
        })
    }

    /// Wait for the engine work and take the connection back. The outer error is
    /// for misuse only; engine failures are in the inner result.
    async fn finish<K>(
        &mut self,
        mut op: PendingOperation<K>,
    ) -> DalResult<(OpContext, DalResult<RawOutcome>)> {
        if op.session_id != self.id {
            return Err(self.invalid_state("the operation was started by another session"));
        }
        let Some(handle) = op.handle.take() else {
            return Err(self.invalid_state("the operation was already completed"));
        };
        let result = match handle.await {
            Ok((Some(conn), result)) => {
                self.link = Link::Open(conn);
                result
            }
            Ok((None, result)) => {
                self.connection_lost();
                result
            }
            Err(e) => {
                self.connection_lost();
                Err(DalError::execution(
                    self.repository.name(),
                    format!("Execution task failed: {}", e),
                    None,
                ))
            }
        };
        Ok((op.ctx.clone(), result))
    }

    /// Record the outcome of an operation and close a connection opened for it.
    pub(crate) fn settle<T>(
        &mut self,
        ctx: &OpContext,
        result: DalResult<T>,
        already_reported: bool,
    ) -> DalResult<T> {
        let elapsed = ctx.started.elapsed();
        let info = CommandAnalyticInfo {
            session_id: self.id,
            repository_name: self.repository.name().to_string(),
            command_text: ctx.command_text.clone(),
            elapsed_seconds: elapsed.as_secs_f64(),
        };
        match &result {
            Ok(_) => {
                self.repository.record_success(elapsed);
                self.observers.analytics.command_completed(&info);
                debug!(
                    session_id = %self.id,
                    repository = %self.repository.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Command completed"
                );
            }
            Err(e) => {
                self.repository.record_failure();
                self.observers.analytics.command_failed(&info);
                if !already_reported {
                    self.report(e, "Command execution failed");
                }
            }
        }

        if ctx.opened_here && !self.in_transaction {
            if let Err(e) = self.close_link() {
                self.report(&e, "Failed to close connection");
            }
        }
        result
    }

    pub(crate) fn report(&self, error: &DalError, message: &str) {
        self.observers.errors.report_error(
            error,
            message,
            Some(self.repository.name()),
            Some(self.id),
        );
    }

    fn apply_outputs(&mut self, outputs: &OutputValues) {
        if outputs.is_empty() {
            return;
        }
        if let Some(command) = self.command.as_mut() {
            command.store_outputs(outputs);
        }
    }

    /// `repository:engine:command_type:text`, identifying the shape of the rows.
    fn shape_name(&self) -> String {
        match &self.command {
            Some(c) => format!(
                "{}:{}:{}:{}",
                self.repository.name(),
                self.repository.engine(),
                c.command_type,
                c.text
            ),
            None => format!("{}:{}", self.repository.name(), self.repository.engine()),
        }
    }

    fn ensure_usable(&self) -> DalResult<()> {
        if self.disposed {
            return Err(self.invalid_state("session is disposed"));
        }
        Ok(())
    }

    fn invalid_state(&self, message: &str) -> DalError {
        DalError::invalid_state(self.repository.name(), message)
    }

    /// Open the physical connection if closed. Returns whether it was opened now.
    async fn ensure_open(&mut self) -> DalResult<bool> {
        match self.link {
            Link::Open(_) => return Ok(false),
            Link::Busy => return Err(self.invalid_state("an operation is already running")),
            Link::Closed => {}
        }

        let provider = Arc::clone(self.repository.provider());
        match provider.open().await {
            Ok(conn) => {
                self.link = Link::Open(conn);
                let active = observe::connection_opened();
                self.observers
                    .analytics
                    .connection_opened(&self.connection_info(active));
                debug!(
                    session_id = %self.id,
                    repository = %self.repository.name(),
                    active_connections = active,
                    "Connection opened"
                );
                Ok(true)
            }
            Err(e) => {
                self.repository.record_failure();
                self.observers
                    .analytics
                    .connection_failed(&self.connection_info(observe::active_connection_count()));
                self.report(&e, "Failed to open connection");
                Err(e)
            }
        }
    }

    /// Return the connection to its pool. Leaves a busy link alone. A connection
    /// still inside a transaction is discarded instead, so no pooled connection
    /// carries an open transaction.
    fn close_link(&mut self) -> DalResult<()> {
        if self.in_transaction {
            warn!(
                session_id = %self.id,
                repository = %self.repository.name(),
                "Closing connection inside a transaction; discarding it"
            );
            self.discard_link();
            return Ok(());
        }
        match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Open(conn) => {
                let result = conn.close();
                self.link_released();
                result
            }
            Link::Busy => {
                self.link = Link::Busy;
                Ok(())
            }
            Link::Closed => Ok(()),
        }
    }

    /// Drop the connection without returning it to the pool.
    fn discard_link(&mut self) {
        match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Open(conn) => {
                self.in_transaction = false;
                conn.discard();
                self.link_released();
            }
            Link::Busy => self.link = Link::Busy,
            Link::Closed => {}
        }
    }

    fn link_released(&mut self) {
        let active = observe::connection_closed();
        self.observers
            .analytics
            .connection_closed(&self.connection_info(active));
        debug!(
            session_id = %self.id,
            repository = %self.repository.name(),
            active_connections = active,
            "Connection closed"
        );
    }

    /// The running operation gave up its connection (timeout or task failure).
    fn connection_lost(&mut self) {
        self.link = Link::Closed;
        if self.in_transaction {
            warn!(session_id = %self.id, "Connection lost inside a transaction");
        }
        self.in_transaction = false;
        let active = observe::connection_closed();
        self.observers
            .analytics
            .connection_closed(&self.connection_info(active));
    }

    fn connection_info(&self, active_count: usize) -> ConnectionAnalyticInfo {
        let provider = self.repository.provider();
        ConnectionAnalyticInfo {
            server_type: provider.server_type().to_string(),
            repository_name: self.repository.name().to_string(),
            connection_string: mask_connection_string(provider.connection_string()),
            active_count,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Link::Open(conn) = std::mem::replace(&mut self.link, Link::Closed) else {
            return;
        };
        if !self.in_transaction {
            if !self.disposed {
                debug!(session_id = %self.id, "Session dropped while open; closing connection");
            }
            let _ = conn.close();
            observe::connection_closed();
            return;
        }

        warn!(
            session_id = %self.id,
            repository = %self.repository.name(),
            "Session dropped inside a transaction without dispose; committing in background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let session_id = self.id;
                rt.spawn(async move {
                    release_detached(conn, true, session_id).await;
                    observe::connection_closed();
                });
            }
            Err(_) => {
                conn.discard();
                observe::connection_closed();
            }
        }
    }
}

/// Release a connection no session owns any more. An active transaction is committed
/// first; a connection whose commit fails is discarded rather than pooled.
async fn release_detached(
    mut conn: Box<dyn EngineConnection>,
    in_transaction: bool,
    session_id: Uuid,
) {
    if in_transaction {
        if let Err(e) = conn.commit().await {
            warn!(session_id = %session_id, error = %e, "Background commit failed");
            conn.discard();
            return;
        }
    }
    if let Err(e) = conn.close() {
        warn!(session_id = %session_id, error = %e, "Failed to close connection");
    }
}
