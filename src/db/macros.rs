//! Code generation for the per-engine connection types.
//!
//! The three engine connections differ only in their sqlx database type, the
//! function that binds typed arguments and the statement that opens a transaction.
//! The macro keeps the fetch loop in one place while each engine module still reads
//! linearly.

/// Generate a pooled engine connection type implementing
/// [`StatementRunner`](crate::db::provider::StatementRunner) and
/// [`EngineConnection`](crate::db::provider::EngineConnection).
///
/// # Example
///
/// ```ignore
/// impl_engine_connection!(PgEngineConnection, sqlx::Postgres, bind_arg, begin = "BEGIN");
/// ```
macro_rules! impl_engine_connection {
    ($name:ident, $db:ty, $bind:path, begin = $begin:literal) => {
        pub(crate) struct $name {
            repository: String,
            conn: sqlx::pool::PoolConnection<$db>,
        }

        impl $name {
            pub(crate) fn new(repository: String, conn: sqlx::pool::PoolConnection<$db>) -> Self {
                Self { repository, conn }
            }

            async fn raw(&mut self, sql: &str) -> $crate::error::DalResult<()> {
                use sqlx::Executor;
                self.conn.execute(sql).await.map_err(|e| {
                    $crate::error::DalError::from_sqlx(
                        &self.repository,
                        $crate::error::Phase::Execute,
                        e,
                    )
                })?;
                Ok(())
            }
        }

        #[async_trait::async_trait]
        impl $crate::db::provider::StatementRunner for $name {
            async fn fetch(
                &mut self,
                statement: &$crate::db::binding::BoundStatement,
            ) -> $crate::error::DalResult<$crate::db::provider::RawOutcome> {
                use futures_util::StreamExt;
                use sqlx::{Either, Executor};

                let mut collector = $crate::db::provider::SetCollector::default();
                let conn = &mut *self.conn;

                let mut stream = if statement.args.is_empty() {
                    // Unprepared: several statements may share one text
                    conn.fetch_many(statement.sql.as_str())
                } else {
                    let mut query = sqlx::query(&statement.sql);
                    for arg in &statement.args {
                        query = $bind(query, arg).map_err(|e| {
                            $crate::error::DalError::command_binding(&self.repository, e)
                        })?;
                    }
                    conn.fetch_many(query)
                };

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(Either::Left(done)) => collector.done(done.rows_affected()),
                        Ok(Either::Right(row)) => collector.row(&row),
                        Err(e) => {
                            collector.fail($crate::error::DalError::from_sqlx(
                                &self.repository,
                                $crate::error::Phase::Execute,
                                e,
                            ))?;
                            break;
                        }
                    }
                }
                Ok(collector.finish())
            }
        }

        #[async_trait::async_trait]
        impl $crate::db::provider::EngineConnection for $name {
            async fn begin(&mut self) -> $crate::error::DalResult<()> {
                self.raw($begin).await
            }

            async fn commit(&mut self) -> $crate::error::DalResult<()> {
                self.raw("COMMIT").await
            }

            async fn rollback(&mut self) -> $crate::error::DalResult<()> {
                self.raw("ROLLBACK").await
            }

            async fn run(
                &mut self,
                command: &$crate::db::binding::BoundCommand,
            ) -> $crate::error::DalResult<$crate::db::provider::RawOutcome> {
                $crate::db::provider::run_bound(self, command).await
            }

            fn close(self: Box<Self>) -> $crate::error::DalResult<()> {
                drop(self.conn);
                Ok(())
            }

            fn discard(self: Box<Self>) {
                drop(self.conn.detach());
            }
        }
    };
}

pub(crate) use impl_engine_connection;
