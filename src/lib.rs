//! Cluster-aware SQL data access.
//!
//! Application code runs [`Command`]s against a named cluster of repositories without
//! knowing which engine (PostgreSQL, MySQL or SQLite) or which physical server serves
//! them. The layer picks a member by fallback policy, tracks member health, and
//! normalises results into one row-access surface.
//!
//! ```no_run
//! use cluster_dal::{Command, DataAccess, DataAccessConfig};
//!
//! # async fn run() -> cluster_dal::DalResult<()> {
//! let config = DataAccessConfig::from_json_str(r#"{
//!     "repositories": [
//!         { "name": "primary", "connectionString": "postgres://app@db-a/orders" },
//!         { "name": "replica", "connectionString": "postgres://app@db-b/orders", "sequence": 1 }
//!     ],
//!     "clusters": [{ "name": "orders", "databases": ["primary", "replica"] }]
//! }"#)?;
//! let dal = DataAccess::from_config(config)?;
//!
//! let mut command = Command::new("SELECT count(*) FROM orders WHERE customer = @customer")
//!     .with_param("customer", 42);
//! let count: i64 = dal.execute_scalar("orders", &mut command).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub use access::{DataAccess, DataAccessBuilder};
pub use cluster::{Cluster, FallbackPolicy, Repository, RepositoryHealth};
pub use config::{
    ClusterConfig, DataAccessConfig, FallbackPolicyConfig, PolicyKind, PoolOptions,
    RepositoryConfig,
};
pub use db::{
    DataEnumerator, DataReader, FromDataRow, Observers, ProviderRegistry, Session, SessionState,
    active_connection_count,
};
pub use error::{DalError, DalResult};
pub use models::{
    Command, CommandType, DbType, DbValue, Engine, FromDbValue, OutputValues, Parameter,
    ParameterDirection,
};
