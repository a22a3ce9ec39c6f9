//! The data access entry point.
//!
//! [`DataAccess`] owns the repositories and clusters built from a
//! [`DataAccessConfig`] and runs commands against a cluster by name. Each routed
//! attempt uses a fresh session on the chosen member, so the caller's command is
//! never mutated by a failed attempt; output values from the successful attempt are
//! copied back into it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cluster::{Cluster, FallbackPolicy, Repository, RepositoryHealth, build_policy};
use crate::config::DataAccessConfig;
use crate::db::observe::Observers;
use crate::db::provider::ProviderRegistry;
use crate::db::reader::{DataEnumerator, DataReader, FromDataRow};
use crate::db::session::Session;
use crate::error::{DalError, DalResult};
use crate::models::{Command, FromDbValue};

/// Builds a [`DataAccess`] with custom engines, policies or observers.
pub struct DataAccessBuilder {
    config: DataAccessConfig,
    registry: ProviderRegistry,
    policies: Vec<Arc<dyn FallbackPolicy>>,
    observers: Observers,
}

impl DataAccessBuilder {
    pub fn new(config: DataAccessConfig) -> Self {
        Self {
            config,
            registry: ProviderRegistry::with_builtin(),
            policies: Vec::new(),
            observers: Observers::default(),
        }
    }

    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add a policy clusters can name in `fallbackPolicy`. Takes precedence over a
    /// configured policy of the same name.
    pub fn policy(mut self, policy: Arc<dyn FallbackPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    pub fn build(self) -> DalResult<DataAccess> {
        let config = self.config;
        validate_with_custom_policies(&config, &self.policies)?;

        let mut repositories = HashMap::new();
        for repo_config in &config.repositories {
            let repository = Repository::from_config(repo_config, &self.registry)?;
            repositories.insert(repo_config.name.to_lowercase(), Arc::new(repository));
        }

        let mut clusters = Vec::with_capacity(config.clusters.len());
        for cluster_config in &config.clusters {
            let members = cluster_config
                .databases
                .iter()
                .map(|name| {
                    repositories
                        .get(&name.to_lowercase())
                        .cloned()
                        .ok_or_else(|| DalError::repository_not_found(name))
                })
                .collect::<DalResult<Vec<_>>>()?;

            let policy_name = &cluster_config.fallback_policy;
            let policy = match self
                .policies
                .iter()
                .find(|p| p.name().eq_ignore_ascii_case(policy_name))
            {
                Some(custom) => Arc::clone(custom),
                None => {
                    let policy_config = config.policy(policy_name).ok_or_else(|| {
                        DalError::invalid_config(format!(
                            "Cluster '{}' references unknown fallback policy '{}'",
                            cluster_config.name, policy_name
                        ))
                    })?;
                    build_policy(&policy_config)
                }
            };

            let cluster = Cluster::new(&cluster_config.name, members, policy)
                .with_sequence(cluster_config.sequence)
                .with_enabled(cluster_config.enabled);
            clusters.push(Arc::new(cluster));
        }
        // Stable: configuration order breaks ties
        clusters.sort_by_key(|c| c.sequence());

        info!(
            repositories = repositories.len(),
            clusters = clusters.len(),
            "Data access layer initialised"
        );
        Ok(DataAccess {
            repositories,
            clusters,
            observers: self.observers,
            default_timeout: config.default_timeout(),
        })
    }
}

/// Configuration validation, allowing clusters to name policies that are only
/// registered in code.
fn validate_with_custom_policies(
    config: &DataAccessConfig,
    policies: &[Arc<dyn FallbackPolicy>],
) -> DalResult<()> {
    if policies.is_empty() {
        return config.validate();
    }
    let mut relaxed = config.clone();
    for cluster in &mut relaxed.clusters {
        if policies
            .iter()
            .any(|p| p.name().eq_ignore_ascii_case(&cluster.fallback_policy))
        {
            cluster.fallback_policy = crate::config::DEFAULT_POLICY_NAME.to_string();
        }
    }
    relaxed.validate()
}

#[derive(Debug)]
pub struct DataAccess {
    repositories: HashMap<String, Arc<Repository>>,
    /// Ordered by cluster sequence
    clusters: Vec<Arc<Cluster>>,
    observers: Observers,
    default_timeout: Duration,
}

impl DataAccess {
    pub fn builder(config: DataAccessConfig) -> DataAccessBuilder {
        DataAccessBuilder::new(config)
    }

    /// Build with the built-in engines and configured policies.
    pub fn from_config(config: DataAccessConfig) -> DalResult<Self> {
        DataAccessBuilder::new(config).build()
    }

    pub fn cluster(&self, name: &str) -> DalResult<&Arc<Cluster>> {
        self.clusters
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| DalError::cluster_not_found(name))
    }

    /// Cluster names ordered by sequence.
    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.iter().map(|c| c.name()).collect()
    }

    /// The enabled cluster with the lowest sequence.
    pub fn default_cluster(&self) -> Option<&Arc<Cluster>> {
        self.clusters.iter().find(|c| c.is_enabled())
    }

    pub fn repository(&self, name: &str) -> DalResult<&Arc<Repository>> {
        self.repositories
            .get(&name.to_lowercase())
            .ok_or_else(|| DalError::repository_not_found(name))
    }

    /// Health snapshots of every repository, sorted by name.
    pub fn health(&self) -> Vec<RepositoryHealth> {
        let mut health: Vec<RepositoryHealth> =
            self.repositories.values().map(|r| r.health()).collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// A closed session on the cluster's currently preferred member, for explicit
    /// transaction work. No fallback applies to sessions.
    pub fn open_session(&self, cluster: &str) -> DalResult<Session> {
        let ranked = self.cluster(cluster)?.ranked()?;
        let repository = ranked
            .into_iter()
            .next()
            .ok_or_else(|| DalError::cluster_unavailable(cluster, "no enabled members"))?;
        Ok(self.session_on(repository))
    }

    /// A closed session on a specific repository.
    pub fn open_repository_session(&self, repository: &str) -> DalResult<Session> {
        Ok(self.session_on(Arc::clone(self.repository(repository)?)))
    }

    fn session_on(&self, repository: Arc<Repository>) -> Session {
        Session::new(repository, self.observers.clone()).with_default_timeout(self.default_timeout)
    }

    pub async fn execute_scalar<T: FromDbValue>(
        &self,
        cluster: &str,
        command: &mut Command,
    ) -> DalResult<T> {
        let (value, executed) = self
            .cluster(cluster)?
            .execute(command, |repository| {
                let attempt = command.clone();
                async move {
                    let mut session = self.session_on(repository);
                    session.set_command(attempt)?;
                    let value = session.execute_scalar::<T>().await;
                    close_attempt(session, value).await
                }
            })
            .await?;
        if let Some(executed) = executed {
            command.copy_outputs_from(&executed);
        }
        Ok(value)
    }

    pub async fn execute_non_query(&self, cluster: &str, command: &mut Command) -> DalResult<u64> {
        let (rows, executed) = self
            .cluster(cluster)?
            .execute(command, |repository| {
                let attempt = command.clone();
                async move {
                    let mut session = self.session_on(repository);
                    session.set_command(attempt)?;
                    let rows = session.execute_non_query().await;
                    close_attempt(session, rows).await
                }
            })
            .await?;
        if let Some(executed) = executed {
            command.copy_outputs_from(&executed);
        }
        Ok(rows)
    }

    /// Run a reader command. The reader owns its session; releasing it records the
    /// outcome and closes the connection.
    ///
    /// Every result set is read into memory before the reader is returned, so a
    /// large result costs memory proportional to its size. Page large queries.
    pub async fn execute_reader(
        &self,
        cluster: &str,
        command: &mut Command,
    ) -> DalResult<DataReader<'static>> {
        let reader = self
            .cluster(cluster)?
            .execute(command, |repository| {
                let attempt = command.clone();
                async move {
                    let mut session = self.session_on(repository);
                    session.set_command(attempt)?;
                    let op = session.start_execute_reader().await?;
                    session.complete_reader_owned(op).await
                }
            })
            .await?;
        if let Some(executed) = reader.command() {
            command.copy_outputs_from(executed);
        }
        Ok(reader)
    }

    /// Rows of the first result set mapped to `T`. Buffered like
    /// [`DataAccess::execute_reader`].
    pub async fn execute_enumerable<T: FromDataRow>(
        &self,
        cluster: &str,
        command: &mut Command,
    ) -> DalResult<DataEnumerator<'static, T>> {
        Ok(self.execute_reader(cluster, command).await?.into_enumerable())
    }

    /// Close every repository's connection pool.
    pub async fn shutdown(&self) {
        for repository in self.repositories.values() {
            repository.provider().shutdown().await;
        }
    }
}

/// Dispose an attempt's session and hand back the executed command with the result.
///
/// Once the command has succeeded a dispose failure is only reported: returning it
/// would make the cluster run the command again on another member.
async fn close_attempt<T>(
    mut session: Session,
    result: DalResult<T>,
) -> DalResult<(T, Option<Command>)> {
    let executed = session.take_command();
    let disposed = session.dispose().await;
    let value = result?;
    if let Err(e) = disposed {
        session.report(&e, "Failed to dispose session after the command completed");
    }
    Ok((value, executed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, FallbackPolicyConfig, PolicyKind, RepositoryConfig};

    fn config() -> DataAccessConfig {
        DataAccessConfig::default()
            .with_repository(RepositoryConfig::new("a", "sqlite::memory:"))
            .with_repository(RepositoryConfig::new("b", "sqlite::memory:"))
            .with_cluster(ClusterConfig {
                sequence: 2,
                ..ClusterConfig::new("reports", &["b"])
            })
            .with_cluster(ClusterConfig {
                sequence: 1,
                ..ClusterConfig::new("main", &["a", "b"])
            })
    }

    #[test]
    fn test_clusters_ordered_by_sequence() {
        let dal = DataAccess::from_config(config()).unwrap();
        assert_eq!(dal.cluster_names(), vec!["main", "reports"]);
        assert_eq!(dal.default_cluster().unwrap().name(), "main");
        assert_eq!(dal.cluster("MAIN").unwrap().members().len(), 2);
    }

    #[test]
    fn test_unknown_names() {
        let dal = DataAccess::from_config(config()).unwrap();
        assert!(matches!(
            dal.cluster("missing"),
            Err(DalError::ClusterNotFound { .. })
        ));
        assert!(matches!(
            dal.repository("missing"),
            Err(DalError::RepositoryNotFound { .. })
        ));
    }

    #[test]
    fn test_configured_policy_is_used() {
        let mut cfg = config().with_policy(FallbackPolicyConfig {
            name: "spread".to_string(),
            kind: PolicyKind::RoundRobin,
            ..Default::default()
        });
        cfg.clusters[1].fallback_policy = "spread".to_string();
        let dal = DataAccess::from_config(cfg).unwrap();
        assert_eq!(dal.cluster("main").unwrap().policy().name(), "spread");
    }

    #[test]
    fn test_custom_policy_registered_in_code() {
        let mut cfg = config();
        cfg.clusters[1].fallback_policy = "pinned".to_string();
        assert!(DataAccess::from_config(cfg.clone()).is_err());

        let dal = DataAccess::builder(cfg)
            .policy(Arc::new(crate::cluster::OrderedPolicy::new("pinned")))
            .build()
            .unwrap();
        assert_eq!(dal.cluster("main").unwrap().policy().name(), "pinned");
    }

    #[tokio::test]
    async fn test_open_session_on_first_member() {
        let dal = DataAccess::from_config(config()).unwrap();
        let session = dal.open_session("main").unwrap();
        assert_eq!(session.repository().name(), "a");
        assert!(!session.is_open());
    }
}
