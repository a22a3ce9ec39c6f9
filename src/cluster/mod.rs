//! Cluster routing.
//!
//! A [`Cluster`] is an ordered group of [`Repository`] members sharing a
//! [`FallbackPolicy`]. For each operation the policy ranks the members; the cluster
//! tries them in that order until one succeeds, the policy declines to retry, or the
//! members run out.

pub mod policy;
pub mod repository;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use policy::{
    CooldownPolicy, FallbackPolicy, OrderedPolicy, RoundRobinPolicy, build_policy,
    default_should_retry,
};
pub use repository::{Repository, RepositoryHealth};

use crate::error::{AttemptFailure, DalError, DalResult};
use crate::models::Command;

#[derive(Debug)]
pub struct Cluster {
    name: String,
    sequence: i32,
    enabled: bool,
    /// Enabled members ordered by repository sequence, ties by list position
    members: Vec<Arc<Repository>>,
    policy: Arc<dyn FallbackPolicy>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<Repository>>,
        policy: Arc<dyn FallbackPolicy>,
    ) -> Self {
        let mut members: Vec<Arc<Repository>> =
            members.into_iter().filter(|m| m.is_enabled()).collect();
        // Stable sort keeps list position as the tie-break
        members.sort_by_key(|m| m.sequence());

        let name = name.into();
        info!(
            cluster = %name,
            members = ?members.iter().map(|m| m.name()).collect::<Vec<_>>(),
            policy = %policy.name(),
            "Cluster ready"
        );
        Self {
            name,
            sequence: 0,
            enabled: true,
            members,
            policy,
        }
    }

    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled members in configured order.
    pub fn members(&self) -> &[Arc<Repository>] {
        &self.members
    }

    pub fn policy(&self) -> &Arc<dyn FallbackPolicy> {
        &self.policy
    }

    /// Members in the order the policy currently prefers.
    pub fn ranked(&self) -> DalResult<Vec<Arc<Repository>>> {
        if !self.enabled {
            return Err(DalError::cluster_unavailable(&self.name, "cluster is disabled"));
        }
        if self.members.is_empty() {
            return Err(DalError::cluster_unavailable(&self.name, "no enabled members"));
        }
        Ok(self.policy.rank(&self.members))
    }

    /// Run `attempt` against members in ranked order.
    ///
    /// Returns the first success. A failure the policy will not retry is returned
    /// as is; running out of members yields [`DalError::ClusterExhausted`] with the
    /// last error and every attempt's summary.
    pub async fn execute<T, F, Fut>(&self, command: &Command, mut attempt: F) -> DalResult<T>
    where
        F: FnMut(Arc<Repository>) -> Fut,
        Fut: Future<Output = DalResult<T>>,
    {
        let ranked = self.ranked()?;
        let mut history: Vec<AttemptFailure> = Vec::new();
        let mut last_error: Option<DalError> = None;

        for (i, member) in ranked.iter().enumerate() {
            let attempt_no = i + 1;
            debug!(cluster = %self.name, repository = %member.name(), attempt = attempt_no, "Routing command");
            match attempt(Arc::clone(member)).await {
                Ok(value) => {
                    self.policy.report(member, true);
                    if attempt_no > 1 {
                        info!(
                            cluster = %self.name,
                            repository = %member.name(),
                            attempts = attempt_no,
                            "Command succeeded after fallback"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.policy.report(member, false);
                    warn!(
                        cluster = %self.name,
                        repository = %member.name(),
                        attempt = attempt_no,
                        error = %e,
                        "Cluster member failed"
                    );
                    history.push(AttemptFailure {
                        repository: member.name().to_string(),
                        message: e.to_string(),
                    });
                    let retry = self.policy.should_retry(command, &e, attempt_no);
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                }
            }
        }

        let Some(last) = last_error else {
            return Err(DalError::cluster_unavailable(&self.name, "no members were tried"));
        };
        // Stopped by the policy before running out: surface the member's own error
        if history.len() < ranked.len() {
            return Err(last);
        }
        Err(DalError::cluster_exhausted(&self.name, last, history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::db::provider::ProviderRegistry;
    use std::time::Duration;

    fn member(name: &str, sequence: i32, enabled: bool) -> Arc<Repository> {
        let mut config = RepositoryConfig::new(name, "sqlite::memory:");
        config.sequence = sequence;
        config.enabled = enabled;
        Arc::new(Repository::from_config(&config, &ProviderRegistry::with_builtin()).unwrap())
    }

    fn cluster(members: Vec<Arc<Repository>>) -> Cluster {
        Cluster::new("main", members, Arc::new(OrderedPolicy::new("ordered")))
    }

    #[test]
    fn test_members_sorted_and_filtered() {
        let c = cluster(vec![
            member("c", 2, true),
            member("a", 1, true),
            member("off", 0, false),
            member("b", 1, true),
        ]);
        let names: Vec<&str> = c.members().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_disabled_or_empty_cluster_unavailable() {
        let c = cluster(vec![member("off", 0, false)]);
        assert!(matches!(c.ranked(), Err(DalError::ClusterUnavailable { .. })));
        let c = cluster(vec![member("a", 0, true)]).with_enabled(false);
        assert!(matches!(c.ranked(), Err(DalError::ClusterUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_falls_back_to_next_member() {
        let c = cluster(vec![member("a", 0, true), member("b", 1, true)]);
        let result = c
            .execute(&Command::new("SELECT 1"), |repo| async move {
                if repo.name() == "a" {
                    Err(DalError::connection_open("a", "refused", "check host"))
                } else {
                    Ok(repo.name().to_string())
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "b");
    }

    #[tokio::test]
    async fn test_exhaustion_aggregates() {
        let c = cluster(vec![member("a", 0, true), member("b", 1, true)]);
        let err = c
            .execute(&Command::new("SELECT 1"), |repo| async move {
                Err::<(), _>(DalError::execution(repo.name(), "down", None))
            })
            .await
            .unwrap_err();
        match err {
            DalError::ClusterExhausted {
                cluster,
                attempts,
                last,
                history,
            } => {
                assert_eq!(cluster, "main");
                assert_eq!(attempts, 2);
                assert_eq!(last.repository(), Some("b"));
                assert_eq!(history.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_retry_unsafe_stops_after_execution_failure() {
        let c = cluster(vec![member("a", 0, true), member("b", 1, true)]);
        let command = Command::new("INSERT INTO t VALUES (1)").retry_unsafe();
        let err = c
            .execute(&command, |repo| async move {
                Err::<(), _>(DalError::timeout(repo.name(), "Command", 1))
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.repository(), Some("a"));
    }

    #[tokio::test]
    async fn test_cooldown_policy_prefers_healthy_member_next_time() {
        let a = member("a", 0, true);
        let b = member("b", 1, true);
        let c = Cluster::new(
            "main",
            vec![Arc::clone(&a), Arc::clone(&b)],
            Arc::new(CooldownPolicy::new("default", 1, Duration::from_secs(60))),
        );
        a.record_failure();
        let first = c.ranked().unwrap();
        assert_eq!(first[0].name(), "b");
    }
}
