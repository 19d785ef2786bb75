//! Deployment-state reconciliation.
//!
//! The decision itself is a pure function over (current tier, target tier,
//! outcome), kept separate from the orchestration so every case can be
//! tested exhaustively. Task state only moves forward: null -> staging ->
//! production. Promotion also re-checks the rule inside the UPDATE, so a
//! redelivered or reordered webhook can never regress a task.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::db::{Database, NewDeployment, TaskRecord};
use crate::git::RepoRef;
use crate::notify::DeploymentTransition;
use crate::payload::{Environment, Outcome};
use crate::resolver::CommitResolver;

/// What a delivery does to one matched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Promote(Environment),
    /// Record the deployment but leave the task's state untouched.
    AuditOnly,
}

/// The forward-only state machine for one task.
pub fn decide(current: Option<Environment>, target: Environment, outcome: Outcome) -> Decision {
    // Failures and in-progress notifications never move state.
    if outcome != Outcome::Success {
        return Decision::AuditOnly;
    }

    match (current, target) {
        // Production is terminal.
        (Some(Environment::Production), _) => Decision::AuditOnly,
        // Same tier again: duplicate or redeploy.
        (Some(Environment::Staging), Environment::Staging) => Decision::AuditOnly,
        (Some(Environment::Staging), Environment::Production) => {
            Decision::Promote(Environment::Production)
        }
        // A task can reach production without a recorded staging stop.
        (None, target) => Decision::Promote(target),
    }
}

pub struct Reconciler {
    db: Arc<Database>,
    resolver: CommitResolver,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, resolver: CommitResolver) -> Self {
        Self { db, resolver }
    }

    /// Apply one deployment delivery to the repository's tasks.
    ///
    /// Writes one audit record per matched task whatever the outcome, and
    /// returns the transitions that actually happened (for fanout). A
    /// failure on one task is logged and does not block the others.
    pub async fn process(
        &self,
        repository: &crate::db::RepositoryRecord,
        environment: Environment,
        outcome: Outcome,
        deployed_sha: &str,
        deployment_url: Option<&str>,
    ) -> Result<Vec<DeploymentTransition>> {
        let repo_ref = RepoRef::from_full_name(&repository.full_name, repository.installation_id)
            .ok_or_else(|| {
            anyhow!(
                "Stored repository full_name is malformed: {}",
                repository.full_name
            )
        })?;

        let merged = self.db.merged_tasks(&repository.id)?;
        let candidates: Vec<TaskRecord> = merged
            .into_iter()
            .filter(|task| is_candidate(task.deployment_status, environment))
            .collect();

        if candidates.is_empty() {
            info!(
                "No candidate tasks for {} deploy of {} in {}",
                environment.as_str(),
                deployed_sha,
                repository.full_name
            );
            return Ok(Vec::new());
        }

        let baseline = match environment {
            Environment::Staging => self.db.latest_staging_baseline(&repository.id)?,
            Environment::Production => None,
        };

        let included = self
            .resolver
            .resolve(
                &repo_ref,
                environment,
                deployed_sha,
                baseline.as_deref(),
                candidates,
            )
            .await;

        info!(
            "{} deploy of {} in {} carries {} task(s)",
            environment.as_str(),
            deployed_sha,
            repository.full_name,
            included.len()
        );

        let mut transitions = Vec::new();
        for task in included {
            if let Err(e) = self.apply(repository, &task, environment, outcome, deployed_sha, deployment_url, &mut transitions) {
                warn!(
                    "Failed to apply {} deployment to task {}: {}",
                    environment.as_str(),
                    task.id,
                    e
                );
            }
        }

        Ok(transitions)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        repository: &crate::db::RepositoryRecord,
        task: &TaskRecord,
        environment: Environment,
        outcome: Outcome,
        deployed_sha: &str,
        deployment_url: Option<&str>,
        transitions: &mut Vec<DeploymentTransition>,
    ) -> Result<()> {
        self.db.insert_deployment(&NewDeployment {
            task_id: &task.id,
            repository_id: &repository.id,
            commit_sha: deployed_sha,
            environment,
            outcome,
            deployment_url,
        })?;

        match decide(task.deployment_status, environment, outcome) {
            Decision::AuditOnly => {}
            Decision::Promote(target) => {
                // The UPDATE re-checks monotonicity; false means a
                // concurrent or redelivered event got there first.
                if self.db.promote_task(&task.id, target, Utc::now())? {
                    transitions.push(DeploymentTransition {
                        task_id: task.id.clone(),
                        workspace_slug: repository.workspace_slug.clone(),
                        environment: target,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Whether a task's current tier makes it eligible for this delivery.
/// Tasks already at or past the target tier are left alone.
fn is_candidate(current: Option<Environment>, target: Environment) -> bool {
    match current {
        None => true,
        Some(tier) => tier < target,
    }
}
