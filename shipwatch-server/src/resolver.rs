//! Correlates a deployed commit with the merged tasks it carries.
//!
//! Staging deployments roll forward from the previous successful staging
//! deployment, so one compare call over that range answers for every
//! candidate at once. Production has no reliable baseline ordering (and
//! the provider truncates long commit ranges), so each candidate's merge
//! commit is checked for ancestry individually.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::db::TaskRecord;
use crate::git::{CommitComparer, RepoRef};
use crate::payload::Environment;

pub struct CommitResolver {
    comparer: Arc<dyn CommitComparer>,
}

impl CommitResolver {
    pub fn new(comparer: Arc<dyn CommitComparer>) -> Self {
        Self { comparer }
    }

    /// Of the candidate tasks, which ones does the deployed commit carry?
    ///
    /// A task with a merge commit equal to the deployed commit is always
    /// included, with no API call. A compare failure never fails the whole
    /// delivery: the affected task is skipped and picked up by a later
    /// deployment event.
    pub async fn resolve(
        &self,
        repo: &RepoRef,
        environment: Environment,
        deployed_sha: &str,
        staging_baseline: Option<&str>,
        candidates: Vec<TaskRecord>,
    ) -> Vec<TaskRecord> {
        if candidates.is_empty() {
            return Vec::new();
        }

        match environment {
            Environment::Staging => {
                self.resolve_staging(repo, deployed_sha, staging_baseline, candidates)
                    .await
            }
            Environment::Production => {
                self.resolve_per_task(repo, deployed_sha, candidates).await
            }
        }
    }

    async fn resolve_staging(
        &self,
        repo: &RepoRef,
        deployed_sha: &str,
        baseline: Option<&str>,
        candidates: Vec<TaskRecord>,
    ) -> Vec<TaskRecord> {
        // First staging deployment for the repository: no range to scan.
        let Some(baseline) = baseline else {
            info!(
                "No staging baseline for {}/{}; verifying each task individually",
                repo.owner, repo.name
            );
            return self.resolve_per_task(repo, deployed_sha, candidates).await;
        };

        if baseline == deployed_sha {
            // Redeploy of the same commit. The range is empty, so only
            // exact merge-commit matches can apply.
            return candidates
                .into_iter()
                .filter(|t| t.merge_commit_sha.as_deref() == Some(deployed_sha))
                .collect();
        }

        let comparison = match self.comparer.compare(repo, baseline, deployed_sha).await {
            Ok(comparison) => comparison,
            Err(e) => {
                warn!(
                    "Compare {}..{} failed for {}/{}; verifying each task individually: {}",
                    baseline, deployed_sha, repo.owner, repo.name, e
                );
                return self.resolve_per_task(repo, deployed_sha, candidates).await;
            }
        };

        if !comparison.status.includes() {
            // Rollback or history rewrite since the last staging success.
            // The baseline range is meaningless, so check ancestry per task.
            warn!(
                "Staging deploy {} is {:?} relative to baseline {}; verifying each task individually",
                deployed_sha, comparison.status, baseline
            );
            return self.resolve_per_task(repo, deployed_sha, candidates).await;
        }

        let truncated = (comparison.commits.len() as u32) < comparison.total_commits;
        let range: HashSet<&str> = comparison.commits.iter().map(String::as_str).collect();

        let mut included = Vec::new();
        let mut unresolved = Vec::new();
        for task in candidates {
            let Some(merge_sha) = task.merge_commit_sha.as_deref() else {
                continue;
            };
            if merge_sha == deployed_sha || range.contains(merge_sha) {
                included.push(task);
            } else if truncated {
                // Absent from a truncated list proves nothing.
                unresolved.push(task);
            }
        }

        if !unresolved.is_empty() {
            let mut verified = self
                .resolve_per_task(repo, deployed_sha, unresolved)
                .await;
            included.append(&mut verified);
        }

        included
    }

    async fn resolve_per_task(
        &self,
        repo: &RepoRef,
        deployed_sha: &str,
        candidates: Vec<TaskRecord>,
    ) -> Vec<TaskRecord> {
        let checks = candidates.into_iter().filter_map(|task| {
            let merge_sha = task.merge_commit_sha.clone()?;
            Some(async move {
                if merge_sha == deployed_sha {
                    return Some(task);
                }
                match self.comparer.compare(repo, &merge_sha, deployed_sha).await {
                    Ok(comparison) if comparison.status.includes() => Some(task),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            "Ancestry check for task {} ({}..{}) failed; skipping: {}",
                            task.id, merge_sha, deployed_sha, e
                        );
                        None
                    }
                }
            })
        });

        join_all(checks).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::git::{CompareStatus, Comparison};

    /// Fake commit graph: each commit maps to its parent, and compare
    /// walks the ancestry chain from head back to base.
    struct FakeComparer {
        parents: HashMap<String, String>,
        truncate_to: Option<usize>,
        fail_pairs: Vec<(String, String)>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeComparer {
        fn new(edges: &[(&str, &str)]) -> Self {
            Self {
                parents: edges
                    .iter()
                    .map(|(child, parent)| (child.to_string(), parent.to_string()))
                    .collect(),
                truncate_to: None,
                fail_pairs: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn ancestry_path(&self, base: &str, head: &str) -> Option<Vec<String>> {
            let mut path = Vec::new();
            let mut cursor = head.to_string();
            loop {
                if cursor == base {
                    path.reverse();
                    return Some(path);
                }
                path.push(cursor.clone());
                cursor = self.parents.get(&cursor)?.clone();
            }
        }
    }

    #[async_trait]
    impl CommitComparer for FakeComparer {
        async fn compare(
            &self,
            _repo: &RepoRef,
            base_sha: &str,
            head_sha: &str,
        ) -> Result<Comparison> {
            self.calls
                .lock()
                .expect("mutex poisoned")
                .push((base_sha.to_string(), head_sha.to_string()));

            if self
                .fail_pairs
                .iter()
                .any(|(b, h)| b == base_sha && h == head_sha)
            {
                return Err(anyhow!("simulated provider failure"));
            }

            if base_sha == head_sha {
                return Ok(Comparison {
                    status: CompareStatus::Identical,
                    commits: Vec::new(),
                    total_commits: 0,
                });
            }

            if let Some(path) = self.ancestry_path(base_sha, head_sha) {
                let total = path.len() as u32;
                let commits = match self.truncate_to {
                    Some(n) => path.into_iter().take(n).collect(),
                    None => path,
                };
                return Ok(Comparison {
                    status: CompareStatus::Ahead,
                    commits,
                    total_commits: total,
                });
            }
            if self.ancestry_path(head_sha, base_sha).is_some() {
                return Ok(Comparison {
                    status: CompareStatus::Behind,
                    commits: Vec::new(),
                    total_commits: 0,
                });
            }
            Ok(Comparison {
                status: CompareStatus::Diverged,
                commits: Vec::new(),
                total_commits: 0,
            })
        }
    }

    fn task(id: &str, merge_sha: Option<&str>) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            repository_id: "repo-1".to_string(),
            title: format!("Task {}", id),
            merge_commit_sha: merge_sha.map(str::to_string),
            pr_status: Some("merged".to_string()),
            deployment_status: None,
            deployed_to_staging_at: None,
            deployed_to_production_at: None,
        }
    }

    fn repo() -> RepoRef {
        RepoRef {
            owner: "acme".to_string(),
            name: "api".to_string(),
            installation_id: 1,
        }
    }

    // Linear history used by most tests: base <- m1 <- m2 <- head.
    fn linear_graph() -> FakeComparer {
        FakeComparer::new(&[
            ("merge0001", "base0001"),
            ("merge0002", "merge0001"),
            ("head0001", "merge0002"),
        ])
    }

    fn ids(tasks: &[TaskRecord]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_staging_range_includes_tasks_in_window() {
        let resolver = CommitResolver::new(Arc::new(linear_graph()));
        let candidates = vec![
            task("t1", Some("merge0001")),
            task("t2", Some("merge0002")),
            task("t3", Some("aaaa9999")), // unrelated branch
        ];

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "head0001",
                Some("base0001"),
                candidates,
            )
            .await;

        assert_eq!(ids(&included), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_staging_exact_match_deployed_sha() {
        let resolver = CommitResolver::new(Arc::new(linear_graph()));
        let candidates = vec![task("t1", Some("head0001"))];

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "head0001",
                Some("base0001"),
                candidates,
            )
            .await;

        assert_eq!(ids(&included), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_staging_no_baseline_falls_back_to_per_task() {
        let comparer = Arc::new(linear_graph());
        let resolver = CommitResolver::new(comparer.clone());
        let candidates = vec![
            task("t1", Some("merge0001")),
            task("t2", Some("aaaa9999")),
        ];

        let included = resolver
            .resolve(&repo(), Environment::Staging, "head0001", None, candidates)
            .await;

        assert_eq!(ids(&included), vec!["t1"]);
        // One ancestry check per candidate, no range call.
        let calls = comparer.calls.lock().expect("mutex poisoned");
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn test_staging_redeploy_of_baseline_only_exact_matches() {
        let comparer = Arc::new(linear_graph());
        let resolver = CommitResolver::new(comparer.clone());
        let candidates = vec![
            task("t1", Some("head0001")),
            task("t2", Some("merge0001")),
        ];

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "head0001",
                Some("head0001"),
                candidates,
            )
            .await;

        assert_eq!(ids(&included), vec!["t1"]);
        assert!(comparer.calls.lock().expect("mutex poisoned").is_empty());
    }

    #[tokio::test]
    async fn test_staging_rollback_behind_baseline_verifies_per_task() {
        // Baseline is head0001; deploy rolls back to merge0001.
        let resolver = CommitResolver::new(Arc::new(linear_graph()));
        let candidates = vec![
            task("t1", Some("merge0001")), // exact match with rolled-back deploy
            task("t2", Some("merge0002")), // not carried by the rollback
        ];

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "merge0001",
                Some("head0001"),
                candidates,
            )
            .await;

        assert_eq!(ids(&included), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_staging_truncated_range_verifies_missing_tasks() {
        let mut comparer = linear_graph();
        comparer.truncate_to = Some(1);
        let resolver = CommitResolver::new(Arc::new(comparer));
        let candidates = vec![
            task("t1", Some("merge0001")),
            task("t2", Some("merge0002")),
        ];

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "head0001",
                Some("base0001"),
                candidates,
            )
            .await;

        // merge0001 survives truncation; merge0002 is re-verified per task.
        let mut got = ids(&included);
        got.sort();
        assert_eq!(got, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_staging_compare_failure_falls_back_to_per_task() {
        let mut comparer = linear_graph();
        comparer.fail_pairs = vec![("base0001".to_string(), "head0001".to_string())];
        let resolver = CommitResolver::new(Arc::new(comparer));
        let candidates = vec![task("t1", Some("merge0001"))];

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "head0001",
                Some("base0001"),
                candidates,
            )
            .await;

        assert_eq!(ids(&included), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_production_checks_each_task() {
        let resolver = CommitResolver::new(Arc::new(linear_graph()));
        let candidates = vec![
            task("t1", Some("merge0001")),
            task("t2", Some("merge0002")),
            task("t3", Some("aaaa9999")),
        ];

        let included = resolver
            .resolve(&repo(), Environment::Production, "head0001", None, candidates)
            .await;

        assert_eq!(ids(&included), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_production_compare_failure_skips_only_that_task() {
        let mut comparer = linear_graph();
        comparer.fail_pairs = vec![("merge0001".to_string(), "head0001".to_string())];
        let resolver = CommitResolver::new(Arc::new(comparer));
        let candidates = vec![
            task("t1", Some("merge0001")),
            task("t2", Some("merge0002")),
        ];

        let included = resolver
            .resolve(&repo(), Environment::Production, "head0001", None, candidates)
            .await;

        assert_eq!(ids(&included), vec!["t2"]);
    }

    #[tokio::test]
    async fn test_empty_candidates_makes_no_calls() {
        let comparer = Arc::new(linear_graph());
        let resolver = CommitResolver::new(comparer.clone());

        let included = resolver
            .resolve(
                &repo(),
                Environment::Staging,
                "head0001",
                Some("base0001"),
                Vec::new(),
            )
            .await;

        assert!(included.is_empty());
        assert!(comparer.calls.lock().expect("mutex poisoned").is_empty());
    }
}
