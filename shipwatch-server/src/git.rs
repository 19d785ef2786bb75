//! Commit ancestry primitives.
//!
//! The GitHub Compare API reports the relationship of `head` to `base` as
//! one of four statuses. For deployment correlation, a task's merge commit
//! is "included" in a deployed commit when the deployed commit is the
//! merge commit itself (`identical`) or a descendant of it (`ahead`).

use anyhow::Result;
use async_trait::async_trait;

/// Relationship of `head` relative to `base` in `compare(base...head)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareStatus {
    Identical,
    /// `head` is a descendant of `base`.
    Ahead,
    /// `head` is an ancestor of `base`.
    Behind,
    Diverged,
}

impl CompareStatus {
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "identical" => Some(Self::Identical),
            "ahead" => Some(Self::Ahead),
            "behind" => Some(Self::Behind),
            "diverged" => Some(Self::Diverged),
            _ => None,
        }
    }

    /// Whether `base` counts as included in `head`'s history.
    /// "ahead" and "identical" are inclusion; "behind" and "diverged" are not.
    pub fn includes(self) -> bool {
        matches!(self, Self::Identical | Self::Ahead)
    }
}

/// Result of a compare-commits call.
///
/// `commits` lists the commits between base (exclusive) and head
/// (inclusive) and may be truncated by the provider for long ranges, so
/// it must never be the sole basis for a production promotion decision.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub status: CompareStatus,
    pub commits: Vec<String>,
    pub total_commits: u32,
}

/// A repository as addressed on the source-control provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub installation_id: u64,
}

impl RepoRef {
    /// Build from an `owner/name` pair as stored on the repository row.
    pub fn from_full_name(full_name: &str, installation_id: u64) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            installation_id,
        })
    }
}

/// Source-control compare capability, abstracted so tests can substitute
/// a fake commit graph for the GitHub API.
#[async_trait]
pub trait CommitComparer: Send + Sync {
    async fn compare(&self, repo: &RepoRef, base_sha: &str, head_sha: &str) -> Result<Comparison>;
}

/// Basic validation of SHA format.
pub fn is_valid_sha(sha: &str) -> bool {
    // Git SHAs are hexadecimal and typically 7-40 characters long
    sha.len() >= 7 && sha.len() <= 40 && sha.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_status_mapping() {
        assert_eq!(
            CompareStatus::from_provider("identical"),
            Some(CompareStatus::Identical)
        );
        assert_eq!(
            CompareStatus::from_provider("ahead"),
            Some(CompareStatus::Ahead)
        );
        assert_eq!(
            CompareStatus::from_provider("behind"),
            Some(CompareStatus::Behind)
        );
        assert_eq!(
            CompareStatus::from_provider("diverged"),
            Some(CompareStatus::Diverged)
        );
        assert_eq!(CompareStatus::from_provider("unknown"), None);
    }

    #[test]
    fn test_inclusion_boundary() {
        assert!(CompareStatus::Identical.includes());
        assert!(CompareStatus::Ahead.includes());
        assert!(!CompareStatus::Behind.includes());
        assert!(!CompareStatus::Diverged.includes());
    }

    #[test]
    fn test_repo_ref_from_full_name() {
        let repo = RepoRef::from_full_name("acme/api", 7).expect("should parse");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "api");
        assert_eq!(repo.installation_id, 7);

        assert!(RepoRef::from_full_name("acme", 7).is_none());
        assert!(RepoRef::from_full_name("/api", 7).is_none());
        assert!(RepoRef::from_full_name("acme/", 7).is_none());
        assert!(RepoRef::from_full_name("a/b/c", 7).is_none());
    }

    #[test]
    fn test_is_valid_sha() {
        assert!(is_valid_sha("abc1234"));
        assert!(is_valid_sha(&"a".repeat(40)));
        assert!(!is_valid_sha("abc123")); // too short
        assert!(!is_valid_sha(&"a".repeat(41)));
        assert!(!is_valid_sha("not-a-sha"));
    }
}
