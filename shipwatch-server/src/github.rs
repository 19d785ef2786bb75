//! GitHub API client.
//!
//! Authenticates as a GitHub App: a short-lived RS256 JWT is exchanged
//! for per-installation access tokens, which are cached until close to
//! expiry. The only endpoint this service needs is compare-commits.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::git::{CommitComparer, Comparison, CompareStatus, RepoRef};

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    status: String,
    ahead_by: u32,
    behind_by: u32,
    total_commits: u32,
    #[serde(default)]
    commits: Vec<CompareCommit>,
}

#[derive(Debug, Deserialize)]
struct CompareCommit {
    sha: String,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Self {
        let client = Client::builder()
            .user_agent("shipwatch/0.1.0")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        // Check if the cached token is still valid (with 5 minute buffer)
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "https://api.github.com/app/installations/{}/access_tokens",
            installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to request installation token")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub API error creating installation token: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub API error creating installation token: {}",
                status
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiry")?;
        let expires_at = SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(expires_at.timestamp().max(0) as u64);

        let mut cache = self.token_cache.write().await;
        cache.insert(installation_id, (token_response.token.clone(), expires_at));

        Ok(token_response.token)
    }

    pub async fn compare_commits(
        &self,
        repo: &RepoRef,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<Comparison> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/compare/{}...{}",
            repo.owner, repo.name, base_sha, head_sha
        );

        info!(
            "Comparing commits {} to {} in {}/{}",
            base_sha, head_sha, repo.owner, repo.name
        );

        let token = self.get_installation_token(repo.installation_id).await?;
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send compare commits request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub API error comparing commits: {} - {}",
                status, error_text
            );
            return Err(anyhow!("GitHub API error comparing commits: {}", status));
        }

        let compare_response: CompareResponse = response
            .json()
            .await
            .context("Failed to parse compare commits response")?;

        let status = CompareStatus::from_provider(&compare_response.status).ok_or_else(|| {
            anyhow!(
                "Unrecognized compare status from provider: {}",
                compare_response.status
            )
        })?;

        info!(
            "Compare result: {} (ahead: {}, behind: {}, total: {})",
            compare_response.status,
            compare_response.ahead_by,
            compare_response.behind_by,
            compare_response.total_commits
        );

        Ok(Comparison {
            status,
            commits: compare_response
                .commits
                .into_iter()
                .map(|c| c.sha)
                .collect(),
            total_commits: compare_response.total_commits,
        })
    }
}

#[async_trait]
impl CommitComparer for GitHubClient {
    async fn compare(&self, repo: &RepoRef, base_sha: &str, head_sha: &str) -> Result<Comparison> {
        if !crate::git::is_valid_sha(base_sha) || !crate::git::is_valid_sha(head_sha) {
            return Err(anyhow!(
                "Invalid SHA format: base='{}', head='{}'",
                base_sha,
                head_sha
            ));
        }
        self.compare_commits(repo, base_sha, head_sha).await
    }
}
