use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    /// 32-byte key used to decrypt per-repository webhook secrets at rest.
    pub secrets_key: [u8; 32],
    pub events_gateway_url: String,
    pub events_gateway_token: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let secrets_key = parse_secrets_key(
            &env::var("SECRETS_KEY").context("SECRETS_KEY environment variable is required")?,
        )?;

        let events_gateway_url = env::var("EVENTS_GATEWAY_URL")
            .context("EVENTS_GATEWAY_URL environment variable is required")?;

        let events_gateway_token = env::var("EVENTS_GATEWAY_TOKEN")
            .context("EVENTS_GATEWAY_TOKEN environment variable is required")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        Ok(Config {
            github_app_id,
            github_private_key,
            secrets_key,
            events_gateway_url,
            events_gateway_token,
            port,
            state_dir,
        })
    }
}

/// Parse the hex-encoded SECRETS_KEY into a 32-byte key.
pub fn parse_secrets_key(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim()).context("SECRETS_KEY must be hex-encoded")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("SECRETS_KEY must decode to exactly 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secrets_key_valid() {
        let key = parse_secrets_key(&"ab".repeat(32)).expect("should parse");
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn test_parse_secrets_key_trims_whitespace() {
        let value = format!("  {}\n", "cd".repeat(32));
        let key = parse_secrets_key(&value).expect("should parse");
        assert_eq!(key, [0xcd; 32]);
    }

    #[test]
    fn test_parse_secrets_key_rejects_wrong_length() {
        assert!(parse_secrets_key(&"ab".repeat(16)).is_err());
        assert!(parse_secrets_key(&"ab".repeat(33)).is_err());
    }

    #[test]
    fn test_parse_secrets_key_rejects_non_hex() {
        assert!(parse_secrets_key(&"zz".repeat(32)).is_err());
    }
}
