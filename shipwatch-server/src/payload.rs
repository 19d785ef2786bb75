//! Webhook payload parsing and type discrimination.
//!
//! The raw JSON body plus the `x-github-event` header are turned into a
//! closed, exhaustively-matched event type at this boundary, so nothing
//! downstream ever touches loosely-shaped JSON. Required fields are
//! checked here; environments and states outside the tracked sets parse
//! successfully but are flagged so the route can acknowledge the delivery
//! without processing it.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid JSON payload")]
    InvalidJson,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Deployment tiers this service tracks, ordered staging < production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Environment {
    Staging,
    Production,
}

impl Environment {
    /// Normalize a raw environment name. Comparison is case-insensitive;
    /// anything outside the tracked set returns `None`.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            _ => None,
        }
    }

    /// Task-facing representation (`tasks.deployment_status`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    /// Audit-record representation (`deployments.environment`).
    pub fn audit_str(&self) -> &'static str {
        match self {
            Self::Staging => "STAGING",
            Self::Production => "PRODUCTION",
        }
    }
}

/// Deployment outcomes this service tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    InProgress,
}

impl Outcome {
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "in_progress" => Some(Self::InProgress),
            _ => None,
        }
    }

    pub fn audit_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

/// A deployment environment as declared by the sender: either one of the
/// tracked tiers, or some other environment (e.g. "development") that we
/// acknowledge but do not process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentClass {
    Tracked(Environment),
    Untracked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeClass {
    Tracked(Outcome),
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatusEvent {
    pub deployment_id: u64,
    pub sha: String,
    pub environment: EnvironmentClass,
    pub outcome: OutcomeClass,
    pub repo_html_url: String,
    pub repo_full_name: String,
    /// `environment_url` when present, else `target_url`.
    pub deployment_url: Option<String>,
}

/// A webhook delivery after type discrimination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    DeploymentStatus(Box<DeploymentStatusEvent>),
    /// A well-formed delivery of an event type this service does not
    /// process (push, pull_request, ping, ...). Acknowledged with 202.
    Ignored { event: String },
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    deployment_status: Option<RawDeploymentStatus>,
    deployment: Option<RawDeployment>,
    repository: Option<RawRepository>,
}

#[derive(Debug, Deserialize)]
struct RawDeploymentStatus {
    state: Option<String>,
    target_url: Option<String>,
    environment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDeployment {
    id: Option<u64>,
    sha: Option<String>,
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    html_url: Option<String>,
    full_name: Option<String>,
}

/// Parse a raw webhook body for the declared event type.
pub fn parse(raw_body: &[u8], event_type: &str) -> Result<ParsedEvent, ParseError> {
    let payload: RawPayload =
        serde_json::from_slice(raw_body).map_err(|_| ParseError::InvalidJson)?;

    if event_type != "deployment_status" {
        return Ok(ParsedEvent::Ignored {
            event: event_type.to_string(),
        });
    }

    let status = payload
        .deployment_status
        .ok_or(ParseError::MissingField("deployment_status"))?;
    let deployment = payload
        .deployment
        .ok_or(ParseError::MissingField("deployment"))?;
    let repository = payload
        .repository
        .ok_or(ParseError::MissingField("repository"))?;

    let state = status
        .state
        .ok_or(ParseError::MissingField("deployment_status.state"))?;
    let sha = deployment
        .sha
        .ok_or(ParseError::MissingField("deployment.sha"))?;
    let environment = deployment
        .environment
        .ok_or(ParseError::MissingField("deployment.environment"))?;
    let repo_html_url = repository
        .html_url
        .ok_or(ParseError::MissingField("repository.html_url"))?;
    let repo_full_name = repository
        .full_name
        .ok_or(ParseError::MissingField("repository.full_name"))?;

    let environment = match Environment::from_raw(&environment) {
        Some(env) => EnvironmentClass::Tracked(env),
        None => EnvironmentClass::Untracked(environment),
    };
    let outcome = match Outcome::from_raw(&state) {
        Some(outcome) => OutcomeClass::Tracked(outcome),
        None => OutcomeClass::Unrecognized(state),
    };

    Ok(ParsedEvent::DeploymentStatus(Box::new(
        DeploymentStatusEvent {
            deployment_id: deployment.id.unwrap_or(0),
            sha,
            environment,
            outcome,
            repo_html_url,
            repo_full_name,
            deployment_url: status.environment_url.or(status.target_url),
        },
    )))
}
