//! Realtime notification fanout.
//!
//! Every task transition is announced on two channels: the workspace
//! channel (dashboards watching all tasks) and the per-task channel
//! (detail views). Publishing goes through the events gateway over HTTP.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use crate::payload::Environment;

/// Event name carried on both channels for a deployment-state change.
pub const DEPLOYMENT_STATUS_CHANGED: &str = "deployment-status-changed";

/// A task that just moved to a new deployment tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTransition {
    pub task_id: String,
    pub workspace_slug: String,
    pub environment: Environment,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<()>;
}

/// Announce one transition on its workspace and task channels.
///
/// The first publish failure propagates so the delivery is retried by the
/// sender; the gateway deduplicates on the payload, so a partial fanout
/// followed by a retry is harmless.
pub async fn fan_out(
    publisher: &dyn EventPublisher,
    transition: &DeploymentTransition,
) -> Result<()> {
    let payload = json!({
        "taskId": transition.task_id,
        "deploymentStatus": transition.environment.as_str(),
        "environment": transition.environment.audit_str(),
    });

    let workspace_channel = format!("workspace-{}", transition.workspace_slug);
    publisher
        .publish(&workspace_channel, DEPLOYMENT_STATUS_CHANGED, &payload)
        .await
        .with_context(|| format!("Failed to publish to {}", workspace_channel))?;

    let task_channel = format!("task-{}", transition.task_id);
    publisher
        .publish(&task_channel, DEPLOYMENT_STATUS_CHANGED, &payload)
        .await
        .with_context(|| format!("Failed to publish to {}", task_channel))?;

    info!(
        "Announced task {} -> {} on {} and {}",
        transition.task_id,
        transition.environment.as_str(),
        workspace_channel,
        task_channel
    );

    Ok(())
}

/// Publishes to the events gateway's HTTP trigger endpoint.
pub struct HttpEventPublisher {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpEventPublisher {
    pub fn new(base_url: String, token: String) -> Self {
        let client = Client::builder()
            .user_agent("shipwatch/0.1.0")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<()> {
        let url = format!("{}/events", self.base_url);
        let body = json!({
            "channel": channel,
            "event": event,
            "payload": payload,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("Failed to send event to gateway")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!(
                "Events gateway error publishing to {}: {} - {}",
                channel,
                status,
                error_text
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingPublisher {
        published: Mutex<Vec<(String, String, Value)>>,
        fail_channel: Option<String>,
    }

    impl RecordingPublisher {
        fn new() -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                fail_channel: None,
            }
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<()> {
            if self.fail_channel.as_deref() == Some(channel) {
                return Err(anyhow!("simulated gateway failure"));
            }
            self.published.lock().expect("mutex poisoned").push((
                channel.to_string(),
                event.to_string(),
                payload.clone(),
            ));
            Ok(())
        }
    }

    fn transition() -> DeploymentTransition {
        DeploymentTransition {
            task_id: "task-1".to_string(),
            workspace_slug: "acme".to_string(),
            environment: Environment::Staging,
        }
    }

    #[tokio::test]
    async fn test_fan_out_hits_both_channels() {
        let publisher = RecordingPublisher::new();
        fan_out(&publisher, &transition())
            .await
            .expect("should publish");

        let published = publisher.published.lock().expect("mutex poisoned");
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "workspace-acme");
        assert_eq!(published[1].0, "task-task-1");
        for (_, event, payload) in published.iter() {
            assert_eq!(event, DEPLOYMENT_STATUS_CHANGED);
            assert_eq!(payload["taskId"], "task-1");
            assert_eq!(payload["deploymentStatus"], "staging");
        }
    }

    #[tokio::test]
    async fn test_fan_out_workspace_failure_stops_fanout() {
        let mut publisher = RecordingPublisher::new();
        publisher.fail_channel = Some("workspace-acme".to_string());

        let result = fan_out(&publisher, &transition()).await;
        assert!(result.is_err());
        assert!(publisher
            .published
            .lock()
            .expect("mutex poisoned")
            .is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_task_channel_failure_propagates() {
        let mut publisher = RecordingPublisher::new();
        publisher.fail_channel = Some("task-task-1".to_string());

        let result = fan_out(&publisher, &transition()).await;
        assert!(result.is_err());
        // The workspace publish went through before the failure.
        assert_eq!(
            publisher.published.lock().expect("mutex poisoned").len(),
            1
        );
    }
}
