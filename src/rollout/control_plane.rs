//! Deployment control plane bindings

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::backend::http::{build_client, header_map};
use crate::config::ControlPlaneConfig;
use crate::{Error, Result};

/// Command sent to the deployment platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PlaneCommand {
    /// Route `percent` of traffic to the canary
    SetWeight {
        /// Zero-based stage index
        stage: usize,
        /// Traffic percentage
        percent: u8,
    },
    /// Hold at the current weight
    Pause,
    /// Make the canary stable
    Promote,
    /// Send all traffic back to stable
    Rollback,
}

/// Traffic-shifting operations a rollout drives
#[async_trait]
pub trait DeploymentControlPlane: Send + Sync {
    /// Route `percent` of traffic to the canary for `stage`
    async fn set_weight(&self, stage: usize, percent: u8) -> Result<()>;

    /// Hold the rollout at its current weight
    async fn pause(&self) -> Result<()>;

    /// Make the canary the stable release
    async fn promote(&self) -> Result<()>;

    /// Send all traffic back to the stable release
    async fn rollback(&self) -> Result<()>;
}

/// Build the plane configured for `release`
pub fn from_config(
    release: &str,
    config: &ControlPlaneConfig,
    timeout: Duration,
) -> Result<Box<dyn DeploymentControlPlane>> {
    Ok(match config {
        ControlPlaneConfig::Log => Box::new(LoggingControlPlane::new(release)),
        ControlPlaneConfig::Http { url, headers } => {
            Box::new(HttpControlPlane::new(release, url, headers, timeout)?)
        }
    })
}

/// Dry-run plane: logs commands and keeps them for inspection
pub struct LoggingControlPlane {
    release: String,
    history: Mutex<Vec<PlaneCommand>>,
}

impl LoggingControlPlane {
    /// Create a plane for `release`
    #[must_use]
    pub fn new(release: &str) -> Self {
        Self {
            release: release.to_string(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Commands issued so far, oldest first
    pub fn history(&self) -> Vec<PlaneCommand> {
        self.history.lock().clone()
    }

    fn record(&self, command: PlaneCommand) {
        info!(release = %self.release, ?command, "Control plane command (dry run)");
        self.history.lock().push(command);
    }
}

#[async_trait]
impl DeploymentControlPlane for LoggingControlPlane {
    async fn set_weight(&self, stage: usize, percent: u8) -> Result<()> {
        self.record(PlaneCommand::SetWeight { stage, percent });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.record(PlaneCommand::Pause);
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        self.record(PlaneCommand::Promote);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record(PlaneCommand::Rollback);
        Ok(())
    }
}

/// POSTs each command as JSON to a rollout API
///
/// Body: `{"release": "...", "command": "set_weight", "stage": 1, "percent": 60}`.
/// Any non-2xx response is an [`Error::ControlPlane`].
pub struct HttpControlPlane {
    client: Client,
    url: String,
    headers: HeaderMap,
    release: String,
}

impl HttpControlPlane {
    /// Create a plane posting to `url`
    pub fn new(
        release: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
            headers: header_map(headers)?,
            release: release.to_string(),
        })
    }

    async fn send(&self, command: PlaneCommand) -> Result<()> {
        let mut body = serde_json::to_value(command)?;
        if let Some(object) = body.as_object_mut() {
            object.insert("release".to_string(), json!(self.release));
        }
        debug!(url = %self.url, ?command, "Sending control plane command");

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("{command:?} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ControlPlane(format!("{command:?} rejected with HTTP {status}: {text}")));
        }

        info!(release = %self.release, ?command, "Control plane command applied");
        Ok(())
    }
}

#[async_trait]
impl DeploymentControlPlane for HttpControlPlane {
    async fn set_weight(&self, stage: usize, percent: u8) -> Result<()> {
        self.send(PlaneCommand::SetWeight { stage, percent }).await
    }

    async fn pause(&self) -> Result<()> {
        self.send(PlaneCommand::Pause).await
    }

    async fn promote(&self) -> Result<()> {
        self.send(PlaneCommand::Promote).await
    }

    async fn rollback(&self) -> Result<()> {
        self.send(PlaneCommand::Rollback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}/rollout")
    }

    #[test]
    fn command_serialization() {
        assert_eq!(
            serde_json::to_value(PlaneCommand::SetWeight { stage: 1, percent: 60 }).unwrap(),
            json!({"command": "set_weight", "stage": 1, "percent": 60})
        );
        assert_eq!(
            serde_json::to_value(PlaneCommand::Rollback).unwrap(),
            json!({"command": "rollback"})
        );
    }

    #[tokio::test]
    async fn logging_plane_keeps_history() {
        let plane = LoggingControlPlane::new("v2");
        plane.set_weight(0, 20).await.unwrap();
        plane.pause().await.unwrap();
        plane.rollback().await.unwrap();
        assert_eq!(
            plane.history(),
            vec![
                PlaneCommand::SetWeight { stage: 0, percent: 20 },
                PlaneCommand::Pause,
                PlaneCommand::Rollback
            ]
        );
    }

    #[tokio::test]
    async fn http_plane_posts_commands() {
        let received = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&received);
        let url = serve(Router::new().route(
            "/rollout",
            post(move |Json(body): Json<Value>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(body);
                    StatusCode::NO_CONTENT
                }
            }),
        ))
        .await;

        let plane = HttpControlPlane::new("v2", &url, &HashMap::new(), Duration::from_secs(2)).unwrap();
        plane.set_weight(1, 60).await.unwrap();
        plane.promote().await.unwrap();

        let bodies = received.lock().clone();
        assert_eq!(
            bodies,
            vec![
                json!({"release": "v2", "command": "set_weight", "stage": 1, "percent": 60}),
                json!({"release": "v2", "command": "promote"}),
            ]
        );
    }

    #[tokio::test]
    async fn http_plane_surfaces_rejections() {
        let url = serve(Router::new().route(
            "/rollout",
            post(|| async { (StatusCode::CONFLICT, "locked") }),
        ))
        .await;

        let plane = HttpControlPlane::new("v2", &url, &HashMap::new(), Duration::from_secs(2)).unwrap();
        let err = plane.pause().await.unwrap_err();
        assert!(matches!(err, Error::ControlPlane(m) if m.contains("409") && m.contains("locked")));
    }
}
