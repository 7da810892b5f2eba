//! Typed access to the container runtime.
//!
//! Every shell string handed to [`ContainerRuntime::exec`] is assembled from
//! constants; caller-supplied values go through
//! [`crate::session::shell_single_quote`] first. The CLI implementation
//! classifies podman's text output into the three error kinds the monitor
//! dispatches on.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Error taxonomy for runtime calls.
///
/// `Unavailable` and `NotFound` are terminal for a monitor; everything else
/// is `Transient` and leaves the previous health observation in place until
/// the next tick.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("podman is not available")]
    Unavailable,
    #[error("container not found")]
    NotFound,
    #[error("{0}")]
    Transient(String),
}

/// Normalised container record at the adapter boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    #[serde(rename = "createdAt", skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ports: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Result of inspecting a single container.
#[derive(Debug, Clone, Default)]
pub struct InspectRecord {
    pub name: String,
    pub status: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct MountRecord {
    pub source: String,
    pub destination: String,
}

/// Capability set the supervisor needs from the runtime. Tests substitute an
/// in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run `sh -lc <script>` inside the container and return combined output.
    async fn exec(&self, container: &str, script: &str) -> Result<String, RuntimeError>;

    /// Run `sh -lc <script>` detached, as the given user. Output is whatever
    /// podman printed before detaching.
    async fn exec_detached_as_user(
        &self,
        container: &str,
        user: &str,
        script: &str,
    ) -> Result<String, RuntimeError>;

    async fn inspect(&self, container: &str) -> Result<InspectRecord, RuntimeError>;

    /// List all containers, optionally filtered by `label=<key>` or
    /// `label=<key>=<value>`.
    async fn list(&self, label_filter: Option<&str>) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Read a file from inside the container. Missing files read as empty.
    async fn read_file(&self, container: &str, path: &str) -> Result<String, RuntimeError> {
        let script = format!(
            "cat {} 2>/dev/null || true",
            crate::session::shell_single_quote(path)
        );
        self.exec(container, &script).await
    }
}

/// Podman CLI adapter. Each invocation gets a hard deadline; a blown deadline
/// is reported as `Transient` so a hung `podman exec` cannot wedge a monitor.
pub struct PodmanCli {
    deadline: Duration,
}

impl PodmanCli {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = tokio::time::timeout(
            self.deadline,
            Command::new("podman")
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| {
            RuntimeError::Transient(format!(
                "podman {} timed out after {:?}",
                args.first().copied().unwrap_or_default(),
                self.deadline
            ))
        })?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::Unavailable
            } else {
                RuntimeError::Transient(e.to_string())
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{stdout}\n{stderr}");
        Err(classify_failure(&combined))
    }
}

fn classify_failure(text: &str) -> RuntimeError {
    let lower = text.to_lowercase();
    if lower.contains("no such container")
        || lower.contains("no container with name or id")
        || lower.contains("unable to find")
    {
        return RuntimeError::NotFound;
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        RuntimeError::Transient("podman command failed".to_string())
    } else {
        RuntimeError::Transient(trimmed.to_string())
    }
}

#[async_trait]
impl ContainerRuntime for PodmanCli {
    async fn exec(&self, container: &str, script: &str) -> Result<String, RuntimeError> {
        self.run(&["exec", container, "sh", "-lc", script]).await
    }

    async fn exec_detached_as_user(
        &self,
        container: &str,
        user: &str,
        script: &str,
    ) -> Result<String, RuntimeError> {
        self.run(&["exec", "-d", "--user", user, container, "sh", "-lc", script])
            .await
    }

    async fn inspect(&self, container: &str) -> Result<InspectRecord, RuntimeError> {
        let raw = self.run(&["inspect", "--format", "json", container]).await?;
        let parsed: Vec<InspectEntry> = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Transient(format!("parse inspect output: {e}")))?;
        let entry = parsed.into_iter().next().ok_or(RuntimeError::NotFound)?;

        Ok(InspectRecord {
            name: entry.name.trim_start_matches('/').to_string(),
            status: entry.state.status,
            running: entry.state.running,
            labels: entry.config.labels.unwrap_or_default(),
            mounts: entry
                .mounts
                .into_iter()
                .map(|m| MountRecord {
                    source: m.source,
                    destination: m.destination,
                })
                .collect(),
        })
    }

    async fn list(&self, label_filter: Option<&str>) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let filter_arg;
        let mut args = vec!["ps", "-a", "--format", "json"];
        if let Some(label) = label_filter {
            filter_arg = format!("label={label}");
            args.push("--filter");
            args.push(&filter_arg);
        }

        let raw = self.run(&args).await?;
        let parsed: Vec<PsEntry> = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Transient(format!("parse ps output: {e}")))?;

        Ok(parsed.into_iter().map(normalize_ps_entry).collect())
    }
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: InspectState,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
    #[serde(rename = "Mounts", default)]
    mounts: Vec<InspectMount>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectMount {
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "Destination", default)]
    destination: String,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Id", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
    #[serde(rename = "Ports", default)]
    ports: Option<Vec<PsPort>>,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct PsPort {
    #[serde(default)]
    host_port: u32,
    #[serde(default)]
    container_port: u32,
    #[serde(default)]
    protocol: String,
}

fn normalize_ps_entry(entry: PsEntry) -> ContainerRecord {
    let status = if entry.status.trim().is_empty() {
        entry.state.trim().to_string()
    } else {
        entry.status.trim().to_string()
    };

    let ports = entry
        .ports
        .unwrap_or_default()
        .iter()
        .map(|p| {
            if p.protocol.is_empty() {
                format!("{}->{}", p.host_port, p.container_port)
            } else {
                format!("{}->{}/{}", p.host_port, p.container_port, p.protocol)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    ContainerRecord {
        id: entry.id.trim().to_string(),
        name: entry.names.first().map(|n| n.trim().to_string()).unwrap_or_default(),
        image: entry.image,
        status,
        created_at: entry.created_at,
        ports,
        labels: entry.labels.unwrap_or_default(),
    }
}
