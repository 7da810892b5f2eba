//! The tunnel supervisor: monitor registry plus the operations collaborators
//! call. One lock guards the registry; it is never held across a runtime
//! call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::config::TunnelConfig;
use crate::enrich::{EnrichedContainer, enrich_containers};
use crate::monitor::{Monitor, write_state};
use crate::notifier::{Notifier, Subscription};
use crate::probe;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::session::{self, TUNNEL_SESSION_LABEL};
use crate::state::{TunnelState, TunnelStatus};
use crate::store::{StateSnapshot, TunnelStore};

pub const PROCESS_NOT_RUNNING_MESSAGE: &str = "Tunnel process not running.";

struct MonitorHandle {
    session_id: String,
    cancel: CancellationToken,
}

struct Inner {
    config: TunnelConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<TunnelStore>,
    notifier: Arc<Notifier>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    root: CancellationToken,
}

/// Facade over the whole tunnel subsystem. Cheap to clone; all clones share
/// one registry, store and notifier.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: TunnelConfig) -> Self {
        let notifier = Arc::new(Notifier::new(config.notifier_queue));
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                store: Arc::new(TunnelStore::new()),
                notifier,
                monitors: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Bootstrap a tunnel with a fresh session id. Returns the id so the
    /// caller can correlate logs and labels.
    pub async fn bootstrap(
        &self,
        container_id: &str,
        workspace_name: &str,
        host_token_dir: &str,
    ) -> (String, TunnelState) {
        let session_id = session::generate_session_id();
        let state = self
            .bootstrap_with_session(container_id, workspace_name, host_token_dir, &session_id)
            .await;
        (session_id, state)
    }

    /// Bootstrap with a caller-provided session id. Container creators
    /// generate the id first so they can stamp the `tunnel_session` label at
    /// create time, then hand it here.
    pub async fn bootstrap_with_session(
        &self,
        container_id: &str,
        workspace_name: &str,
        host_token_dir: &str,
        session_id: &str,
    ) -> TunnelState {
        let outcome = bootstrap::bootstrap(
            self.inner.runtime.as_ref(),
            container_id,
            workspace_name,
            session_id,
        )
        .await;

        write_state(
            &self.inner.store,
            &self.inner.notifier,
            container_id,
            outcome.state.clone(),
        );

        if outcome.state.status == TunnelStatus::Starting {
            self.start_monitor(
                container_id,
                session_id,
                host_token_dir,
                TunnelStatus::Starting,
            );
        } else {
            warn!(
                container = container_id,
                status = %outcome.state.status,
                message = %outcome.state.message,
                "tunnel bootstrap did not reach starting"
            );
        }

        outcome.state
    }

    /// Spawn the monitor worker for a container, replacing (and stopping)
    /// any previous one so at most one lives per container.
    pub fn start_monitor(
        &self,
        container_id: &str,
        session_id: &str,
        host_token_dir: &str,
        initial_status: TunnelStatus,
    ) {
        let cancel = self.inner.root.child_token();
        let monitor = Monitor {
            container_id: container_id.to_string(),
            session_id: session_id.to_string(),
            host_token_dir: host_token_dir.to_string(),
            status: initial_status,
            cancel: cancel.clone(),
        };

        {
            let mut monitors = self
                .inner
                .monitors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = monitors.insert(
                container_id.to_string(),
                MonitorHandle {
                    session_id: session_id.to_string(),
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
            }
        }

        debug!(container = container_id, session = session_id, "tunnel monitor started");

        let inner = self.inner.clone();
        let owner_container = container_id.to_string();
        let owner_session = session_id.to_string();
        tokio::spawn(async move {
            monitor
                .run(
                    inner.runtime.clone(),
                    inner.store.clone(),
                    inner.notifier.clone(),
                    inner.config.clone(),
                )
                .await;

            // Deregister unless a newer monitor already took the slot.
            let mut monitors = inner.monitors.lock().unwrap_or_else(|e| e.into_inner());
            if monitors
                .get(&owner_container)
                .is_some_and(|handle| handle.session_id == owner_session)
            {
                monitors.remove(&owner_container);
            }
        });
    }

    /// Stop and forget the monitor for a container. Safe to call repeatedly
    /// and for containers that were never monitored.
    pub fn stop_monitor(&self, container_id: &str) {
        let handle = {
            let mut monitors = self
                .inner
                .monitors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            monitors.remove(container_id)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            debug!(container = container_id, "tunnel monitor stop requested");
        }
    }

    /// Deletion path: stop the monitor and drop all state for the container
    /// (including short-vs-long id aliases).
    pub fn clear(&self, container_id: &str) {
        self.stop_monitor(container_id);
        if self.inner.store.clear(container_id) {
            self.inner.notifier.publish(&self.inner.store.snapshot());
        }
    }

    pub fn get_state(&self, container_id: &str) -> Option<TunnelState> {
        self.inner.store.get(container_id)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.store.snapshot()
    }

    /// Subscribe to state snapshots; the current snapshot arrives first.
    pub fn subscribe(&self) -> Subscription {
        self.inner.notifier.subscribe(self.inner.store.snapshot())
    }

    pub fn monitor_count(&self) -> usize {
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Re-attach monitors to containers that carry a tunnel session label,
    /// typically at process start. Containers whose tunnel process is gone
    /// get a terminal state instead of a monitor; store entries for vanished
    /// containers are pruned.
    pub async fn reconcile(&self) -> Result<(), RuntimeError> {
        let containers = self.inner.runtime.list(Some(TUNNEL_SESSION_LABEL)).await?;

        let known_ids: Vec<String> = containers
            .iter()
            .map(|c| c.id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        if self.inner.store.prune(&known_ids) {
            self.inner.notifier.publish(&self.inner.store.snapshot());
        }

        for container in containers {
            let container_id = container.id.trim().to_string();
            if container_id.is_empty() {
                continue;
            }
            let Some(session_id) = container
                .labels
                .get(TUNNEL_SESSION_LABEL)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
            else {
                continue;
            };

            let host_token_dir = self.derive_host_token_dir(&container_id).await;

            let health = match probe::probe(
                self.inner.runtime.as_ref(),
                &container_id,
                &session_id,
                &host_token_dir,
                &self.inner.config,
            )
            .await
            {
                Ok(health) => health,
                Err(RuntimeError::Unavailable) => return Err(RuntimeError::Unavailable),
                Err(e) => {
                    debug!(container = %container_id, error = %e, "skipping container during reconcile");
                    continue;
                }
            };

            if health.process_alive {
                let status = crate::monitor::evaluate_health(&health);
                write_state(
                    &self.inner.store,
                    &self.inner.notifier,
                    &container_id,
                    crate::monitor::state_from_health(status, &health),
                );
                self.start_monitor(&container_id, &session_id, &host_token_dir, status);
                info!(container = %container_id, session = %session_id, status = %status, "reconciled tunnel session");
            } else {
                write_state(
                    &self.inner.store,
                    &self.inner.notifier,
                    &container_id,
                    TunnelState::failed(PROCESS_NOT_RUNNING_MESSAGE),
                );
                info!(container = %container_id, session = %session_id, "tunnel session found dead during reconcile");
            }
        }

        Ok(())
    }

    /// List all containers with tunnel fields overlaid. Each pass prunes
    /// store entries whose container no longer exists.
    pub async fn list_enriched(&self) -> Result<Vec<EnrichedContainer>, RuntimeError> {
        let containers = self.inner.runtime.list(None).await?;

        let known_ids: Vec<String> = containers
            .iter()
            .map(|c| c.id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        if self.inner.store.prune(&known_ids) {
            self.inner.notifier.publish(&self.inner.store.snapshot());
        }

        Ok(enrich_containers(containers, &self.inner.store.snapshot()))
    }

    /// The host side of the container's `.vscode` bind mount, where the CLI
    /// writes its token file. Empty when the mount cannot be derived.
    async fn derive_host_token_dir(&self, container_id: &str) -> String {
        match self.inner.runtime.inspect(container_id).await {
            Ok(record) => record
                .mounts
                .iter()
                .find(|m| m.destination.trim_end_matches('/').ends_with("/.vscode"))
                .map(|m| m.source.clone())
                .unwrap_or_default(),
            Err(e) => {
                debug!(container = container_id, error = %e, "could not derive host token dir");
                String::new()
            }
        }
    }

    /// Stop every monitor and refuse new work. Workers observe the root
    /// token and exit at their next loop head.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        let mut monitors = self
            .inner
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        monitors.clear();
        info!("tunnel supervisor shut down");
    }
}
