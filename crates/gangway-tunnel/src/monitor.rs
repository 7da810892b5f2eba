//! Per-container monitor worker.
//!
//! One cooperative task per container: tick, probe, map health to a status,
//! publish on change. Progress is any status change or health-boolean flip;
//! a monitor that sees none for `progress_timeout` writes a terminal failure
//! instead of polling forever.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TunnelConfig;
use crate::notifier::Notifier;
use crate::probe::{self, Health};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::state::{AUTH_REQUIRED_MESSAGE, TunnelState, TunnelStatus};
use crate::store::TunnelStore;

pub const TIMEOUT_MESSAGE: &str = "Tunnel bootstrap timed out.";
pub const CONTAINER_GONE_MESSAGE: &str = "Container not found";
pub const RUNTIME_UNAVAILABLE_MESSAGE: &str = "Runtime unavailable";

/// Map one health observation to a status.
///
/// Liveness gates everything; a present token wins over a pending auth
/// prompt, so `blocked` resolves to `ready` the moment OAuth completes.
pub fn evaluate_health(health: &Health) -> TunnelStatus {
    if !health.process_alive {
        return TunnelStatus::Failed;
    }
    if health.token_present {
        return TunnelStatus::Ready;
    }
    if health.auth_required {
        return TunnelStatus::Blocked;
    }
    TunnelStatus::Starting
}

/// Publishable state for a derived status. The device code travels only with
/// `blocked`; `ready` and `starting` never carry one.
pub fn state_from_health(status: TunnelStatus, health: &Health) -> TunnelState {
    let mut state = TunnelState::with_status(status);
    if status == TunnelStatus::Blocked {
        state.code = health.device_code.clone();
        state.message = AUTH_REQUIRED_MESSAGE.to_string();
    }
    state
}

/// Write a state and fan the new snapshot out iff the value changed.
pub(crate) fn write_state(
    store: &TunnelStore,
    notifier: &Notifier,
    container_id: &str,
    state: TunnelState,
) -> bool {
    if store.set(container_id, state) {
        notifier.publish(&store.snapshot());
        return true;
    }
    false
}

/// The long-lived worker for one container. Owned by the supervisor's
/// registry; holds no reference back to it.
pub(crate) struct Monitor {
    pub container_id: String,
    pub session_id: String,
    pub host_token_dir: String,
    pub status: TunnelStatus,
    pub cancel: CancellationToken,
}

impl Monitor {
    pub(crate) async fn run(
        mut self,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<TunnelStore>,
        notifier: Arc<Notifier>,
        config: TunnelConfig,
    ) {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it so
        // the loop runs on poll-interval boundaries like the rest.
        ticker.tick().await;

        let mut last_progress = Instant::now();
        let mut last_health: Option<Health> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(container = %self.container_id, "tunnel monitor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let probed = probe::probe(
                runtime.as_ref(),
                &self.container_id,
                &self.session_id,
                &self.host_token_dir,
                &config,
            )
            .await;

            // A stop that landed while the probe was in flight must win: no
            // store write may follow a completed stop request.
            if self.cancel.is_cancelled() {
                debug!(container = %self.container_id, "tunnel monitor stopped");
                return;
            }

            let health = match probed {
                Ok(health) => health,
                Err(RuntimeError::NotFound) => {
                    write_state(
                        &store,
                        &notifier,
                        &self.container_id,
                        TunnelState::failed(CONTAINER_GONE_MESSAGE),
                    );
                    return;
                }
                Err(RuntimeError::Unavailable) => {
                    write_state(
                        &store,
                        &notifier,
                        &self.container_id,
                        TunnelState::failed(RUNTIME_UNAVAILABLE_MESSAGE),
                    );
                    return;
                }
                Err(RuntimeError::Transient(reason)) => {
                    // Keep the previous observation; the stall clock keeps
                    // running so a permanently broken runtime still times out.
                    debug!(container = %self.container_id, %reason, "transient runtime error during health probe");
                    if last_progress.elapsed() > config.progress_timeout {
                        self.fail_timed_out(&store, &notifier);
                        return;
                    }
                    continue;
                }
            };

            let new_status = evaluate_health(&health);
            let flipped = match &last_health {
                Some(prev) => {
                    prev.auth_required != health.auth_required
                        || prev.token_present != health.token_present
                }
                None => health.auth_required || health.token_present,
            };

            if new_status != self.status || flipped {
                last_progress = Instant::now();
                self.status = new_status;
                write_state(
                    &store,
                    &notifier,
                    &self.container_id,
                    state_from_health(new_status, &health),
                );
            }
            last_health = Some(health);

            if new_status == TunnelStatus::Failed {
                warn!(container = %self.container_id, session = %self.session_id, "tunnel process died");
                return;
            }

            if last_progress.elapsed() > config.progress_timeout {
                self.fail_timed_out(&store, &notifier);
                return;
            }
        }
    }

    fn fail_timed_out(&self, store: &TunnelStore, notifier: &Notifier) {
        warn!(
            container = %self.container_id,
            session = %self.session_id,
            "no tunnel progress within timeout"
        );
        write_state(
            store,
            notifier,
            &self.container_id,
            TunnelState::failed(TIMEOUT_MESSAGE),
        );
    }
}
