use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_PROGRESS_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_NOTIFIER_QUEUE: usize = 16;
const DEFAULT_RUNTIME_CALL_DEADLINE_MS: u64 = 10_000;
const DEFAULT_TOKEN_WALK_DEPTH: usize = 4;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

/// Tuning knobs for the tunnel supervisor. `from_env` applies `GANGWAY_*`
/// overrides; everything is clamped to a sane operating range.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Time between health checks for each monitored container.
    pub poll_interval: Duration,
    /// Maximum stall (no observed status/health change) before a monitor
    /// gives up and writes a failed state.
    pub progress_timeout: Duration,
    /// Bounded per-subscriber queue length for state snapshots.
    pub notifier_queue: usize,
    /// Hard deadline applied to every exec/inspect/list runtime call.
    pub runtime_call_deadline: Duration,
    /// Maximum directory depth when walking a host token dir for token.json.
    pub token_walk_depth: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            progress_timeout: Duration::from_millis(DEFAULT_PROGRESS_TIMEOUT_MS),
            notifier_queue: DEFAULT_NOTIFIER_QUEUE,
            runtime_call_deadline: Duration::from_millis(DEFAULT_RUNTIME_CALL_DEADLINE_MS),
            token_walk_depth: DEFAULT_TOKEN_WALK_DEPTH,
        }
    }
}

impl TunnelConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(
                env_u64("GANGWAY_POLL_INTERVAL_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            progress_timeout: Duration::from_millis(
                env_u64("GANGWAY_PROGRESS_TIMEOUT_MS")
                    .map(|v| v.clamp(1_000, 60 * 60_000))
                    .unwrap_or(DEFAULT_PROGRESS_TIMEOUT_MS),
            ),
            notifier_queue: env_usize("GANGWAY_NOTIFIER_QUEUE")
                .map(|v| v.clamp(1, 1_024))
                .unwrap_or(DEFAULT_NOTIFIER_QUEUE),
            runtime_call_deadline: Duration::from_millis(
                env_u64("GANGWAY_RUNTIME_CALL_DEADLINE_MS")
                    .map(|v| v.clamp(500, 120_000))
                    .unwrap_or(DEFAULT_RUNTIME_CALL_DEADLINE_MS),
            ),
            token_walk_depth: env_usize("GANGWAY_TOKEN_WALK_DEPTH")
                .map(|v| v.clamp(1, 16))
                .unwrap_or(DEFAULT_TOKEN_WALK_DEPTH),
        }
    }
}
