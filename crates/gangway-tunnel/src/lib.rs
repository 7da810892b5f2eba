//! Supervision of VS Code remote tunnels running inside Podman workspace
//! containers.
//!
//! Each workspace container gets a tunnel *session*: the CLI is installed
//! and launched in the container, and a per-container monitor fuses PID,
//! token and log evidence into one of four states (`starting`, `blocked`,
//! `ready`, `failed`) that is stored centrally and pushed to subscribers.
//! Nothing is persisted on the host; a restart re-derives everything from
//! the containers themselves via [`Supervisor::reconcile`].

pub mod bootstrap;
pub mod config;
pub mod enrich;
pub mod monitor;
pub mod notifier;
pub mod probe;
pub mod runtime;
pub mod session;
pub mod state;
pub mod store;
pub mod supervisor;

pub use config::TunnelConfig;
pub use enrich::EnrichedContainer;
pub use probe::Health;
pub use runtime::{ContainerRecord, ContainerRuntime, PodmanCli, RuntimeError};
pub use session::TunnelSession;
pub use state::{TunnelDebug, TunnelState, TunnelStatus};
pub use store::StateSnapshot;
pub use supervisor::Supervisor;
