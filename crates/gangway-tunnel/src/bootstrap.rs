//! Session bootstrap: pick an exec user, install the VS Code CLI, and start
//! the tunnel process inside the container.
//!
//! The install script is idempotent across container restarts. The start
//! script records the exact child PID (`echo $! > PID; wait`) so liveness
//! checks downstream are `kill -0` against a known PID rather than a name
//! match over `ps` output.

use tracing::debug;

use crate::runtime::ContainerRuntime;
use crate::session::{self, TunnelSession};
use crate::state::{TunnelDebug, TunnelState, failure_message, first_non_empty_line};

const DEBUG_VERSION: &str = "tunnel-debug-v1";

/// What bootstrap produced: a session when the tunnel was launched (or at
/// least identified), and the state to publish either way.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub session: Option<TunnelSession>,
    pub state: TunnelState,
}

impl BootstrapOutcome {
    fn failed(message: impl Into<String>, debug: Option<TunnelDebug>) -> Self {
        let mut state = TunnelState::failed(message);
        state.debug = debug;
        Self {
            session: None,
            state,
        }
    }
}

/// Install the CLI and launch the tunnel for `container_id`. Never panics;
/// always returns a state with a status, `starting` on success.
pub async fn bootstrap(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    workspace_name: &str,
    session_id: &str,
) -> BootstrapOutcome {
    if container_id.trim().is_empty() {
        return BootstrapOutcome::failed("Missing container ID.", None);
    }

    let passwd = match runtime
        .exec(container_id, "cat /etc/passwd 2>/dev/null || true")
        .await
    {
        Ok(output) => output,
        Err(e) => {
            return BootstrapOutcome::failed(
                failure_message("Failed to read container users", "", Some(&e.to_string())),
                None,
            );
        }
    };

    let Some(exec_user) = session::select_first_non_root_user(&passwd) else {
        return BootstrapOutcome::failed("No non-root user found in container.", None);
    };

    let tunnel_session = TunnelSession {
        session_id: session_id.to_string(),
        container_id: container_id.to_string(),
        exec_user: exec_user.name.clone(),
        exec_home: exec_user.home.clone(),
        tunnel_name: session::build_tunnel_name(workspace_name, container_id),
    };

    let install_cmd = build_install_script();
    let start_cmd = build_start_script(&tunnel_session);
    let mut tunnel_debug = TunnelDebug {
        version: DEBUG_VERSION.to_string(),
        exec_user: exec_user.name.clone(),
        install_cmd: install_cmd.clone(),
        start_cmd: start_cmd.clone(),
        ..TunnelDebug::default()
    };

    // Best effort; a failed chown only matters once the start script fails
    // too, and that failure carries the real diagnostics.
    let _ = runtime
        .exec(
            container_id,
            &build_log_prepare_script(&exec_user.name, session_id),
        )
        .await;

    match runtime.exec(container_id, &install_cmd).await {
        Ok(output) => {
            tunnel_debug.install_output = first_non_empty_line(&output);
        }
        Err(e) => {
            let text = e.to_string();
            tunnel_debug.install_output = first_non_empty_line(&text);
            return BootstrapOutcome::failed(
                failure_message("Failed to install VS Code CLI", &text, None),
                Some(tunnel_debug),
            );
        }
    }

    match runtime
        .exec_detached_as_user(container_id, &exec_user.name, &start_cmd)
        .await
    {
        Ok(output) => {
            tunnel_debug.start_output = first_non_empty_line(&output);
        }
        Err(e) => {
            let text = e.to_string();
            tunnel_debug.start_output = first_non_empty_line(&text);
            return BootstrapOutcome::failed(
                failure_message("Failed to start VS Code tunnel", &text, None),
                Some(tunnel_debug),
            );
        }
    }

    debug!(
        container = container_id,
        session = session_id,
        user = %exec_user.name,
        tunnel = %tunnel_session.tunnel_name,
        "tunnel bootstrap complete"
    );

    let mut state = TunnelState::starting();
    state.debug = Some(tunnel_debug);
    BootstrapOutcome {
        session: Some(tunnel_session),
        state,
    }
}

/// Truncate the session's log and PID files and hand them to the exec user.
pub fn build_log_prepare_script(exec_user: &str, session_id: &str) -> String {
    let log_path = session::log_file(session_id);
    let pid_path = session::pid_file(session_id);
    let user = exec_user.trim();
    if user.is_empty() {
        return format!(
            "mkdir -p /tmp && : > {log_path} && : > {pid_path} && : > {}",
            session::BOOTSTRAP_LOG_PATH
        );
    }
    format!(
        "mkdir -p /tmp && : > {log_path} && : > {pid_path} && : > {} && chown {} {log_path} {pid_path}",
        session::BOOTSTRAP_LOG_PATH,
        session::shell_single_quote(user),
    )
}

/// Idempotent CLI install: exits immediately when a usable `code tunnel` is
/// already on PATH, otherwise downloads the architecture-appropriate build.
pub fn build_install_script() -> String {
    [
        "set -eu".to_string(),
        format!("exec >> {} 2>&1", session::BOOTSTRAP_LOG_PATH),
        "echo \"[bootstrap] install started $(date -Iseconds)\"".to_string(),
        "if command -v code >/dev/null 2>&1; then".to_string(),
        "  if code tunnel --help >/dev/null 2>&1; then".to_string(),
        "    echo \"[bootstrap] code already installed and usable: $(command -v code)\"".to_string(),
        "    exit 0".to_string(),
        "  fi".to_string(),
        "  echo \"[bootstrap] code exists but tunnel command is unavailable, reinstalling CLI\"".to_string(),
        "fi".to_string(),
        "echo \"[bootstrap] installing prerequisites via apt-get\"".to_string(),
        "apt-get update >/dev/null".to_string(),
        "DEBIAN_FRONTEND=noninteractive apt-get install -y ca-certificates curl tar >/dev/null".to_string(),
        "apt-get clean >/dev/null".to_string(),
        "arch=$(uname -m)".to_string(),
        "case \"$arch\" in".to_string(),
        "  x86_64|amd64) download_url=https://code.visualstudio.com/sha/download?build=stable\\&os=cli-alpine-x64 ;;".to_string(),
        "  armv7l|armv6l|armhf) download_url=https://code.visualstudio.com/sha/download?build=stable\\&os=cli-linux-armhf ;;".to_string(),
        "  aarch64|arm64) download_url=https://code.visualstudio.com/sha/download?build=stable\\&os=cli-linux-arm64 ;;".to_string(),
        "  *) echo \"[bootstrap] unsupported architecture: $arch\"; exit 1 ;;".to_string(),
        "esac".to_string(),
        "echo \"[bootstrap] attempting download: $download_url\"".to_string(),
        "curl -fsSL \"$download_url\" -o /tmp/vscode_cli.tar.gz".to_string(),
        "tar -xzf /tmp/vscode_cli.tar.gz -C /usr/local/bin code".to_string(),
        "chmod +x /usr/local/bin/code".to_string(),
        "rm -f /tmp/vscode_cli.tar.gz".to_string(),
        "echo \"[bootstrap] install completed $(date -Iseconds)\"".to_string(),
    ]
    .join("\n")
}

/// Launch `code tunnel` detached as the exec user, append everything to the
/// session log, and record the child PID.
pub fn build_start_script(tunnel_session: &TunnelSession) -> String {
    let safe_name = session::shell_single_quote(&tunnel_session.tunnel_name);
    let mut home = tunnel_session.exec_home.trim();
    if home.is_empty() {
        home = "/tmp";
    }
    let data_dir = format!("{}/.vscode", home.trim_end_matches('/'));
    let safe_home = session::shell_single_quote(home);
    let safe_data_dir = session::shell_single_quote(&data_dir);
    let log_path = session::log_file(&tunnel_session.session_id);
    let pid_path = session::pid_file(&tunnel_session.session_id);

    [
        format!(
            "echo \"[tunnel] start requested $(date -Iseconds), name={safe_name}, session={}\" >> {log_path}",
            tunnel_session.session_id
        ),
        format!("echo \"[tunnel] starting as user: $(id -un)\" >> {log_path}"),
        format!("echo \"[tunnel] code path: $(command -v code || echo missing)\" >> {log_path}"),
        format!("mkdir -p {safe_data_dir}"),
        format!(
            "HOME={safe_home} VSCODE_CLI_DATA_DIR={safe_data_dir} code tunnel --accept-server-license-terms --name {safe_name} >> {log_path} 2>&1 &"
        ),
        format!("echo $! > {pid_path}"),
        "wait".to_string(),
        format!(
            "rc=$?; echo \"[tunnel] process exited with code $rc at $(date -Iseconds)\" >> {log_path}; exit $rc"
        ),
    ]
    .join("; ")
}
