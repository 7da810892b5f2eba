//! Session identity: one session per tunnel process instantiation.
//!
//! The session id is stamped on the container as the `tunnel_session` label
//! and names the per-session log and PID files, so a recreated container
//! always gets fresh files.

use std::sync::OnceLock;

use regex::Regex;

pub const TUNNEL_SESSION_LABEL: &str = "tunnel_session";
pub const WORKSPACE_HOME_LABEL: &str = "workspace_home";
pub const WORKSPACE_DIR_LABEL: &str = "workspace_dir";

/// Where the install script appends its own progress lines, independent of
/// any session.
pub const BOOTSTRAP_LOG_PATH: &str = "/tmp/gangway-vscode-bootstrap.log";

const MAX_TUNNEL_NAME_LEN: usize = 128;

/// Immutable per-instantiation identity of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    pub session_id: String,
    pub container_id: String,
    /// Non-root user the tunnel process runs as.
    pub exec_user: String,
    /// Home directory of `exec_user` inside the container.
    pub exec_home: String,
    /// Sanitised name passed to `code tunnel --name`.
    pub tunnel_name: String,
}

/// `<unix-seconds>-<8 hex>`; unique within a process and readable in logs.
pub fn generate_session_id() -> String {
    let seconds = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{seconds}-{}", &suffix[..8])
}

pub fn pid_file(session_id: &str) -> String {
    format!("/tmp/gangway-tunnel-{session_id}.pid")
}

pub fn log_file(session_id: &str) -> String {
    format!("/tmp/gangway-tunnel-{session_id}.log")
}

fn invalid_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_.-]").unwrap())
}

/// Build the tunnel name from the workspace name, falling back to the
/// container id, then to `workspace`. Disallowed characters become `-`; the
/// result is trimmed and truncated to 128 characters.
pub fn build_tunnel_name(workspace_name: &str, container_id: &str) -> String {
    let mut name = workspace_name.trim();
    if name.is_empty() {
        name = container_id.trim();
    }
    if name.is_empty() {
        return "workspace".to_string();
    }

    let replaced = invalid_name_chars().replace_all(name, "-");
    let trimmed = replaced.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        return "workspace".to_string();
    }
    if trimmed.len() > MAX_TUNNEL_NAME_LEN {
        trimmed[..MAX_TUNNEL_NAME_LEN].to_string()
    } else {
        trimmed.to_string()
    }
}

/// POSIX single-quote escaping for values interpolated into shell scripts.
pub fn shell_single_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// A user entry selected from the container's `/etc/passwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecUser {
    pub name: String,
    pub home: String,
}

/// Pick the tunnel's exec user from passwd contents: the first entry with
/// UID >= 1000 and a home under `/home/`, else the first non-root entry.
/// Returns `None` when the file holds nothing but root.
pub fn select_first_non_root_user(passwd: &str) -> Option<ExecUser> {
    let mut fallback: Option<ExecUser> = None;

    for line in passwd.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() < 7 {
            continue;
        }

        let name = parts[0].trim();
        if name.is_empty() || name == "root" {
            continue;
        }

        let Ok(uid) = parts[2].trim().parse::<u32>() else {
            continue;
        };
        let mut home = parts[5].trim();
        if home.is_empty() {
            home = "/tmp";
        }

        if fallback.is_none() {
            fallback = Some(ExecUser {
                name: name.to_string(),
                home: home.to_string(),
            });
        }

        if uid >= 1000 && home.starts_with("/home/") {
            return Some(ExecUser {
                name: name.to_string(),
                home: home.to_string(),
            });
        }
    }

    fallback
}
