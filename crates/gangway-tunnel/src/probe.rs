//! Health evidence for one tunnel session.
//!
//! Three independent signals are fused per tick: the PID file inside the
//! container (exact process identity, no pgrep heuristics), the token file on
//! the host side of the bind mount, and the tail of the session log. Only the
//! latest non-empty log line is consulted, so a prompt the user already
//! answered cannot re-trigger the blocked state.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::TunnelConfig;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::session;

/// One tick's worth of evidence. Ephemeral; never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Health {
    pub process_alive: bool,
    pub token_present: bool,
    pub auth_required: bool,
    pub device_code: String,
}

fn auth_prompt_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^To grant access to the server, please log into https://github\.com/login/device and use code [A-Za-z0-9-]+$",
        )
        .unwrap()
    })
}

fn device_code_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:enter\s+(?:the\s+)?)?(?:device\s*code|code)\b[^A-Z0-9-]*([A-Z0-9]{4}(?:-[A-Z0-9]{4})+)",
        )
        .unwrap()
    })
}

/// Probe the tunnel's health. Any runtime failure bubbles up so the monitor
/// can decide between terminal (`NotFound`, `Unavailable`) and keeping the
/// previous observation (`Transient`).
pub async fn probe(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    session_id: &str,
    host_token_dir: &str,
    config: &TunnelConfig,
) -> Result<Health, RuntimeError> {
    let pid_script = format!(
        "kill -0 $(cat {} 2>/dev/null) 2>/dev/null && echo alive || echo dead",
        session::pid_file(session_id)
    );
    let pid_output = runtime.exec(container_id, &pid_script).await?;
    let process_alive = pid_output.trim() == "alive";

    let token_present = has_token(host_token_dir, config.token_walk_depth);

    let log_output = runtime
        .read_file(container_id, &session::log_file(session_id))
        .await?;

    let mut health = Health {
        process_alive,
        token_present,
        ..Health::default()
    };

    let line = latest_non_empty_line(&log_output);
    if auth_prompt_line().is_match(line) {
        health.auth_required = true;
        health.device_code = extract_device_code(line);
    } else {
        let code = extract_device_code(line);
        if !code.is_empty() {
            health.auth_required = true;
            health.device_code = code;
        }
    }

    Ok(health)
}

pub fn latest_non_empty_line(value: &str) -> &str {
    value
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Extract a `XXXX-XXXX` style device code, upper-cased. Empty when absent.
pub fn extract_device_code(line: &str) -> String {
    device_code_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_uppercase())
        .unwrap_or_default()
}

/// Host-side token check: the two well-known CLI locations first, then a
/// bounded walk for any `token.json` (case-insensitive). A permission error
/// is loud; it must never silently read as "no token" (macOS bind mounts).
pub fn has_token(host_token_dir: &str, max_depth: usize) -> bool {
    let dir = host_token_dir.trim();
    if dir.is_empty() {
        return false;
    }
    let base = Path::new(dir);

    for candidate in [
        base.join("cli").join("token.json"),
        base.join("cli").join("github").join("token.json"),
    ] {
        match std::fs::metadata(&candidate) {
            Ok(meta) if meta.is_file() => return true,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!(path = %candidate.display(), "token check denied; treating as unknown");
            }
            Err(_) => {}
        }
    }

    walk_for_token(base, max_depth)
}

fn walk_for_token(dir: &Path, depth_left: usize) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                tracing::warn!(path = %dir.display(), "token walk denied; treating as unknown");
            }
            return false;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };

        if file_type.is_dir() {
            if depth_left > 0 && walk_for_token(&path, depth_left - 1) {
                return true;
            }
        } else if entry.file_name().to_string_lossy().eq_ignore_ascii_case("token.json") {
            return true;
        }
    }

    false
}
