//! Tunnel lifecycle state as published to clients.

use serde::{Deserialize, Serialize};

pub const AUTH_REQUIRED_MESSAGE: &str = "Authentication required";

const MAX_MESSAGE_LEN: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Starting,
    Blocked,
    Ready,
    Failed,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Starting => "starting",
            TunnelStatus::Blocked => "blocked",
            TunnelStatus::Ready => "ready",
            TunnelStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one tunnel. Compared by value: the store only publishes
/// a write when the new state differs from the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelState {
    pub status: TunnelStatus,
    /// Device code shown to the user while blocked on OAuth.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<TunnelDebug>,
}

/// Diagnostic payload attached by bootstrap; never interpreted, only shown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelDebug {
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exec_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_cmd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_cmd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_output: String,
}

impl TunnelState {
    pub fn starting() -> Self {
        Self::with_status(TunnelStatus::Starting)
    }

    pub fn with_status(status: TunnelStatus) -> Self {
        Self {
            status,
            code: String::new(),
            message: String::new(),
            debug: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TunnelStatus::Failed,
            code: String::new(),
            message: message.into(),
            debug: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == TunnelStatus::Failed
    }
}

/// `<prefix>: <trimmed output or error>`, capped, with a bare `<prefix>.`
/// when there is nothing to quote.
pub fn failure_message(prefix: &str, output: &str, err: Option<&str>) -> String {
    let mut message = output.trim().to_string();
    if message.is_empty() {
        message = err.unwrap_or_default().trim().to_string();
    }
    if message.is_empty() {
        return format!("{prefix}.");
    }
    format!("{prefix}: {}", cap_len(&message))
}

/// First non-empty line of a command's output, capped for display.
pub fn first_non_empty_line(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(cap_len)
        .unwrap_or_default()
}

fn cap_len(value: &str) -> String {
    if value.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &value[..end])
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialises_lowercase() {
        let state = TunnelState::with_status(TunnelStatus::Blocked);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"status":"blocked"}"#);
    }

    #[test]
    fn failure_message_prefers_output_over_error() {
        assert_eq!(
            failure_message("Failed to install VS Code CLI", " curl: (6) no host \n", Some("exit 1")),
            "Failed to install VS Code CLI: curl: (6) no host"
        );
        assert_eq!(
            failure_message("Failed to install VS Code CLI", "", Some("exit status 127")),
            "Failed to install VS Code CLI: exit status 127"
        );
        assert_eq!(
            failure_message("Failed to install VS Code CLI", "  ", None),
            "Failed to install VS Code CLI."
        );
    }

    #[test]
    fn failure_message_caps_long_output() {
        let long = "x".repeat(500);
        let message = failure_message("Failed", &long, None);
        assert!(message.ends_with("..."));
        assert!(message.len() < 260);
    }

    #[test]
    fn first_non_empty_line_skips_blanks() {
        assert_eq!(first_non_empty_line("\n  \n hello \nworld"), "hello");
        assert_eq!(first_non_empty_line("\n \n"), "");
    }
}
