//! Overlay tunnel state onto container listings for clients.

use std::collections::HashMap;

use serde::Serialize;

use crate::runtime::ContainerRecord;
use crate::session::{self, WORKSPACE_DIR_LABEL, WORKSPACE_HOME_LABEL};
use crate::state::TunnelStatus;
use crate::store::{StateSnapshot, ids_match};

/// A container record plus the tunnel fields clients render.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedContainer {
    #[serde(flatten)]
    pub container: ContainerRecord,
    #[serde(rename = "tunnelStatus", skip_serializing_if = "String::is_empty")]
    pub tunnel_status: String,
    #[serde(rename = "tunnelCode", skip_serializing_if = "String::is_empty")]
    pub tunnel_code: String,
    #[serde(rename = "tunnelMessage", skip_serializing_if = "String::is_empty")]
    pub tunnel_message: String,
    #[serde(rename = "tunnelUrl", skip_serializing_if = "String::is_empty")]
    pub tunnel_url: String,
}

/// Overlay each record with its tunnel state. Containers without a tracked
/// tunnel keep empty overlay fields.
pub fn enrich_containers(
    containers: Vec<ContainerRecord>,
    states: &StateSnapshot,
) -> Vec<EnrichedContainer> {
    containers
        .into_iter()
        .map(|container| {
            let state = find_state(states, &container.id);
            match state {
                Some(state) => {
                    let url = build_connect_url(&container.name, &container.labels, state.status);
                    EnrichedContainer {
                        tunnel_status: state.status.as_str().to_string(),
                        tunnel_code: state.code.clone(),
                        tunnel_message: state.message.clone(),
                        tunnel_url: url,
                        container,
                    }
                }
                None => EnrichedContainer {
                    tunnel_status: String::new(),
                    tunnel_code: String::new(),
                    tunnel_message: String::new(),
                    tunnel_url: String::new(),
                    container,
                },
            }
        })
        .collect()
}

fn find_state<'a>(
    states: &'a StateSnapshot,
    container_id: &str,
) -> Option<&'a crate::state::TunnelState> {
    let container_id = container_id.trim();
    if container_id.is_empty() {
        return None;
    }
    if let Some(state) = states.get(container_id) {
        return Some(state);
    }
    states
        .iter()
        .find(|(key, _)| ids_match(key, container_id))
        .map(|(_, state)| state)
}

/// `https://vscode.dev/tunnel/<name>` plus the escaped workspace path when
/// the labels carry one. Empty unless the tunnel is ready.
pub fn build_connect_url(
    container_name: &str,
    labels: &HashMap<String, String>,
    status: TunnelStatus,
) -> String {
    if status != TunnelStatus::Ready {
        return String::new();
    }

    let name = session::build_tunnel_name(container_name, "");
    let base = format!("https://vscode.dev/tunnel/{name}");
    let workspace_path = build_workspace_open_path(labels);
    if workspace_path.is_empty() {
        base
    } else {
        format!("{base}{workspace_path}")
    }
}

fn build_workspace_open_path(labels: &HashMap<String, String>) -> String {
    let home = labels
        .get(WORKSPACE_HOME_LABEL)
        .map(|v| v.trim())
        .unwrap_or_default();
    let dir = labels
        .get(WORKSPACE_DIR_LABEL)
        .map(|v| v.trim())
        .unwrap_or_default();
    if home.is_empty() || dir.is_empty() {
        return String::new();
    }

    let full_path = format!("{}/workspaces/{dir}", home.trim_end_matches('/'));
    let escaped: Vec<String> = full_path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| urlencoding::encode(part).into_owned())
        .collect();
    if escaped.is_empty() {
        return String::new();
    }
    format!("/{}", escaped.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TunnelState;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn url_is_empty_unless_ready() {
        for status in [TunnelStatus::Starting, TunnelStatus::Blocked, TunnelStatus::Failed] {
            assert_eq!(build_connect_url("ws", &HashMap::new(), status), "");
        }
        assert_eq!(
            build_connect_url("ws", &HashMap::new(), TunnelStatus::Ready),
            "https://vscode.dev/tunnel/ws"
        );
    }

    #[test]
    fn url_appends_escaped_workspace_path() {
        let labels = labels(&[
            (WORKSPACE_HOME_LABEL, "/home/dev"),
            (WORKSPACE_DIR_LABEL, "my repo"),
        ]);
        assert_eq!(
            build_connect_url("ws", &labels, TunnelStatus::Ready),
            "https://vscode.dev/tunnel/ws/home/dev/workspaces/my%20repo"
        );
    }

    #[test]
    fn url_omits_path_without_both_labels() {
        let only_home = labels(&[(WORKSPACE_HOME_LABEL, "/home/dev")]);
        assert_eq!(
            build_connect_url("ws", &only_home, TunnelStatus::Ready),
            "https://vscode.dev/tunnel/ws"
        );
    }

    #[test]
    fn enrich_overlays_matching_states_only() {
        let containers = vec![
            ContainerRecord {
                id: "abc123".to_string(),
                name: "one".to_string(),
                ..ContainerRecord::default()
            },
            ContainerRecord {
                id: "def456".to_string(),
                name: "two".to_string(),
                ..ContainerRecord::default()
            },
        ];

        let mut states = StateSnapshot::new();
        let mut blocked = TunnelState::with_status(TunnelStatus::Blocked);
        blocked.code = "ZZZZ-9999".to_string();
        blocked.message = crate::state::AUTH_REQUIRED_MESSAGE.to_string();
        states.insert("def456".to_string(), blocked);

        let enriched = enrich_containers(containers, &states);
        assert_eq!(enriched[0].tunnel_status, "");
        assert_eq!(enriched[1].tunnel_status, "blocked");
        assert_eq!(enriched[1].tunnel_code, "ZZZZ-9999");
        assert_eq!(enriched[1].tunnel_url, "");
    }

    #[test]
    fn enrich_matches_by_id_prefix() {
        let containers = vec![ContainerRecord {
            id: "abcdef123456".to_string(),
            name: "one".to_string(),
            ..ContainerRecord::default()
        }];

        let mut states = StateSnapshot::new();
        states.insert("abcdef".to_string(), TunnelState::with_status(TunnelStatus::Ready));

        let enriched = enrich_containers(containers, &states);
        assert_eq!(enriched[0].tunnel_status, "ready");
        assert_eq!(enriched[0].tunnel_url, "https://vscode.dev/tunnel/one");
    }
}
