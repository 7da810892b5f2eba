//! End-to-end supervisor scenarios against an in-memory runtime fake.
//!
//! The fake scripts the evidence a real container would produce per tick:
//! the pid-check answer, the session log contents, and listing/inspect
//! output. Token files are real files in a temp dir, exactly as the prober
//! sees them through a bind mount.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gangway_tunnel::monitor::{CONTAINER_GONE_MESSAGE, TIMEOUT_MESSAGE};
use gangway_tunnel::runtime::{ContainerRecord, InspectRecord, MountRecord};
use gangway_tunnel::supervisor::PROCESS_NOT_RUNNING_MESSAGE;
use gangway_tunnel::{
    ContainerRuntime, RuntimeError, Supervisor, TunnelConfig, TunnelStatus,
};

const CONTAINER: &str = "abcdef123456";

const AUTH_PROMPT: &str =
    "To grant access to the server, please log into https://github.com/login/device and use code ABCD-EFGH";
const OPEN_LINK_LINE: &str = "Open this link in your browser https://vscode.dev/tunnel/ws";

const DEFAULT_PASSWD: &str = concat!(
    "root:x:0:0:root:/root:/bin/bash\n",
    "dev:x:1000:1000:dev:/home/dev:/bin/bash\n",
);

#[derive(Default)]
struct FakeInner {
    passwd: String,
    alive: bool,
    log: String,
    install_fails: bool,
    fail_with: Option<RuntimeError>,
    containers: Vec<ContainerRecord>,
    mounts: Vec<MountRecord>,
}

#[derive(Default)]
struct FakeRuntime {
    inner: Mutex<FakeInner>,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        let fake = Arc::new(Self::default());
        {
            let mut inner = fake.inner.lock().unwrap();
            inner.passwd = DEFAULT_PASSWD.to_string();
            inner.alive = true;
        }
        fake
    }

    fn set_alive(&self, alive: bool) {
        self.inner.lock().unwrap().alive = alive;
    }

    fn set_log(&self, log: &str) {
        self.inner.lock().unwrap().log = log.to_string();
    }

    fn set_passwd(&self, passwd: &str) {
        self.inner.lock().unwrap().passwd = passwd.to_string();
    }

    fn fail_with(&self, err: Option<RuntimeError>) {
        self.inner.lock().unwrap().fail_with = err;
    }

    fn set_install_fails(&self, fails: bool) {
        self.inner.lock().unwrap().install_fails = fails;
    }

    fn set_containers(&self, containers: Vec<ContainerRecord>, mounts: Vec<MountRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner.containers = containers;
        inner.mounts = mounts;
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn exec(&self, _container: &str, script: &str) -> Result<String, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        if let Some(err) = &inner.fail_with {
            return Err(err.clone());
        }
        if script.starts_with("cat /etc/passwd") {
            return Ok(inner.passwd.clone());
        }
        if script.contains("kill -0") {
            return Ok(if inner.alive { "alive\n" } else { "dead\n" }.to_string());
        }
        if script.contains("gangway-tunnel-") && script.contains(".log") {
            return Ok(inner.log.clone());
        }
        if script.starts_with("set -eu") && inner.install_fails {
            return Err(RuntimeError::Transient(
                "curl: (6) Could not resolve host: code.visualstudio.com".to_string(),
            ));
        }
        Ok(String::new())
    }

    async fn exec_detached_as_user(
        &self,
        _container: &str,
        _user: &str,
        _script: &str,
    ) -> Result<String, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        if let Some(err) = &inner.fail_with {
            return Err(err.clone());
        }
        Ok(String::new())
    }

    async fn inspect(&self, _container: &str) -> Result<InspectRecord, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        if let Some(err) = &inner.fail_with {
            return Err(err.clone());
        }
        Ok(InspectRecord {
            name: "ws-one".to_string(),
            status: "running".to_string(),
            running: true,
            labels: HashMap::new(),
            mounts: inner.mounts.clone(),
        })
    }

    async fn list(&self, _label_filter: Option<&str>) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        if let Some(err) = &inner.fail_with {
            return Err(err.clone());
        }
        Ok(inner.containers.clone())
    }
}

fn test_config() -> TunnelConfig {
    TunnelConfig {
        poll_interval: Duration::from_millis(20),
        progress_timeout: Duration::from_millis(2_000),
        notifier_queue: 16,
        runtime_call_deadline: Duration::from_secs(1),
        token_walk_depth: 4,
    }
}

fn setup(config: TunnelConfig) -> (Arc<FakeRuntime>, Supervisor, tempfile::TempDir) {
    let runtime = FakeRuntime::new();
    let supervisor = Supervisor::new(runtime.clone(), config);
    let token_dir = tempfile::tempdir().unwrap();
    (runtime, supervisor, token_dir)
}

fn write_token(dir: &tempfile::TempDir) {
    let cli = dir.path().join("cli");
    std::fs::create_dir_all(&cli).unwrap();
    std::fs::write(cli.join("token.json"), "{}").unwrap();
}

async fn wait_for_status(supervisor: &Supervisor, container: &str, status: TunnelStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if supervisor
            .get_state(container)
            .is_some_and(|state| state.status == status)
        {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {status:?}; current: {:?}",
                supervisor.get_state(container)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn settle(ticks: u32) {
    tokio::time::sleep(Duration::from_millis(20 * ticks as u64 + 30)).await;
}

#[tokio::test]
async fn fresh_start_reaches_ready_without_a_code() {
    let (_runtime, supervisor, token_dir) = setup(test_config());
    let mut sub = supervisor.subscribe();

    let (_session, state) = supervisor
        .bootstrap(CONTAINER, "my workspace", token_dir.path().to_str().unwrap())
        .await;
    assert_eq!(state.status, TunnelStatus::Starting);
    assert_eq!(supervisor.monitor_count(), 1);

    settle(2).await;
    write_token(&token_dir);
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Ready).await;

    // Every snapshot the subscriber saw is starting or ready, code-free.
    let mut saw_ready = false;
    while let Some(snapshot) = sub.try_recv() {
        if let Some(state) = snapshot.get(CONTAINER) {
            assert!(matches!(state.status, TunnelStatus::Starting | TunnelStatus::Ready));
            assert_eq!(state.code, "");
            saw_ready |= state.status == TunnelStatus::Ready;
        }
    }
    assert!(saw_ready);
}

#[tokio::test]
async fn auth_stall_blocks_then_completes() {
    let (runtime, supervisor, token_dir) = setup(test_config());

    let (_session, state) = supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;
    assert_eq!(state.status, TunnelStatus::Starting);

    runtime.set_log(AUTH_PROMPT);
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Blocked).await;

    let blocked = supervisor.get_state(CONTAINER).unwrap();
    assert_eq!(blocked.code, "ABCD-EFGH");
    assert_eq!(blocked.message, "Authentication required");

    write_token(&token_dir);
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Ready).await;
    let ready = supervisor.get_state(CONTAINER).unwrap();
    assert_eq!(ready.code, "");
}

#[tokio::test]
async fn slow_install_stays_starting_until_token_appears() {
    let mut config = test_config();
    config.progress_timeout = Duration::from_millis(600);
    let (_runtime, supervisor, token_dir) = setup(config);
    let mut sub = supervisor.subscribe();

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;

    // Most of the timeout budget passes with no evidence at all.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        supervisor.get_state(CONTAINER).unwrap().status,
        TunnelStatus::Starting
    );

    write_token(&token_dir);
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Ready).await;

    while let Some(snapshot) = sub.try_recv() {
        if let Some(state) = snapshot.get(CONTAINER) {
            assert_ne!(state.status, TunnelStatus::Failed);
        }
    }
}

#[tokio::test]
async fn superseded_auth_prompt_does_not_block() {
    let (runtime, supervisor, token_dir) = setup(test_config());

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;

    runtime.set_log(&format!("{AUTH_PROMPT}\n{OPEN_LINK_LINE}\n"));
    settle(4).await;

    // Liveness plus a non-prompt latest line is still only starting: no
    // token means not ready, and the old prompt must not re-block.
    let state = supervisor.get_state(CONTAINER).unwrap();
    assert_eq!(state.status, TunnelStatus::Starting);
    assert_eq!(state.code, "");
}

#[tokio::test]
async fn container_vanishing_fails_terminally_until_cleared() {
    let (runtime, supervisor, token_dir) = setup(test_config());

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;
    settle(2).await;

    runtime.fail_with(Some(RuntimeError::NotFound));
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Failed).await;
    assert_eq!(
        supervisor.get_state(CONTAINER).unwrap().message,
        CONTAINER_GONE_MESSAGE
    );

    // Worker exited; the terminal state stays visible until cleared.
    settle(3).await;
    assert_eq!(supervisor.monitor_count(), 0);
    assert!(supervisor.get_state(CONTAINER).is_some());

    supervisor.clear(CONTAINER);
    assert!(supervisor.get_state(CONTAINER).is_none());
}

#[tokio::test]
async fn slow_subscriber_is_closed_while_fast_one_keeps_receiving() {
    let mut config = test_config();
    config.notifier_queue = 4;
    let (runtime, supervisor, token_dir) = setup(config);

    let mut fast = supervisor.subscribe();
    let mut slow = supervisor.subscribe();
    assert!(fast.recv().await.is_some());

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;

    // Toggle blocked <-> starting to generate a stream of changes; the slow
    // subscriber never reads and must get closed, the fast one sees all.
    for round in 0..6 {
        if round % 2 == 0 {
            runtime.set_log(AUTH_PROMPT);
            wait_for_status(&supervisor, CONTAINER, TunnelStatus::Blocked).await;
        } else {
            runtime.set_log(OPEN_LINK_LINE);
            wait_for_status(&supervisor, CONTAINER, TunnelStatus::Starting).await;
        }
        while fast.try_recv().is_some() {}
    }

    // Drain whatever was buffered before the close; the channel must then be
    // terminated rather than blocking forever.
    let mut drained = 0;
    while slow.try_recv().is_some() {
        drained += 1;
    }
    assert!(drained <= 4);
    assert!(slow.recv().await.is_none());

    runtime.set_log(AUTH_PROMPT);
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Blocked).await;
    let mut fast_alive = false;
    while let Some(snapshot) = fast.try_recv() {
        fast_alive |= snapshot.contains_key(CONTAINER);
    }
    assert!(fast_alive);
}

#[tokio::test]
async fn stalled_tunnel_times_out_exactly_once() {
    let mut config = test_config();
    config.progress_timeout = Duration::from_millis(150);
    let (_runtime, supervisor, token_dir) = setup(config);
    let mut sub = supervisor.subscribe();

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;

    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Failed).await;
    assert_eq!(supervisor.get_state(CONTAINER).unwrap().message, TIMEOUT_MESSAGE);
    settle(3).await;
    assert_eq!(supervisor.monitor_count(), 0);

    let mut failed_events = 0;
    while let Some(snapshot) = sub.try_recv() {
        if snapshot
            .get(CONTAINER)
            .is_some_and(|state| state.status == TunnelStatus::Failed)
        {
            failed_events += 1;
        }
    }
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn bootstrap_without_non_root_user_fails_and_starts_nothing() {
    let (runtime, supervisor, token_dir) = setup(test_config());
    runtime.set_passwd("root:x:0:0:root:/root:/bin/bash\n");

    let (_session, state) = supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;

    assert_eq!(state.status, TunnelStatus::Failed);
    assert!(state.message.contains("non-root user"));
    assert_eq!(supervisor.monitor_count(), 0);
}

#[tokio::test]
async fn install_failure_surfaces_trimmed_output() {
    let (runtime, supervisor, token_dir) = setup(test_config());
    runtime.set_install_fails(true);

    let (_session, state) = supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;

    assert_eq!(state.status, TunnelStatus::Failed);
    assert!(state.message.starts_with("Failed to install VS Code CLI:"));
    assert!(state.message.contains("Could not resolve host"));
    assert_eq!(supervisor.monitor_count(), 0);
}

#[tokio::test]
async fn second_bootstrap_replaces_the_monitor() {
    let (_runtime, supervisor, token_dir) = setup(test_config());
    let dir = token_dir.path().to_str().unwrap().to_string();

    let (first, _) = supervisor.bootstrap(CONTAINER, "ws", &dir).await;
    let (second, _) = supervisor.bootstrap(CONTAINER, "ws", &dir).await;
    assert_ne!(first, second);
    assert_eq!(supervisor.monitor_count(), 1);
}

#[tokio::test]
async fn stop_monitor_is_idempotent_and_freezes_state() {
    let (_runtime, supervisor, token_dir) = setup(test_config());

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;
    settle(2).await;

    supervisor.stop_monitor(CONTAINER);
    supervisor.stop_monitor(CONTAINER);
    supervisor.stop_monitor("never-monitored");
    settle(1).await;
    assert_eq!(supervisor.monitor_count(), 0);

    // New evidence arrives, but no monitor is left to publish it.
    let frozen = supervisor.get_state(CONTAINER).unwrap();
    write_token(&token_dir);
    settle(4).await;
    assert_eq!(supervisor.get_state(CONTAINER).unwrap(), frozen);
}

fn labelled_container(id: &str, session: &str) -> ContainerRecord {
    let mut labels = HashMap::new();
    labels.insert("tunnel_session".to_string(), session.to_string());
    ContainerRecord {
        id: id.to_string(),
        name: "ws-one".to_string(),
        image: "img".to_string(),
        status: "Up 10 minutes".to_string(),
        labels,
        ..ContainerRecord::default()
    }
}

#[tokio::test]
async fn reconcile_reattaches_live_sessions() {
    let (runtime, supervisor, token_dir) = setup(test_config());
    runtime.set_containers(
        vec![labelled_container(CONTAINER, "17-abcd0123")],
        vec![MountRecord {
            source: token_dir.path().to_str().unwrap().to_string(),
            destination: "/home/dev/.vscode".to_string(),
        }],
    );
    runtime.set_log(AUTH_PROMPT);

    supervisor.reconcile().await.unwrap();

    let state = supervisor.get_state(CONTAINER).unwrap();
    assert_eq!(state.status, TunnelStatus::Blocked);
    assert_eq!(state.code, "ABCD-EFGH");
    assert_eq!(supervisor.monitor_count(), 1);

    // The re-attached monitor keeps driving the lifecycle.
    write_token(&token_dir);
    wait_for_status(&supervisor, CONTAINER, TunnelStatus::Ready).await;
}

#[tokio::test]
async fn reconcile_marks_dead_sessions_failed() {
    let (runtime, supervisor, _token_dir) = setup(test_config());
    runtime.set_containers(vec![labelled_container(CONTAINER, "17-abcd0123")], vec![]);
    runtime.set_alive(false);

    supervisor.reconcile().await.unwrap();

    let state = supervisor.get_state(CONTAINER).unwrap();
    assert_eq!(state.status, TunnelStatus::Failed);
    assert_eq!(state.message, PROCESS_NOT_RUNNING_MESSAGE);
    assert_eq!(supervisor.monitor_count(), 0);
}

#[tokio::test]
async fn listing_prunes_states_for_vanished_containers() {
    let (runtime, supervisor, token_dir) = setup(test_config());

    supervisor
        .bootstrap(CONTAINER, "ws", token_dir.path().to_str().unwrap())
        .await;
    supervisor.stop_monitor(CONTAINER);
    assert!(supervisor.get_state(CONTAINER).is_some());

    runtime.set_containers(vec![], vec![]);
    let listed = supervisor.list_enriched().await.unwrap();
    assert!(listed.is_empty());
    assert!(supervisor.get_state(CONTAINER).is_none());
}

#[tokio::test]
async fn shutdown_stops_all_monitors() {
    let (_runtime, supervisor, token_dir) = setup(test_config());
    let dir = token_dir.path().to_str().unwrap().to_string();

    supervisor.bootstrap("container-one", "one", &dir).await;
    supervisor.bootstrap("container-two", "two", &dir).await;
    assert_eq!(supervisor.monitor_count(), 2);

    supervisor.shutdown();
    settle(2).await;
    assert_eq!(supervisor.monitor_count(), 0);
}
