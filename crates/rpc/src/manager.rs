//! Child-process RPC sessions: spawn, supervise, and fan out NDJSON events.
//!
//! Each session wraps one child process speaking line-delimited JSON over
//! stdio. A dedicated writer task owns stdin (serialized writes, natural
//! backpressure), reader tasks turn stdout lines into events and stderr
//! into `rpc_stderr`, and a wait task emits the final
//! `rpc_session_stopped` / `rpc_process_crashed` before tearing the record
//! down. Every event passes through the reliability layer for sequencing,
//! so all subscribers observe the same order and reconnecting clients can
//! replay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reliability::{
    CommandRegistration, OrphanAction, ReliabilityConfig, ReliabilityLayer, Replay, SequencedEvent,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const STDIN_QUEUE_CAPACITY: usize = 64;
const ORPHAN_TICK: Duration = Duration::from_millis(250);
const PARSE_ERROR_PREVIEW_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Argv of the agent child, program first.
    pub agent_argv: Vec<String>,
    /// Environment set on top of the inherited environment.
    pub env_set: Vec<(String, String)>,
    /// Inherited variables removed before spawn (e.g. a flag that would mark
    /// the child as a subagent).
    pub env_remove: Vec<String>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub kill_grace: Duration,
    /// Stdout lines above this size are reported as parse errors instead of
    /// being handed to the JSON parser.
    pub max_line_bytes: usize,
    pub reliability: ReliabilityConfig,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            agent_argv: Vec::new(),
            env_set: Vec::new(),
            env_remove: Vec::new(),
            connect_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(2),
            max_line_bytes: 8 * 1024 * 1024,
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl SessionManagerConfig {
    /// Map the `[rpc]` config section onto manager settings.
    pub fn from_config(config: &rho_config::RpcConfig) -> Self {
        Self {
            agent_argv: config.agent_command.clone(),
            env_set: config.env_set.clone(),
            env_remove: config.env_remove.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            reliability: ReliabilityConfig {
                event_buffer: config.event_buffer,
                command_retention_ms: config.command_retention_secs as i64 * 1000,
                orphan_grace_ms: config.orphan_grace_secs as i64 * 1000,
                orphan_abort_delay_ms: config.orphan_abort_delay_secs as i64 * 1000,
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no such session {0}")]
    NotFound(String),
    #[error("command requires a non-empty type")]
    MissingType,
    #[error("agent command is not configured")]
    NoCommand,
    #[error("failed to spawn agent child: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("agent child stdio unavailable")]
    Stdio,
}

struct SessionRecord {
    session_file: PathBuf,
    child_pid: u32,
    started_at: DateTime<Utc>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    events: broadcast::Sender<SequencedEvent>,
    stdin_tx: mpsc::Sender<String>,
    last_activity: Arc<Mutex<tokio::time::Instant>>,
    connect_timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: SessionManagerConfig,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    reliability: Mutex<ReliabilityLayer>,
    orphan_driver: Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide broker for agent child sessions. Cheap to clone; treat it as
/// a singleton with an explicit [`SessionManager::dispose`] at shutdown.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        let reliability = ReliabilityLayer::new(config.reliability.clone());
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                reliability: Mutex::new(reliability),
                orphan_driver: Mutex::new(None),
            }),
        };

        // Cooperative timer that walks orphan deadlines: abort first, then
        // stop. It is the only place orphan actions are executed.
        let driver = manager.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ORPHAN_TICK).await;
                let actions = driver
                    .inner
                    .reliability
                    .lock()
                    .expect("reliability lock")
                    .due_orphan_actions(Utc::now());
                for action in actions {
                    match action {
                        OrphanAction::Abort(session_id) => {
                            info!(%session_id, "orphan grace expired; aborting current turn");
                            let _ = driver
                                .send_command(&session_id, json!({"type": "abort"}))
                                .await;
                        }
                        OrphanAction::Stop(session_id) => {
                            info!(%session_id, "orphan abort window expired; stopping");
                            driver.stop_session(&session_id).await;
                        }
                    }
                }
            }
        });
        *manager.inner.orphan_driver.lock().expect("driver lock") = Some(handle);
        manager
    }

    /// Spawn the agent child for `session_file` and return the session id.
    ///
    /// Immediately queues a `switch_session` for the file plus a `get_state`
    /// probe, and arms the connection and idle timers.
    pub async fn start_session(&self, session_file: &Path) -> Result<String, SessionError> {
        let argv = &self.inner.config.agent_argv;
        let program = argv.first().ok_or(SessionError::NoCommand)?;

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for key in &self.inner.config.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &self.inner.config.env_set {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let child_pid = child.id().ok_or(SessionError::Stdio)?;
        let stdin = child.stdin.take().ok_or(SessionError::Stdio)?;
        let stdout = child.stdout.take().ok_or(SessionError::Stdio)?;
        let stderr = child.stderr.take().ok_or(SessionError::Stdio)?;

        let session_id = Uuid::new_v4().to_string();
        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let last_activity = Arc::new(Mutex::new(tokio::time::Instant::now()));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE_CAPACITY);
        let connect_timer = Arc::new(Mutex::new(None));

        // Insert the record before any task runs so nothing the child says is
        // dropped on the floor; stdout sits in the pipe until the reader
        // starts. Task handles are attached right after.
        let record = SessionRecord {
            session_file: session_file.to_path_buf(),
            child_pid,
            started_at: Utc::now(),
            connected: Arc::clone(&connected),
            stopping: Arc::clone(&stopping),
            events: events_tx,
            stdin_tx,
            last_activity: Arc::clone(&last_activity),
            connect_timer: Arc::clone(&connect_timer),
            tasks: Vec::new(),
        };
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .insert(session_id.clone(), record);

        let mut tasks = Vec::new();

        // Writer task: sole owner of stdin. Bounded queue + awaited writes
        // give ordering and backpressure; a failed write kills the session.
        {
            let manager = self.clone();
            let session_id = session_id.clone();
            let mut stdin = stdin;
            let mut stdin_rx = stdin_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    let write = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await
                    }
                    .await;
                    if let Err(err) = write {
                        warn!(%session_id, %err, "agent stdin write failed");
                        manager.emit_unless_stopping(
                            &session_id,
                            json!({
                                "type": "rpc_error",
                                "phase": "write",
                                "message": err.to_string(),
                            }),
                        );
                        manager.stop_session(&session_id).await;
                        break;
                    }
                }
            }));
        }

        // Stdout reader: buffer to newline, parse, fan out.
        {
            let manager = self.clone();
            let session_id = session_id.clone();
            let connected = Arc::clone(&connected);
            let connect_timer = Arc::clone(&connect_timer);
            let max_line_bytes = self.inner.config.max_line_bytes;
            tasks.push(tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf: Vec<u8> = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                        buf.pop();
                    }
                    if buf.is_empty() {
                        continue;
                    }
                    if buf.len() > max_line_bytes {
                        manager.emit_unless_stopping(
                            &session_id,
                            parse_error_event(&buf[..PARSE_ERROR_PREVIEW_CHARS.min(buf.len())]),
                        );
                        continue;
                    }
                    match serde_json::from_slice::<Value>(&buf) {
                        Ok(event) => {
                            if !connected.swap(true, Ordering::SeqCst) {
                                // First well-formed line: the child is up.
                                if let Some(timer) =
                                    connect_timer.lock().expect("connect timer lock").take()
                                {
                                    timer.abort();
                                }
                                debug!(%session_id, "session connected");
                            }
                            manager.emit_unless_stopping(&session_id, event);
                        }
                        Err(_) => {
                            manager.emit_unless_stopping(
                                &session_id,
                                parse_error_event(&buf[..PARSE_ERROR_PREVIEW_CHARS.min(buf.len())]),
                            );
                        }
                    }
                }
            }));
        }

        // Stderr reader: plain text, one event per line.
        {
            let manager = self.clone();
            let session_id = session_id.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    manager.emit_unless_stopping(
                        &session_id,
                        json!({"type": "rpc_stderr", "message": line}),
                    );
                }
            }));
        }

        // Connection timer: still unconnected when it fires means the child
        // never spoke; report and stop.
        {
            let manager = self.clone();
            let session_id = session_id.clone();
            let connected = Arc::clone(&connected);
            let timeout = self.inner.config.connect_timeout;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !connected.load(Ordering::SeqCst) {
                    warn!(%session_id, "agent child never connected");
                    manager.emit_unless_stopping(
                        &session_id,
                        json!({"type": "rpc_error", "phase": "connect"}),
                    );
                    manager.stop_session(&session_id).await;
                }
            });
            *connect_timer.lock().expect("connect timer lock") = Some(handle);
        }

        // Idle timer: every successful command write pushes the deadline out.
        {
            let manager = self.clone();
            let session_id = session_id.clone();
            let last_activity = Arc::clone(&last_activity);
            let idle_timeout = self.inner.config.idle_timeout;
            tasks.push(tokio::spawn(async move {
                loop {
                    let deadline =
                        *last_activity.lock().expect("last activity lock") + idle_timeout;
                    if tokio::time::Instant::now() >= deadline {
                        info!(%session_id, "session idle timeout");
                        manager.emit_unless_stopping(
                            &session_id,
                            json!({"type": "rpc_idle_timeout"}),
                        );
                        manager.stop_session(&session_id).await;
                        break;
                    }
                    tokio::time::sleep_until(deadline).await;
                }
            }));
        }

        // Wait task: owns the child, emits the terminal event, tears down.
        {
            let manager = self.clone();
            let session_id = session_id.clone();
            let stopping = Arc::clone(&stopping);
            tasks.push(tokio::spawn(async move {
                let status = child.wait().await;
                let initiated = stopping.load(Ordering::SeqCst);
                let event = if initiated {
                    json!({"type": "rpc_session_stopped", "sessionId": session_id})
                } else {
                    let code = status.ok().and_then(|s| s.code());
                    warn!(%session_id, ?code, "agent child exited unexpectedly");
                    json!({
                        "type": "rpc_process_crashed",
                        "sessionId": session_id,
                        "code": code,
                    })
                };
                manager.emit(&session_id, event);
                manager.remove_session(&session_id);
            }));
        }

        {
            let mut sessions = self.inner.sessions.lock().expect("sessions lock");
            match sessions.get_mut(&session_id) {
                Some(record) => record.tasks = tasks,
                None => {
                    // The session died before we got here; nothing left to own
                    // these tasks.
                    for task in &tasks {
                        task.abort();
                    }
                }
            }
        }
        info!(%session_id, pid = child_pid, file = %session_file.display(), "session started");

        self.send_command(
            &session_id,
            json!({"type": "switch_session", "sessionFile": session_file.to_string_lossy()}),
        )
        .await?;
        self.send_command(&session_id, json!({"type": "get_state"}))
            .await?;

        Ok(session_id)
    }

    /// Queue one command for the child. `command.type` is required. The
    /// write resets the idle clock.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: Value,
    ) -> Result<(), SessionError> {
        let has_type = command
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        if !has_type {
            return Err(SessionError::MissingType);
        }

        let (stdin_tx, last_activity) = {
            let sessions = self.inner.sessions.lock().expect("sessions lock");
            let record = sessions
                .get(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            (record.stdin_tx.clone(), Arc::clone(&record.last_activity))
        };

        let line = serde_json::to_string(&command).expect("json value serializes");
        stdin_tx
            .send(line)
            .await
            .map_err(|_| SessionError::NotFound(session_id.to_string()))?;
        *last_activity.lock().expect("last activity lock") = tokio::time::Instant::now();
        Ok(())
    }

    /// Subscribe to this session's event stream. All subscribers observe
    /// events in identical (sequence) order. Subscribing cancels any pending
    /// orphan timer.
    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SequencedEvent>> {
        let receiver = {
            let sessions = self.inner.sessions.lock().expect("sessions lock");
            sessions.get(session_id).map(|r| r.events.subscribe())
        }?;
        self.inner
            .reliability
            .lock()
            .expect("reliability lock")
            .cancel_orphan(session_id);
        Some(receiver)
    }

    /// True once the child has produced its first well-formed event line.
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .get(session_id)
            .map(|r| r.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn has_subscribers(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .get(session_id)
            .map(|r| r.events.receiver_count() > 0)
            .unwrap_or(false)
    }

    pub fn find_session_by_file(&self, session_file: &Path) -> Option<String> {
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .find(|(_, record)| record.session_file == session_file)
            .map(|(id, _)| id.clone())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        let mut ids: Vec<(String, DateTime<Utc>)> = sessions
            .iter()
            .map(|(id, record)| (id.clone(), record.started_at))
            .collect();
        ids.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        ids.into_iter().map(|(id, _)| id).collect()
    }

    /// SIGTERM the child, then SIGKILL after the grace period if it has not
    /// exited. Safe to call any number of times.
    pub async fn stop_session(&self, session_id: &str) {
        let pid = {
            let sessions = self.inner.sessions.lock().expect("sessions lock");
            let Some(record) = sessions.get(session_id) else {
                return;
            };
            if record.stopping.swap(true, Ordering::SeqCst) {
                return;
            }
            record.child_pid
        };
        info!(%session_id, pid, "stopping session");
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        let manager = self.clone();
        let session_id = session_id.to_string();
        let grace = self.inner.config.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = manager
                .inner
                .sessions
                .lock()
                .expect("sessions lock")
                .contains_key(&session_id);
            if still_running {
                warn!(%session_id, pid, "child ignored SIGTERM; sending SIGKILL");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        });
    }

    /// Stop every session and the orphan driver.
    pub async fn dispose(&self) {
        if let Some(driver) = self
            .inner
            .orphan_driver
            .lock()
            .expect("driver lock")
            .take()
        {
            driver.abort();
        }
        let ids: Vec<String> = {
            let sessions = self.inner.sessions.lock().expect("sessions lock");
            sessions.keys().cloned().collect()
        };
        for session_id in ids {
            self.stop_session(&session_id).await;
        }
    }

    // ── reliability passthrough ──────────────────────────────────────────

    pub fn get_replay(&self, session_id: &str, last_seen_seq: u64) -> Replay {
        self.inner
            .reliability
            .lock()
            .expect("reliability lock")
            .get_replay(session_id, last_seen_seq)
    }

    pub fn register_command(&self, session_id: &str, command_id: &str) -> CommandRegistration {
        self.inner
            .reliability
            .lock()
            .expect("reliability lock")
            .register_command(session_id, command_id, Utc::now())
    }

    /// Call when the last subscriber disconnects.
    pub fn schedule_orphan(&self, session_id: &str) {
        self.inner
            .reliability
            .lock()
            .expect("reliability lock")
            .schedule_orphan(session_id, Utc::now());
    }

    pub fn cancel_orphan(&self, session_id: &str) {
        self.inner
            .reliability
            .lock()
            .expect("reliability lock")
            .cancel_orphan(session_id);
    }

    // ── internals ────────────────────────────────────────────────────────

    /// Sequence the event and fan it out. Holding the reliability lock
    /// across the broadcast keeps delivery order equal to sequence order.
    fn emit(&self, session_id: &str, event: Value) {
        let sender = {
            let sessions = self.inner.sessions.lock().expect("sessions lock");
            match sessions.get(session_id) {
                Some(record) => record.events.clone(),
                None => return,
            }
        };
        let now = Utc::now();
        let mut reliability = self.inner.reliability.lock().expect("reliability lock");
        let seq = reliability.record_event(session_id, event.clone(), now);
        let _ = sender.send(SequencedEvent {
            seq,
            event,
            timestamp: now,
        });
    }

    /// Like [`emit`], but suppressed once a stop is in flight so subscribers
    /// see nothing between `stop_session` and the terminal event.
    fn emit_unless_stopping(&self, session_id: &str, event: Value) {
        let stopping = {
            let sessions = self.inner.sessions.lock().expect("sessions lock");
            match sessions.get(session_id) {
                Some(record) => record.stopping.load(Ordering::SeqCst),
                None => return,
            }
        };
        if !stopping {
            self.emit(session_id, event);
        }
    }

    fn remove_session(&self, session_id: &str) {
        let record = self
            .inner
            .sessions
            .lock()
            .expect("sessions lock")
            .remove(session_id);
        if let Some(record) = record {
            if let Some(timer) = record.connect_timer.lock().expect("connect timer lock").take()
            {
                timer.abort();
            }
            for task in &record.tasks {
                task.abort();
            }
        }
        self.inner
            .reliability
            .lock()
            .expect("reliability lock")
            .drop_session(session_id);
        debug!(%session_id, "session record removed");
    }
}

fn parse_error_event(preview: &[u8]) -> Value {
    json!({
        "type": "rpc_error",
        "phase": "parse",
        "line": String::from_utf8_lossy(preview),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_for(argv: &[&str]) -> SessionManager {
        SessionManager::new(SessionManagerConfig {
            agent_argv: argv.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn next_event_of_type(
        rx: &mut broadcast::Receiver<SequencedEvent>,
        wanted: &str,
    ) -> SequencedEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event wait timed out")
                .expect("event channel closed");
            if event.event.get("type").and_then(Value::as_str) == Some(wanted) {
                return event;
            }
        }
    }

    #[test]
    fn config_section_maps_onto_manager_settings() {
        let mut section = rho_config::RpcConfig::default();
        section.agent_command = vec!["cat".to_string()];
        section.connect_timeout_secs = 5;

        let config = SessionManagerConfig::from_config(&section);
        assert_eq!(config.agent_argv, vec!["cat".to_string()]);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.reliability.event_buffer, 800);
        assert_eq!(config.reliability.command_retention_ms, 300_000);
        assert_eq!(config.reliability.orphan_grace_ms, 60_000);
    }

    #[tokio::test]
    async fn cat_child_echoes_startup_commands_in_order() {
        // `cat` reflects the NDJSON we write, so the startup commands come
        // back as the session's first two events.
        let manager = manager_for(&["cat"]);
        let id = manager
            .start_session(Path::new("/tmp/rho-session.json"))
            .await
            .unwrap();

        let replay_manager = manager.clone();
        let replay_id = id.clone();
        wait_for("startup echoes", move || {
            replay_manager.get_replay(&replay_id, 0).events.len() >= 2
        })
        .await;

        let replay = manager.get_replay(&id, 0);
        assert!(!replay.gap);
        assert!(manager.is_connected(&id));
        let seqs: Vec<u64> = replay.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(replay.events[0].event["type"], "switch_session");
        assert_eq!(
            replay.events[0].event["sessionFile"],
            "/tmp/rho-session.json"
        );
        assert_eq!(replay.events[1].event["type"], "get_state");

        assert_eq!(
            manager.find_session_by_file(Path::new("/tmp/rho-session.json")),
            Some(id.clone())
        );
        assert_eq!(manager.active_sessions(), vec![id.clone()]);

        manager.dispose().await;
    }

    #[tokio::test]
    async fn subscribers_receive_events_and_terminal_stop() {
        let manager = manager_for(&["cat"]);
        let id = manager
            .start_session(Path::new("/tmp/rho-sub.json"))
            .await
            .unwrap();

        assert!(!manager.has_subscribers(&id));
        let mut rx = manager.subscribe(&id).unwrap();
        assert!(manager.has_subscribers(&id));

        manager
            .send_command(&id, json!({"type": "ping", "id": "cmd-1"}))
            .await
            .unwrap();
        let event = next_event_of_type(&mut rx, "ping").await;
        assert_eq!(event.event["id"], "cmd-1");

        manager.stop_session(&id).await;
        manager.stop_session(&id).await; // idempotent
        let stopped = next_event_of_type(&mut rx, "rpc_session_stopped").await;
        assert_eq!(stopped.event["sessionId"], id.as_str());

        let stop_manager = manager.clone();
        wait_for("session removal", move || {
            stop_manager.active_sessions().is_empty()
        })
        .await;
        assert!(matches!(
            manager.send_command(&id, json!({"type": "ping"})).await,
            Err(SessionError::NotFound(_))
        ));

        manager.dispose().await;
    }

    #[tokio::test]
    async fn malformed_stdout_line_becomes_parse_error_event() {
        let manager = manager_for(&["sh", "-c", "echo notjson; cat"]);
        let id = manager
            .start_session(Path::new("/tmp/rho-parse.json"))
            .await
            .unwrap();

        let poll_manager = manager.clone();
        let poll_id = id.clone();
        wait_for("parse error + echoes", move || {
            poll_manager.get_replay(&poll_id, 0).events.len() >= 3
        })
        .await;

        let replay = manager.get_replay(&id, 0);
        let types: Vec<&str> = replay
            .events
            .iter()
            .map(|e| e.event["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["rpc_error", "switch_session", "get_state"]);
        assert_eq!(replay.events[0].event["phase"], "parse");
        assert_eq!(replay.events[0].event["line"], "notjson");

        manager.dispose().await;
    }

    #[tokio::test]
    async fn stderr_lines_become_rpc_stderr_events() {
        let manager = manager_for(&["sh", "-c", "echo oops >&2; cat"]);
        let id = manager
            .start_session(Path::new("/tmp/rho-stderr.json"))
            .await
            .unwrap();

        let mut rx = manager.subscribe(&id).unwrap();
        let event = next_event_of_type(&mut rx, "rpc_stderr").await;
        assert_eq!(event.event["message"], "oops");

        manager.dispose().await;
    }

    #[tokio::test]
    async fn unexpected_exit_emits_process_crashed() {
        // The child consumes both startup commands, lingers long enough for
        // us to subscribe, then dies with a code.
        let manager = manager_for(&["sh", "-c", "read a; read b; sleep 0.3; exit 3"]);
        let id = manager
            .start_session(Path::new("/tmp/rho-crash.json"))
            .await
            .unwrap();

        let mut rx = manager.subscribe(&id).unwrap();
        let crashed = next_event_of_type(&mut rx, "rpc_process_crashed").await;
        assert_eq!(crashed.event["code"], 3);

        let poll_manager = manager.clone();
        wait_for("record removal", move || {
            poll_manager.active_sessions().is_empty()
        })
        .await;

        manager.dispose().await;
    }

    #[tokio::test]
    async fn command_without_type_is_rejected() {
        let manager = manager_for(&["cat"]);
        let id = manager
            .start_session(Path::new("/tmp/rho-type.json"))
            .await
            .unwrap();

        assert!(matches!(
            manager.send_command(&id, json!({})).await,
            Err(SessionError::MissingType)
        ));
        assert!(matches!(
            manager.send_command(&id, json!({"type": ""})).await,
            Err(SessionError::MissingType)
        ));

        manager.dispose().await;
    }

    #[tokio::test]
    async fn empty_argv_cannot_start() {
        let manager = manager_for(&[]);
        assert!(matches!(
            manager.start_session(Path::new("/tmp/x.json")).await,
            Err(SessionError::NoCommand)
        ));
        manager.dispose().await;
    }

    #[tokio::test]
    async fn orphaned_session_is_aborted_then_stopped() {
        let manager = SessionManager::new(SessionManagerConfig {
            agent_argv: vec!["cat".to_string()],
            reliability: ReliabilityConfig {
                orphan_grace_ms: 100,
                orphan_abort_delay_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        });
        let id = manager
            .start_session(Path::new("/tmp/rho-orphan.json"))
            .await
            .unwrap();

        manager.schedule_orphan(&id);
        let poll_manager = manager.clone();
        wait_for("orphan stop", move || {
            poll_manager.active_sessions().is_empty()
        })
        .await;

        manager.dispose().await;
    }
}
