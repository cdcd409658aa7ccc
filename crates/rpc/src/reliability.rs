//! Reconnect-safety around a session's event stream.
//!
//! Every emitted event gets the session's next monotonic sequence number and
//! lands in a bounded ring. Reconnecting clients replay from their last seen
//! seq; when the ring has already evicted what they missed, they get the
//! whole buffer plus an explicit gap signal and are expected to resync.
//! Command ids are remembered for a retention window so a re-sent command is
//! answered from the cached response instead of reaching the child twice.
//!
//! The layer is pure: callers inject `now` and drive the orphan deadlines
//! with a cooperative timer, which keeps every path deterministic in tests.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_EVENT_BUFFER: usize = 800;
pub const DEFAULT_COMMAND_RETENTION_MS: i64 = 5 * 60 * 1000;
pub const DEFAULT_ORPHAN_GRACE_MS: i64 = 60_000;
pub const DEFAULT_ORPHAN_ABORT_DELAY_MS: i64 = 5_000;

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    pub event_buffer: usize,
    pub command_retention_ms: i64,
    pub orphan_grace_ms: i64,
    pub orphan_abort_delay_ms: i64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            command_retention_ms: DEFAULT_COMMAND_RETENTION_MS,
            orphan_grace_ms: DEFAULT_ORPHAN_GRACE_MS,
            orphan_abort_delay_ms: DEFAULT_ORPHAN_ABORT_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub events: Vec<SequencedEvent>,
    /// True when evicted events between the client's cursor and the buffer
    /// were lost; the client must resync instead of patching.
    pub gap: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandRegistration {
    Fresh,
    /// Seen before, no response recorded yet; the caller must not re-send.
    DuplicatePending,
    /// Seen before and answered; re-emit the cached response.
    DuplicateCached { response: Value, seq: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanAction {
    /// Grace expired: tell the child to cancel its current turn.
    Abort(String),
    /// Abort delay also expired: stop the session outright.
    Stop(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OrphanPhase {
    Grace,
    AbortSent,
}

#[derive(Debug)]
struct OrphanTimer {
    phase: OrphanPhase,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionReliability {
    next_seq: u64,
    buffer: VecDeque<SequencedEvent>,
    seen: HashMap<String, DateTime<Utc>>,
    cached: HashMap<String, (Value, u64)>,
    orphan: Option<OrphanTimer>,
}

impl SessionReliability {
    fn new() -> Self {
        Self {
            next_seq: 1,
            buffer: VecDeque::new(),
            seen: HashMap::new(),
            cached: HashMap::new(),
            orphan: None,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, retention_ms: i64) {
        let cutoff = now - Duration::milliseconds(retention_ms);
        let expired: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, seen_at)| **seen_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.seen.remove(&id);
            self.cached.remove(&id);
        }
    }
}

#[derive(Debug, Default)]
pub struct ReliabilityLayer {
    config: ReliabilityConfig,
    sessions: HashMap<String, SessionReliability>,
}

impl ReliabilityLayer {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// Assign the next seq to `event`, buffer it, and cache it when it is a
    /// response to an identified command. Returns the assigned seq.
    pub fn record_event(&mut self, session_id: &str, event: Value, now: DateTime<Utc>) -> u64 {
        let retention_ms = self.config.command_retention_ms;
        let cap = self.config.event_buffer;
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionReliability::new);

        let seq = session.next_seq;
        session.next_seq += 1;

        if is_response(&event) {
            if let Some(command_id) = event.get("id").and_then(Value::as_str) {
                if !command_id.is_empty() {
                    session
                        .cached
                        .insert(command_id.to_string(), (event.clone(), seq));
                    session.seen.entry(command_id.to_string()).or_insert(now);
                }
            }
        }

        while session.buffer.len() >= cap {
            session.buffer.pop_front();
        }
        session.buffer.push_back(SequencedEvent {
            seq,
            event,
            timestamp: now,
        });
        session.prune(now, retention_ms);
        seq
    }

    /// Events a client with cursor `last_seen_seq` still needs.
    pub fn get_replay(&self, session_id: &str, last_seen_seq: u64) -> Replay {
        let Some(session) = self.sessions.get(session_id) else {
            return Replay::default();
        };
        let Some(oldest) = session.buffer.front().map(|e| e.seq) else {
            return Replay::default();
        };

        if last_seen_seq + 1 < oldest {
            // The client missed events that have been evicted.
            return Replay {
                events: session.buffer.iter().cloned().collect(),
                gap: true,
            };
        }
        Replay {
            events: session
                .buffer
                .iter()
                .filter(|e| e.seq > last_seen_seq)
                .cloned()
                .collect(),
            gap: false,
        }
    }

    /// Register an inbound command id, detecting duplicates from reconnects.
    /// Empty ids are unmanaged and always fresh.
    pub fn register_command(
        &mut self,
        session_id: &str,
        command_id: &str,
        now: DateTime<Utc>,
    ) -> CommandRegistration {
        if command_id.is_empty() {
            return CommandRegistration::Fresh;
        }
        let retention_ms = self.config.command_retention_ms;
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionReliability::new);
        session.prune(now, retention_ms);

        if let Some((response, seq)) = session.cached.get(command_id) {
            return CommandRegistration::DuplicateCached {
                response: response.clone(),
                seq: *seq,
            };
        }
        if session.seen.contains_key(command_id) {
            return CommandRegistration::DuplicatePending;
        }
        session.seen.insert(command_id.to_string(), now);
        CommandRegistration::Fresh
    }

    /// Start the orphan clock: abort after the grace period, stop shortly
    /// after that. A no-op when a timer is already running.
    pub fn schedule_orphan(&mut self, session_id: &str, now: DateTime<Utc>) {
        let grace_ms = self.config.orphan_grace_ms;
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionReliability::new);
        if session.orphan.is_none() {
            debug!(%session_id, "orphan grace started");
            session.orphan = Some(OrphanTimer {
                phase: OrphanPhase::Grace,
                deadline: now + Duration::milliseconds(grace_ms),
            });
        }
    }

    /// A subscriber came back inside the window.
    pub fn cancel_orphan(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.orphan = None;
        }
    }

    /// Collect due orphan transitions. `Abort` advances the timer into the
    /// abort-delay phase; `Stop` drops the session's reliability state.
    pub fn due_orphan_actions(&mut self, now: DateTime<Utc>) -> Vec<OrphanAction> {
        let mut actions = Vec::new();
        let mut to_drop = Vec::new();

        for (session_id, session) in &mut self.sessions {
            let Some(timer) = &session.orphan else {
                continue;
            };
            if timer.deadline > now {
                continue;
            }
            match timer.phase {
                OrphanPhase::Grace => {
                    actions.push(OrphanAction::Abort(session_id.clone()));
                    session.orphan = Some(OrphanTimer {
                        phase: OrphanPhase::AbortSent,
                        deadline: now
                            + Duration::milliseconds(self.config.orphan_abort_delay_ms),
                    });
                }
                OrphanPhase::AbortSent => {
                    actions.push(OrphanAction::Stop(session_id.clone()));
                    to_drop.push(session_id.clone());
                }
            }
        }
        for session_id in to_drop {
            self.sessions.remove(&session_id);
        }
        actions
    }

    /// Drop all state for a session (stopped or crashed).
    pub fn drop_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn latest_seq(&self, session_id: &str) -> Option<u64> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.buffer.back().map(|e| e.seq))
    }
}

fn is_response(event: &Value) -> bool {
    event.get("type").and_then(Value::as_str) == Some("response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layer_with_buffer(event_buffer: usize) -> ReliabilityLayer {
        ReliabilityLayer::new(ReliabilityConfig {
            event_buffer,
            ..Default::default()
        })
    }

    fn record_n(layer: &mut ReliabilityLayer, session: &str, n: u64, now: DateTime<Utc>) {
        for i in 1..=n {
            let seq = layer.record_event(session, json!({"type":"tick","n": i}), now);
            assert_eq!(seq, i);
        }
    }

    #[test]
    fn replay_within_window_is_gapless() {
        let mut layer = layer_with_buffer(800);
        let now = Utc::now();
        record_n(&mut layer, "s1", 10, now);

        let replay = layer.get_replay("s1", 4);
        assert!(!replay.gap);
        let seqs: Vec<u64> = replay.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn replay_after_eviction_signals_gap() {
        let mut layer = layer_with_buffer(800);
        let now = Utc::now();
        record_n(&mut layer, "s1", 1000, now);

        let replay = layer.get_replay("s1", 50);
        assert!(replay.gap);
        assert_eq!(replay.events.len(), 800);
        assert_eq!(replay.events.first().unwrap().seq, 201);
        assert_eq!(replay.events.last().unwrap().seq, 1000);
    }

    #[test]
    fn replay_exactly_at_window_edge_has_no_gap() {
        let mut layer = layer_with_buffer(5);
        let now = Utc::now();
        record_n(&mut layer, "s1", 10, now);
        // Buffer holds 6..10; a cursor of 5 saw everything now evicted.
        let replay = layer.get_replay("s1", 5);
        assert!(!replay.gap);
        assert_eq!(replay.events.len(), 5);

        let replay = layer.get_replay("s1", 4);
        assert!(replay.gap);
    }

    #[test]
    fn empty_buffer_and_unknown_session_replay_empty() {
        let layer = ReliabilityLayer::new(ReliabilityConfig::default());
        let replay = layer.get_replay("nobody", 7);
        assert!(replay.events.is_empty());
        assert!(!replay.gap);
    }

    #[test]
    fn events_are_strictly_monotonic_per_session() {
        let mut layer = layer_with_buffer(800);
        let now = Utc::now();
        record_n(&mut layer, "a", 3, now);
        // A second session starts back at 1.
        let seq = layer.record_event("b", json!({"type":"tick"}), now);
        assert_eq!(seq, 1);
        assert_eq!(layer.latest_seq("a"), Some(3));
    }

    #[test]
    fn command_dedup_replays_cached_response() {
        let mut layer = layer_with_buffer(800);
        let now = Utc::now();

        assert_eq!(
            layer.register_command("s1", "cmd-1", now),
            CommandRegistration::Fresh
        );
        // Seen but unanswered: duplicate without a cached response.
        assert_eq!(
            layer.register_command("s1", "cmd-1", now),
            CommandRegistration::DuplicatePending
        );

        record_n(&mut layer, "s1", 36, now);
        let response = json!({"type":"response","id":"cmd-1","okay":true});
        let seq = layer.record_event("s1", response.clone(), now);
        assert_eq!(seq, 37);

        match layer.register_command("s1", "cmd-1", now) {
            CommandRegistration::DuplicateCached {
                response: cached,
                seq,
            } => {
                assert_eq!(cached, response);
                assert_eq!(seq, 37);
            }
            other => panic!("expected cached duplicate, got {other:?}"),
        }
    }

    #[test]
    fn empty_command_ids_are_unmanaged() {
        let mut layer = layer_with_buffer(800);
        let now = Utc::now();
        assert_eq!(
            layer.register_command("s1", "", now),
            CommandRegistration::Fresh
        );
        assert_eq!(
            layer.register_command("s1", "", now),
            CommandRegistration::Fresh
        );
    }

    #[test]
    fn responses_without_ids_are_not_cached() {
        let mut layer = layer_with_buffer(800);
        let now = Utc::now();
        layer.record_event("s1", json!({"type":"response","id":""}), now);
        layer.record_event("s1", json!({"type":"response"}), now);
        assert_eq!(
            layer.register_command("s1", "", now),
            CommandRegistration::Fresh
        );
    }

    #[test]
    fn retention_prunes_seen_and_cached_state() {
        let mut layer = layer_with_buffer(800);
        let start = Utc::now();

        assert_eq!(
            layer.register_command("s1", "cmd-1", start),
            CommandRegistration::Fresh
        );
        layer.record_event("s1", json!({"type":"response","id":"cmd-1"}), start);

        // Six minutes later the five-minute retention has lapsed; pruning
        // runs on the next registration and the command is fresh again.
        let later = start + Duration::minutes(6);
        assert_eq!(
            layer.register_command("s1", "cmd-1", later),
            CommandRegistration::Fresh
        );
    }

    #[test]
    fn orphan_lifecycle_aborts_then_stops() {
        let mut layer = layer_with_buffer(800);
        let start = Utc::now();
        layer.record_event("s1", json!({"type":"tick"}), start);
        layer.schedule_orphan("s1", start);

        // Nothing fires inside the grace window.
        assert!(
            layer
                .due_orphan_actions(start + Duration::seconds(59))
                .is_empty()
        );

        let at_grace = start + Duration::seconds(61);
        assert_eq!(
            layer.due_orphan_actions(at_grace),
            vec![OrphanAction::Abort("s1".to_string())]
        );

        // Still subscribed-free after the abort delay: stop and drop state.
        let past_abort = at_grace + Duration::seconds(6);
        assert_eq!(
            layer.due_orphan_actions(past_abort),
            vec![OrphanAction::Stop("s1".to_string())]
        );
        assert!(layer.get_replay("s1", 0).events.is_empty());
    }

    #[test]
    fn resubscribe_cancels_orphan() {
        let mut layer = layer_with_buffer(800);
        let start = Utc::now();
        layer.schedule_orphan("s1", start);
        layer.cancel_orphan("s1");
        assert!(
            layer
                .due_orphan_actions(start + Duration::minutes(10))
                .is_empty()
        );
    }

    #[test]
    fn schedule_orphan_does_not_reset_a_running_timer() {
        let mut layer = layer_with_buffer(800);
        let start = Utc::now();
        layer.schedule_orphan("s1", start);
        // A later duplicate schedule must not push the deadline out.
        layer.schedule_orphan("s1", start + Duration::seconds(59));
        assert_eq!(
            layer.due_orphan_actions(start + Duration::seconds(61)),
            vec![OrphanAction::Abort("s1".to_string())]
        );
    }
}
