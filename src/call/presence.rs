use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::call::errors::CallError;
use crate::call::registry::{Call, Participant, SessionRegistry};
use crate::call::types::{CallId, ConnectionState, ParticipantId};
use crate::log::log_sink::LogSink;
use crate::{sink_debug, sink_trace, sink_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// A Disconnected participant showed up again within its grace period.
    Resumed,
    /// Nothing was recorded (unknown call, departed participant, or the grace
    /// period already ran out).
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    HeartbeatLost,
    GraceExpired,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub call_id: CallId,
    pub participant_id: ParticipantId,
    pub signal: PresenceSignal,
}

/// Liveness bookkeeping. Owns `last_heartbeat_at`; the state transitions it
/// detects are applied by the call state machine.
pub struct PresenceMonitor {
    registry: Arc<SessionRegistry>,
    heartbeat_timeout: Duration,
    grace_period: Duration,
    log: Arc<dyn LogSink>,
}

impl PresenceMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        heartbeat_timeout: Duration,
        grace_period: Duration,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            registry,
            heartbeat_timeout,
            grace_period,
            log,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Records a heartbeat. Never fails: heartbeats for calls or participants
    /// that are gone are logged and dropped.
    pub fn heartbeat(&self, call_id: &str, participant_id: &str, now: Instant) -> HeartbeatOutcome {
        match self
            .registry
            .with_call(call_id, |call| self.heartbeat_in(call, participant_id, now))
        {
            Ok(outcome) => outcome,
            Err(CallError::NotFound(_)) => {
                sink_debug!(
                    self.log,
                    "heartbeat from {} for unknown call {}",
                    participant_id,
                    call_id
                );
                HeartbeatOutcome::Ignored
            }
            Err(e) => {
                sink_warn!(self.log, "heartbeat from {} dropped: {}", participant_id, e);
                HeartbeatOutcome::Ignored
            }
        }
    }

    pub(crate) fn heartbeat_in(
        &self,
        call: &mut Call,
        participant_id: &str,
        now: Instant,
    ) -> HeartbeatOutcome {
        if !call.is_member(participant_id) {
            if call.has_departed(participant_id) {
                sink_warn!(
                    self.log,
                    "heartbeat from {} ignored: already left call {}",
                    participant_id,
                    call.call_id
                );
            } else {
                sink_debug!(
                    self.log,
                    "heartbeat from non-member {} in call {}",
                    participant_id,
                    call.call_id
                );
            }
            return HeartbeatOutcome::Ignored;
        }
        let grace_period = self.grace_period;
        let Some(p) = call.participant_mut(participant_id) else {
            return HeartbeatOutcome::Ignored;
        };

        if p.state == ConnectionState::Disconnected {
            if now.saturating_duration_since(p.state_since) >= grace_period {
                return HeartbeatOutcome::Ignored;
            }
            p.last_heartbeat_at = now;
            return HeartbeatOutcome::Resumed;
        }
        p.last_heartbeat_at = now;
        sink_trace!(self.log, "heartbeat {} in call {}", participant_id, call.call_id);
        HeartbeatOutcome::Refreshed
    }

    /// A monitored participant whose last heartbeat is older than the timeout.
    pub fn is_lost(&self, p: &Participant, now: Instant) -> bool {
        p.state.is_heartbeat_monitored()
            && now.saturating_duration_since(p.last_heartbeat_at) > self.heartbeat_timeout
    }

    /// A Disconnected participant that stayed silent for the whole grace period.
    pub fn grace_expired(&self, p: &Participant, now: Instant) -> bool {
        p.state == ConnectionState::Disconnected
            && p.last_heartbeat_at <= p.state_since
            && now.saturating_duration_since(p.state_since) >= self.grace_period
    }

    /// A Disconnected participant that sent a heartbeat after disconnecting.
    pub fn has_resumed(&self, p: &Participant) -> bool {
        p.state == ConnectionState::Disconnected && p.last_heartbeat_at > p.state_since
    }

    /// Scans every live call and reports participants whose liveness changed.
    ///
    /// Calls are locked one at a time, so a sweep never stalls more than one
    /// call at once.
    pub fn sweep(&self, now: Instant) -> Vec<PresenceEvent> {
        let call_ids = match self.registry.call_ids() {
            Ok(ids) => ids,
            Err(e) => {
                sink_warn!(self.log, "presence sweep skipped: {}", e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for call_id in call_ids {
            let found = self.registry.with_call(&call_id, |call| {
                call.participants()
                    .iter()
                    .filter_map(|p| {
                        let signal = if self.is_lost(p, now) {
                            PresenceSignal::HeartbeatLost
                        } else if self.has_resumed(p) {
                            PresenceSignal::Resumed
                        } else if self.grace_expired(p, now) {
                            PresenceSignal::GraceExpired
                        } else {
                            return None;
                        };
                        Some(PresenceEvent {
                            call_id: call.call_id.clone(),
                            participant_id: p.participant_id.clone(),
                            signal,
                        })
                    })
                    .collect::<Vec<_>>()
            });
            // The call may have ended between listing and locking.
            if let Ok(found) = found {
                events.extend(found);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::call::events::EventBus;
    use crate::call::types::CallKind;
    use crate::log::{MemoryLogSink, NoopLogSink};

    const TIMEOUT: Duration = Duration::from_secs(15);
    const GRACE: Duration = Duration::from_secs(10);

    fn setup(log: Arc<dyn LogSink>) -> (Arc<SessionRegistry>, PresenceMonitor, Instant) {
        let registry = Arc::new(SessionRegistry::new(EventBus::new()));
        let t0 = Instant::now();
        for who in ["a", "b"] {
            registry
                .join_with("g1", who, CallKind::Group, t0, |call, id| {
                    if let Some(p) = call.participant_mut(id) {
                        p.set_state(ConnectionState::Connected, t0);
                    }
                })
                .unwrap();
        }
        let presence = PresenceMonitor::new(registry.clone(), TIMEOUT, GRACE, log);
        (registry, presence, t0)
    }

    fn set_state(registry: &SessionRegistry, who: &str, state: ConnectionState, at: Instant) {
        registry
            .with_call("g1", |c| c.participant_mut(who).unwrap().set_state(state, at))
            .unwrap();
    }

    #[test]
    fn silent_participant_is_reported_lost_after_timeout() {
        let (_registry, presence, t0) = setup(Arc::new(NoopLogSink));
        assert!(presence.sweep(t0 + TIMEOUT).is_empty());

        presence.heartbeat("g1", "b", t0 + Duration::from_secs(10));
        let events = presence.sweep(t0 + TIMEOUT + Duration::from_millis(1));
        assert_eq!(
            events,
            vec![PresenceEvent {
                call_id: "g1".into(),
                participant_id: "a".into(),
                signal: PresenceSignal::HeartbeatLost,
            }]
        );
    }

    #[test]
    fn disconnected_participant_resumes_or_expires() {
        let (registry, presence, t0) = setup(Arc::new(NoopLogSink));
        let lost_at = t0 + Duration::from_secs(16);
        set_state(&registry, "a", ConnectionState::Disconnected, lost_at);
        set_state(&registry, "b", ConnectionState::Disconnected, lost_at);

        assert_eq!(
            presence.heartbeat("g1", "a", lost_at + Duration::from_secs(2)),
            HeartbeatOutcome::Resumed
        );
        let events = presence.sweep(lost_at + GRACE);
        let signals: Vec<_> = events
            .iter()
            .map(|e| (e.participant_id.as_str(), e.signal))
            .collect();
        assert_eq!(
            signals,
            vec![("a", PresenceSignal::Resumed), ("b", PresenceSignal::GraceExpired)]
        );
    }

    #[test]
    fn heartbeat_after_grace_is_ignored() {
        let (registry, presence, t0) = setup(Arc::new(NoopLogSink));
        set_state(&registry, "a", ConnectionState::Disconnected, t0);
        assert_eq!(
            presence.heartbeat("g1", "a", t0 + GRACE),
            HeartbeatOutcome::Ignored
        );
        let p = registry.with_call("g1", |c| c.participant("a").cloned()).unwrap().unwrap();
        assert_eq!(p.last_heartbeat_at, t0);
    }

    #[test]
    fn heartbeat_from_departed_participant_is_logged_not_raised() {
        let log = Arc::new(MemoryLogSink::new());
        let (registry, presence, t0) = setup(log.clone());
        registry.leave("g1", "b").unwrap();

        assert_eq!(presence.heartbeat("g1", "b", t0), HeartbeatOutcome::Ignored);
        assert!(log.contains("already left call g1"));
        assert_eq!(presence.heartbeat("nope", "b", t0), HeartbeatOutcome::Ignored);
    }

    #[test]
    fn joining_participants_are_not_swept() {
        let (registry, presence, t0) = setup(Arc::new(NoopLogSink));
        registry.create_or_join("g1", "c", CallKind::Group, t0).unwrap();
        let events = presence.sweep(t0 + TIMEOUT * 4);
        assert!(events.iter().all(|e| e.participant_id != "c"));
    }
}
