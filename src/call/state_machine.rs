use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::call::clock::{Clock, SystemClock};
use crate::call::errors::CallError;
use crate::call::events::{CallEvent, EventBus};
use crate::call::media::{MediaPlan, MediaTrackCoordinator, RenegotiationStart};
use crate::call::presence::{HeartbeatOutcome, PresenceEvent, PresenceMonitor, PresenceSignal};
use crate::call::registry::{Call, LeaveOutcome, Participant, SessionRegistry};
use crate::call::relay::{Delivery, SignalingRelay};
use crate::call::topology::{HandshakePolicy, MeshPolicy, RelayPolicy};
use crate::call::types::{
    CallId, CallKind, ConnectionState, ExchangeKind, MediaFlag, MediaFlags, NegotiationExchange,
    NegotiationMessage, ParticipantId,
};
use crate::config::{CallConfig, Topology};
use crate::log::NoopLogSink;
use crate::log::log_sink::LogSink;
use crate::{sink_debug, sink_error, sink_info, sink_warn};

/// Immediate answer to a join request. The Connected (or Left) outcome
/// arrives later as a `ParticipantStateChanged` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTicket {
    pub call_id: CallId,
    pub participant_id: ParticipantId,
    pub state: ConnectionState,
    /// Peers the joiner still has to complete an offer/answer with.
    pub handshake_peers: BTreeSet<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Unchanged,
    /// The new flags are active already.
    Applied(MediaFlags),
    /// Renegotiation-requests went out; completion is reported via events.
    RenegotiationStarted { peers: BTreeSet<ParticipantId> },
    /// The participant is Disconnected; the change is renegotiated when it
    /// comes back.
    Deferred,
}

/// What one `tick` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub presence: Vec<PresenceEvent>,
    pub abandoned_joins: Vec<(CallId, ParticipantId)>,
    pub failed_renegotiations: Vec<(CallId, ParticipantId)>,
    pub expired_exchanges: Vec<NegotiationExchange>,
}

/// Per-participant lifecycle orchestration. Entry point for call control.
///
/// Every mutation runs inside the registry's per-call lock, so a participant's
/// state, its in-flight exchanges and the events describing them always move
/// together.
pub struct CallStateMachine {
    config: CallConfig,
    registry: Arc<SessionRegistry>,
    presence: PresenceMonitor,
    relay: Arc<SignalingRelay>,
    media: MediaTrackCoordinator,
    policy: Arc<dyn HandshakePolicy>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    log: Arc<dyn LogSink>,
}

impl CallStateMachine {
    pub fn new(config: CallConfig) -> Self {
        Self::with_log(config, Arc::new(NoopLogSink))
    }

    pub fn with_log(config: CallConfig, log: Arc<dyn LogSink>) -> Self {
        Self::with_clock(config, Arc::new(SystemClock), log)
    }

    /// Policy follows `config.topology`.
    pub fn with_clock(config: CallConfig, clock: Arc<dyn Clock>, log: Arc<dyn LogSink>) -> Self {
        let policy: Arc<dyn HandshakePolicy> = match &config.topology {
            Topology::Mesh => Arc::new(MeshPolicy),
            Topology::Relay { relay_id } => Arc::new(RelayPolicy::new(relay_id.clone())),
        };
        Self::with_policy(config, policy, clock, log)
    }

    pub fn with_policy(
        config: CallConfig,
        policy: Arc<dyn HandshakePolicy>,
        clock: Arc<dyn Clock>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let bus = EventBus::new();
        let registry = Arc::new(SessionRegistry::with_log(
            bus.clone(),
            config.max_group_participants,
            log.clone(),
        ));
        let relay = Arc::new(SignalingRelay::new(
            registry.clone(),
            bus.clone(),
            config.exchange_timeout,
            policy.relay_endpoint().map(str::to_owned),
            log.clone(),
        ));
        let media = MediaTrackCoordinator::new(relay.clone(), bus.clone(), log.clone());
        let presence = PresenceMonitor::new(
            registry.clone(),
            config.heartbeat_timeout,
            config.grace_period,
            log.clone(),
        );
        sink_info!(
            log,
            "call core ready: topology={}, heartbeat_timeout={:?}, grace={:?}",
            policy.name(),
            config.heartbeat_timeout,
            config.grace_period
        );
        Self {
            config,
            registry,
            presence,
            relay,
            media,
            policy,
            bus,
            clock,
            log,
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Receiver<CallEvent> {
        self.bus.subscribe()
    }

    pub fn get(&self, call_id: &str) -> Result<Call, CallError> {
        self.registry.get(call_id)
    }

    pub fn list_participants(&self, call_id: &str) -> Result<Vec<Participant>, CallError> {
        self.registry.list_participants(call_id)
    }

    pub fn allocate_call_id(&self) -> Result<CallId, CallError> {
        self.registry.allocate_call_id()
    }

    // ---- Join / leave -------------------------------------------------------

    /// Adds the participant in Joining and returns the peers it must
    /// handshake with. Returns immediately; with no peers to wait for the
    /// participant is Connected right away.
    pub fn request_join(
        &self,
        call_id: &str,
        participant_id: &str,
        kind: CallKind,
    ) -> Result<JoinTicket, CallError> {
        let now = self.clock.now();
        let mut required = BTreeSet::new();

        let outcome = self
            .registry
            .join_with(call_id, participant_id, kind, now, |call, joiner| {
                required = self.policy.required_peers(call, joiner);
                self.bus
                    .state_changed(call_id, joiner, ConnectionState::Joining);
                if let Some(p) = call.participant_mut(joiner) {
                    p.awaiting = required.clone();
                }
                self.settle(call, joiner, now);
            })?;

        if !outcome.joined {
            required = outcome.participant.awaiting.clone();
        }
        sink_debug!(
            self.log,
            "join ticket for {} in {}: state={:?}, peers={:?}",
            participant_id,
            call_id,
            outcome.participant.state,
            required
        );
        Ok(JoinTicket {
            call_id: call_id.to_owned(),
            participant_id: participant_id.to_owned(),
            state: outcome.participant.state,
            handshake_peers: required,
        })
    }

    /// Removes the participant immediately. Idempotent.
    pub fn request_leave(
        &self,
        call_id: &str,
        participant_id: &str,
    ) -> Result<LeaveOutcome, CallError> {
        let now = self.clock.now();
        self.registry.remove_participant(
            call_id,
            participant_id,
            |_| true,
            |call, gone| self.after_departure(call, gone, now),
        )
    }

    /// Cleanup that runs under the call lock right after `gone` was removed.
    fn after_departure(&self, call: &mut Call, gone: &Participant, now: Instant) {
        let gone_id = gone.participant_id.as_str();
        self.relay.cancel_pending_in(call, gone_id);
        self.bus
            .state_changed(&call.call_id, gone_id, ConnectionState::Left);

        let mut released = Vec::new();
        for p in call.participants_mut() {
            if p.awaiting.remove(gone_id) {
                released.push(p.participant_id.clone());
            }
        }
        for id in released {
            self.settle(call, &id, now);
        }
    }

    // ---- Negotiation --------------------------------------------------------

    /// Routes one negotiation message. An answer that completes a handshake
    /// advances the participants it concerns.
    pub fn submit_negotiation_message(
        &self,
        msg: NegotiationMessage,
    ) -> Result<Delivery, CallError> {
        let now = self.clock.now();
        let call_id = msg.call_id.clone();
        self.registry.with_call(&call_id, |call| -> Result<Delivery, CallError> {
            let delivery = self.relay.send_in(call, msg, now)?;
            if let Delivery::Delivered {
                completed: Some(request),
                ..
            } = &delivery
            {
                self.complete_handshake(call, request, now);
            }
            Ok(delivery)
        })?
    }

    fn complete_handshake(&self, call: &mut Call, request: &NegotiationExchange, now: Instant) {
        match request.kind {
            ExchangeKind::Offer => {
                call.link(&request.from, &request.to);
                for (side, peer) in [(&request.from, &request.to), (&request.to, &request.from)] {
                    if let Some(p) = call.participant_mut(side) {
                        if p.state == ConnectionState::Joining {
                            p.awaiting.remove(peer.as_str());
                        }
                    }
                    self.settle(call, side, now);
                }
            }
            ExchangeKind::RenegotiationRequest => {
                if let Some(p) = call.participant_mut(&request.from) {
                    if p.state == ConnectionState::Renegotiating {
                        p.awaiting.remove(request.to.as_str());
                    }
                }
                self.settle(call, &request.from, now);
            }
            ExchangeKind::Answer | ExchangeKind::Candidate => {}
        }
    }

    /// Moves a participant out of Joining/Renegotiating once nobody it waits
    /// for is left.
    fn settle(&self, call: &mut Call, participant_id: &str, now: Instant) {
        let call_id = call.call_id.clone();
        let Some(p) = call.participant_mut(participant_id) else {
            return;
        };
        if !p.awaiting.is_empty() {
            return;
        }
        match p.state {
            ConnectionState::Joining => {
                p.set_state(ConnectionState::Connected, now);
                // Finishing the handshake proves the participant is alive.
                p.last_heartbeat_at = now;
                self.bus
                    .state_changed(&call_id, participant_id, ConnectionState::Connected);
                sink_info!(
                    self.log,
                    "participant {} connected in call {}",
                    participant_id,
                    call_id
                );
                self.apply_held_media(call, participant_id, now);
            }
            ConnectionState::Renegotiating => {
                let target = p.pending_media.take();
                p.set_state(ConnectionState::Connected, now);
                if let Some(flags) = target {
                    self.media.commit(call, participant_id, flags);
                }
                self.bus
                    .state_changed(&call_id, participant_id, ConnectionState::Connected);
                sink_info!(
                    self.log,
                    "participant {} finished renegotiation in call {}",
                    participant_id,
                    call_id
                );
            }
            _ => {}
        }
    }

    // ---- Media --------------------------------------------------------------

    pub fn toggle_media(
        &self,
        call_id: &str,
        participant_id: &str,
        flag: MediaFlag,
        value: bool,
    ) -> Result<ToggleOutcome, CallError> {
        let now = self.clock.now();
        self.registry.with_call(call_id, |call| -> Result<ToggleOutcome, CallError> {
            let not_member = || CallError::NotMember {
                call_id: call_id.to_owned(),
                participant_id: participant_id.to_owned(),
            };
            let plan = {
                let p = call.participant(participant_id).ok_or_else(not_member)?;
                self.media.plan(p, flag, value)
            };

            match plan {
                MediaPlan::Unchanged => Ok(ToggleOutcome::Unchanged),
                MediaPlan::ApplyNow => {
                    let p = call.participant_mut(participant_id).ok_or_else(not_member)?;
                    let flags = p.media_flags.with(flag, value);
                    p.pending_media = p.pending_media.map(|f| f.with(flag, value));
                    self.media.commit(call, participant_id, flags);
                    Ok(ToggleOutcome::Applied(flags))
                }
                MediaPlan::Defer(target) => {
                    let p = call.participant_mut(participant_id).ok_or_else(not_member)?;
                    p.pending_media = (target != p.media_flags).then_some(target);
                    sink_debug!(
                        self.log,
                        "media change of {} in {} deferred until connected",
                        participant_id,
                        call_id
                    );
                    Ok(ToggleOutcome::Deferred)
                }
                MediaPlan::Renegotiate(target) => {
                    match self
                        .media
                        .begin_renegotiation(call, participant_id, target, now)?
                    {
                        RenegotiationStart::Started(peers) => {
                            Ok(ToggleOutcome::RenegotiationStarted { peers })
                        }
                        RenegotiationStart::Applied(flags) => Ok(ToggleOutcome::Applied(flags)),
                        RenegotiationStart::Reverted => Ok(ToggleOutcome::Applied(
                            call.participant(participant_id)
                                .map(|p| p.media_flags)
                                .unwrap_or(target),
                        )),
                    }
                }
            }
        })?
    }

    fn fail_renegotiation(&self, call: &mut Call, participant_id: &str, now: Instant) {
        self.media.withdraw_requests(call, participant_id);
        let call_id = call.call_id.clone();
        let Some(p) = call.participant_mut(participant_id) else {
            return;
        };
        p.pending_media = None;
        p.set_state(ConnectionState::Connected, now);
        self.bus
            .state_changed(&call_id, participant_id, ConnectionState::Connected);
        self.bus.publish(CallEvent::RenegotiationFailed {
            call_id: call_id.clone(),
            participant_id: participant_id.to_owned(),
        });
        sink_info!(
            self.log,
            "renegotiation of {} in call {} timed out; keeping prior media",
            participant_id,
            call_id
        );
    }

    // ---- Presence -----------------------------------------------------------

    /// Records a heartbeat; a Disconnected participant within its grace
    /// period is returned to Connected on the spot.
    pub fn heartbeat(&self, call_id: &str, participant_id: &str) -> HeartbeatOutcome {
        let now = self.clock.now();
        let result = self.registry.with_call(call_id, |call| {
            let outcome = self.presence.heartbeat_in(call, participant_id, now);
            if outcome == HeartbeatOutcome::Resumed {
                self.resume(call, participant_id, now);
            }
            outcome
        });
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                sink_debug!(
                    self.log,
                    "heartbeat from {} for call {} ignored: {}",
                    participant_id,
                    call_id,
                    e
                );
                HeartbeatOutcome::Ignored
            }
        }
    }

    fn resume(&self, call: &mut Call, participant_id: &str, now: Instant) {
        let call_id = call.call_id.clone();
        let Some(p) = call.participant_mut(participant_id) else {
            return;
        };
        if p.state != ConnectionState::Disconnected {
            return;
        }
        p.set_state(ConnectionState::Connected, now);
        self.bus
            .state_changed(&call_id, participant_id, ConnectionState::Connected);
        sink_info!(
            self.log,
            "participant {} reconnected to call {}",
            participant_id,
            call_id
        );
        self.apply_held_media(call, participant_id, now);
    }

    /// Renegotiates a media change that was held back while the participant
    /// was not Connected.
    fn apply_held_media(&self, call: &mut Call, participant_id: &str, now: Instant) {
        let Some(p) = call.participant_mut(participant_id) else {
            return;
        };
        let Some(target) = p.pending_media.filter(|pending| *pending != p.media_flags) else {
            p.pending_media = None;
            return;
        };
        if let Err(e) = self
            .media
            .begin_renegotiation(call, participant_id, target, now)
        {
            sink_error!(
                self.log,
                "renegotiation of held media for {} failed: {}",
                participant_id,
                e
            );
        }
    }

    fn mark_lost(&self, call: &mut Call, participant_id: &str, now: Instant) -> bool {
        let renegotiating = match call.participant(participant_id) {
            Some(p) if self.presence.is_lost(p, now) => {
                p.state == ConnectionState::Renegotiating
            }
            _ => return false,
        };
        if renegotiating {
            // The pending change survives as drift for the reconnect.
            self.media.withdraw_requests(call, participant_id);
        }
        let call_id = call.call_id.clone();
        let Some(p) = call.participant_mut(participant_id) else {
            return false;
        };
        p.set_state(ConnectionState::Disconnected, now);
        self.bus
            .state_changed(&call_id, participant_id, ConnectionState::Disconnected);
        self.bus.publish(CallEvent::ParticipantTimedOut {
            call_id: call_id.clone(),
            participant_id: participant_id.to_owned(),
        });
        sink_info!(
            self.log,
            "participant {} in call {} missed heartbeats; disconnected",
            participant_id,
            call_id
        );
        true
    }

    /// Runs every time-based transition that is due: heartbeat loss, grace
    /// expiry, reconnection, join and renegotiation timeouts, and expiry of
    /// unanswered exchanges.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport {
            presence: self.presence.sweep(now),
            ..TickReport::default()
        };

        for ev in &report.presence {
            let (call_id, pid) = (ev.call_id.as_str(), ev.participant_id.as_str());
            match ev.signal {
                PresenceSignal::HeartbeatLost => {
                    let _ = self
                        .registry
                        .with_call(call_id, |call| self.mark_lost(call, pid, now));
                }
                PresenceSignal::Resumed => {
                    let _ = self.registry.with_call(call_id, |call| {
                        if call
                            .participant(pid)
                            .is_some_and(|p| self.presence.has_resumed(p))
                        {
                            self.resume(call, pid, now);
                        }
                    });
                }
                PresenceSignal::GraceExpired => {
                    match self.registry.remove_participant(
                        call_id,
                        pid,
                        |p| self.presence.grace_expired(p, now),
                        |call, gone| self.after_departure(call, gone, now),
                    ) {
                        Ok(LeaveOutcome::Left { .. }) => {
                            sink_info!(
                                self.log,
                                "participant {} removed from call {} after grace period",
                                pid,
                                call_id
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            sink_warn!(self.log, "grace removal of {} failed: {}", pid, e);
                        }
                    }
                }
            }
        }

        let call_ids = match self.registry.call_ids() {
            Ok(ids) => ids,
            Err(e) => {
                sink_warn!(self.log, "timeout scan skipped: {}", e);
                return report;
            }
        };
        for call_id in call_ids {
            let stale_joins = self.registry.with_call(&call_id, |call| {
                let overdue: Vec<ParticipantId> = call
                    .participants()
                    .iter()
                    .filter(|p| {
                        p.state == ConnectionState::Renegotiating
                            && now.saturating_duration_since(p.state_since())
                                >= self.config.renegotiation_timeout
                    })
                    .map(|p| p.participant_id.clone())
                    .collect();
                for pid in overdue {
                    self.fail_renegotiation(call, &pid, now);
                    report.failed_renegotiations.push((call_id.clone(), pid));
                }

                report
                    .expired_exchanges
                    .extend(self.relay.expire_in(call, now));

                call.participants()
                    .iter()
                    .filter(|p| self.join_overdue(p, now))
                    .map(|p| p.participant_id.clone())
                    .collect::<Vec<_>>()
            });

            for pid in stale_joins.unwrap_or_default() {
                let removed = self.registry.remove_participant(
                    &call_id,
                    &pid,
                    |p| self.join_overdue(p, now),
                    |call, gone| self.after_departure(call, gone, now),
                );
                if let Ok(LeaveOutcome::Left { .. }) = removed {
                    sink_info!(
                        self.log,
                        "join of {} to call {} timed out; abandoned",
                        pid,
                        call_id
                    );
                    report.abandoned_joins.push((call_id.clone(), pid));
                }
            }
        }
        report
    }

    fn join_overdue(&self, p: &Participant, now: Instant) -> bool {
        p.state == ConnectionState::Joining
            && now.saturating_duration_since(p.joined_at) >= self.config.join_timeout
    }

    /// Starts a named background thread calling `tick` every
    /// `sweep_interval`. The thread only holds a weak reference, so it also
    /// exits once the state machine is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> io::Result<SweeperHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let log = self.log.clone();

        let thread = thread::Builder::new()
            .name("presence-sweeper".into())
            .spawn(move || {
                sink_debug!(log, "presence sweeper started (interval {:?})", interval);
                loop {
                    thread::park_timeout(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(machine) = weak.upgrade() else {
                        break;
                    };
                    machine.tick();
                }
                sink_debug!(log, "presence sweeper stopped");
            })?;

        Ok(SweeperHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Stops the sweeper thread when dropped.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stops the thread and waits for it to exit.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::call::clock::ManualClock;
    use std::time::Duration;

    struct Harness {
        sm: CallStateMachine,
        clock: Arc<ManualClock>,
        rx: Receiver<CallEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(CallConfig::default())
        }

        fn with_config(config: CallConfig) -> Self {
            let clock = Arc::new(ManualClock::new());
            let sm = CallStateMachine::with_clock(config, clock.clone(), Arc::new(NoopLogSink));
            let rx = sm.subscribe();
            Self { sm, clock, rx }
        }

        fn events(&self) -> Vec<CallEvent> {
            self.rx.try_iter().collect()
        }

        fn state(&self, call_id: &str, who: &str) -> Option<ConnectionState> {
            self.sm.get(call_id).ok().and_then(|c| c.state_of(who))
        }

        fn offer_answer(&self, call_id: &str, from: &str, to: &str) {
            let offer = NegotiationMessage::new(call_id, from, to, ExchangeKind::Offer, &b"o"[..]);
            self.sm.submit_negotiation_message(offer).unwrap();
            let answer = NegotiationMessage::new(call_id, to, from, ExchangeKind::Answer, &b"a"[..]);
            self.sm.submit_negotiation_message(answer).unwrap();
        }

        /// Joins `who` in order, each one handshaking with everyone already in.
        fn connect_all(&self, call_id: &str, kind: CallKind, who: &[&str]) {
            for w in who {
                let ticket = self.sm.request_join(call_id, w, kind).unwrap();
                for peer in &ticket.handshake_peers {
                    self.offer_answer(call_id, w, peer);
                }
                assert_eq!(self.state(call_id, w), Some(ConnectionState::Connected));
            }
        }

        fn advance(&self, secs: u64) -> TickReport {
            self.clock.advance(Duration::from_secs(secs));
            self.sm.tick()
        }
    }

    fn state_changes(events: &[CallEvent], who: &str) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::ParticipantStateChanged {
                    participant_id,
                    state,
                    ..
                } if participant_id == who => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn renegotiation_requests(events: &[CallEvent]) -> Vec<NegotiationExchange> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::NegotiationMessage(x) if x.kind == ExchangeKind::RenegotiationRequest => {
                    Some(x.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_joiner_is_connected_immediately() {
        let h = Harness::new();
        let ticket = h.sm.request_join("g1", "a", CallKind::Group).unwrap();
        assert!(ticket.handshake_peers.is_empty());
        assert_eq!(ticket.state, ConnectionState::Connected);
        assert_eq!(
            state_changes(&h.events(), "a"),
            vec![ConnectionState::Joining, ConnectionState::Connected]
        );
    }

    #[test]
    fn joiner_connects_only_after_every_required_handshake() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);

        let ticket = h.sm.request_join("g1", "c", CallKind::Group).unwrap();
        assert_eq!(ticket.state, ConnectionState::Joining);
        assert_eq!(ticket.handshake_peers.len(), 2);

        h.offer_answer("g1", "c", "a");
        assert_eq!(h.state("g1", "c"), Some(ConnectionState::Joining));
        h.offer_answer("g1", "c", "b");
        assert_eq!(h.state("g1", "c"), Some(ConnectionState::Connected));

        let call = h.sm.get("g1").unwrap();
        assert!(call.is_linked("a", "c") && call.is_linked("b", "c") && call.is_linked("a", "b"));
    }

    #[test]
    fn rejoin_returns_existing_ticket() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a"]);
        h.sm.request_join("g1", "b", CallKind::Group).unwrap();
        let again = h.sm.request_join("g1", "b", CallKind::Group).unwrap();
        assert_eq!(again.state, ConnectionState::Joining);
        assert_eq!(again.handshake_peers, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn relay_topology_requires_only_the_relay() {
        let config = CallConfig {
            topology: Topology::Relay {
                relay_id: "sfu".into(),
            },
            ..CallConfig::default()
        };
        let h = Harness::with_config(config);
        let ticket = h.sm.request_join("g1", "a", CallKind::Group).unwrap();
        assert_eq!(ticket.handshake_peers, BTreeSet::from(["sfu".to_string()]));
        assert_eq!(ticket.state, ConnectionState::Joining);

        h.offer_answer("g1", "a", "sfu");
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Connected));
    }

    #[test]
    fn one_to_one_call_rejects_third_participant() {
        let h = Harness::new();
        h.connect_all("g2", CallKind::OneToOne, &["A", "B"]);
        for third in ["C", "D"] {
            let err = h.sm.request_join("g2", third, CallKind::OneToOne).unwrap_err();
            assert!(matches!(err, CallError::CallFull { capacity: 2, .. }));
        }
        let roster: Vec<_> = h
            .sm
            .list_participants("g2")
            .unwrap()
            .into_iter()
            .map(|p| p.participant_id)
            .collect();
        assert_eq!(roster, vec!["A", "B"]);
    }

    #[test]
    fn audio_and_video_toggles_never_renegotiate() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b", "c"]);
        h.events();

        for (flag, value) in [
            (MediaFlag::Audio, false),
            (MediaFlag::Video, false),
            (MediaFlag::Audio, true),
        ] {
            let out = h.sm.toggle_media("g1", "a", flag, value).unwrap();
            assert!(matches!(out, ToggleOutcome::Applied(_)));
        }
        assert_eq!(
            h.sm.toggle_media("g1", "a", MediaFlag::Audio, true).unwrap(),
            ToggleOutcome::Unchanged
        );
        let events = h.events();
        assert!(renegotiation_requests(&events).is_empty());
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Connected));
    }

    #[test]
    fn screen_share_toggle_renegotiates_once_per_peer() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::GroupWithScreenShare, &["a", "b", "c"]);
        h.events();

        h.sm.toggle_media("g1", "a", MediaFlag::ScreenShare, true).unwrap();
        let requests = renegotiation_requests(&h.events());
        let mut targets: Vec<_> = requests.iter().map(|r| r.to.clone()).collect();
        targets.sort();
        assert_eq!(targets, vec!["b", "c"]);
        assert!(requests.iter().all(|r| r.from == "a"));
    }

    #[test]
    fn screen_share_becomes_active_after_peer_acknowledges() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["A", "B"]);
        h.events();

        let out = h.sm.toggle_media("g1", "A", MediaFlag::ScreenShare, true).unwrap();
        assert_eq!(
            out,
            ToggleOutcome::RenegotiationStarted {
                peers: BTreeSet::from(["B".to_string()])
            }
        );
        let a = &h.sm.list_participants("g1").unwrap()[0];
        assert!(!a.media_flags.screen_share_enabled, "not active before ack");

        let events = h.events();
        let requests = renegotiation_requests(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!((requests[0].from.as_str(), requests[0].to.as_str()), ("A", "B"));

        let ack = NegotiationMessage::new("g1", "B", "A", ExchangeKind::Answer, &b"sdp"[..])
            .in_reply_to(requests[0].exchange_id);
        h.sm.submit_negotiation_message(ack).unwrap();

        let events = [events, h.events()].concat();
        assert_eq!(
            state_changes(&events, "A"),
            vec![ConnectionState::Renegotiating, ConnectionState::Connected]
        );
        let a = &h.sm.list_participants("g1").unwrap()[0];
        assert!(a.media_flags.screen_share_enabled);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::MediaChanged { participant_id, flags, .. }
                if participant_id == "A" && flags.screen_share_enabled
        )));
    }

    #[test]
    fn renegotiation_timeout_falls_back_to_prior_media() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.sm.toggle_media("g1", "a", MediaFlag::Audio, false).unwrap();
        h.sm.toggle_media("g1", "a", MediaFlag::ScreenShare, true).unwrap();
        h.sm.heartbeat("g1", "a");
        h.sm.heartbeat("g1", "b");
        h.events();

        let report = h.advance(10);
        assert_eq!(report.failed_renegotiations, vec![("g1".into(), "a".into())]);

        let a = h.sm.list_participants("g1").unwrap().remove(0);
        assert_eq!(a.state, ConnectionState::Connected);
        assert_eq!(a.media_flags, MediaFlags::default().with(MediaFlag::Audio, false));
        assert_eq!(a.pending_media(), None);
        assert!(h.events().iter().any(|e| matches!(e, CallEvent::RenegotiationFailed { .. })));
        assert_eq!(h.sm.get("g1").unwrap().in_flight().count(), 0);
    }

    #[test]
    fn join_handshake_timeout_abandons_join() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a"]);
        h.sm.request_join("g1", "b", CallKind::Group).unwrap();
        let offer = NegotiationMessage::new("g1", "b", "a", ExchangeKind::Offer, &b"o"[..]);
        h.sm.submit_negotiation_message(offer).unwrap();
        h.events();

        assert!(h.advance(19).abandoned_joins.is_empty());
        let report = h.advance(1);
        assert_eq!(report.abandoned_joins, vec![("g1".into(), "b".into())]);
        assert_eq!(state_changes(&h.events(), "b"), vec![ConnectionState::Left]);
        assert_eq!(h.sm.get("g1").unwrap().in_flight().count(), 0);
    }

    #[test]
    fn silent_participant_disconnects_then_leaves() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.events();

        for _ in 0..3 {
            h.advance(5);
            h.sm.heartbeat("g1", "b");
        }
        // a last beat at t=0; at t=15 it is exactly at the limit.
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Connected));
        h.advance(1);
        h.sm.heartbeat("g1", "b");
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Disconnected));

        h.advance(9);
        h.sm.heartbeat("g1", "b");
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Disconnected));
        h.advance(1);
        assert_eq!(h.state("g1", "a"), None);

        let events = h.events();
        assert_eq!(
            state_changes(&events, "a"),
            vec![ConnectionState::Disconnected, ConnectionState::Left]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::ParticipantTimedOut { participant_id, .. } if participant_id == "a"
        )));
        assert_eq!(h.sm.list_participants("g1").unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_within_grace_reconnects_without_handshake() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.advance(10);
        h.sm.heartbeat("g1", "b");
        h.advance(6);
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Disconnected));
        h.events();

        h.clock.advance(Duration::from_secs(4));
        assert_eq!(h.sm.heartbeat("g1", "a"), HeartbeatOutcome::Resumed);
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Connected));

        let events = h.events();
        assert_eq!(state_changes(&events, "a"), vec![ConnectionState::Connected]);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, CallEvent::NegotiationMessage(_))),
            "reconnect must not re-run the handshake"
        );
    }

    #[test]
    fn screen_share_toggled_while_disconnected_is_renegotiated_on_return() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.advance(10);
        h.sm.heartbeat("g1", "b");
        h.advance(6);
        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Disconnected));

        assert_eq!(
            h.sm.toggle_media("g1", "a", MediaFlag::ScreenShare, true).unwrap(),
            ToggleOutcome::Deferred
        );
        h.events();
        h.clock.advance(Duration::from_secs(1));
        h.sm.heartbeat("g1", "a");

        assert_eq!(h.state("g1", "a"), Some(ConnectionState::Renegotiating));
        assert_eq!(renegotiation_requests(&h.events()).len(), 1);
    }

    #[test]
    fn screen_share_toggled_while_joining_is_renegotiated_once_connected() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.sm.request_join("g1", "c", CallKind::Group).unwrap();
        h.offer_answer("g1", "c", "a");
        assert!(h.sm.get("g1").unwrap().is_linked("a", "c"));
        h.events();

        assert_eq!(
            h.sm.toggle_media("g1", "c", MediaFlag::ScreenShare, true).unwrap(),
            ToggleOutcome::Deferred
        );
        let c = h.sm.list_participants("g1").unwrap().remove(2);
        assert!(!c.media_flags.screen_share_enabled);
        assert!(renegotiation_requests(&h.events()).is_empty());

        h.offer_answer("g1", "c", "b");
        assert_eq!(h.state("g1", "c"), Some(ConnectionState::Renegotiating));
        let requests = renegotiation_requests(&h.events());
        let mut targets: Vec<_> = requests.iter().map(|r| r.to.clone()).collect();
        targets.sort();
        assert_eq!(targets, vec!["a", "b"]);

        for r in &requests {
            let ack =
                NegotiationMessage::new("g1", r.to.clone(), "c", ExchangeKind::Answer, &b"sdp"[..])
                    .in_reply_to(r.exchange_id);
            h.sm.submit_negotiation_message(ack).unwrap();
        }
        assert_eq!(h.state("g1", "c"), Some(ConnectionState::Connected));
        let c = h.sm.list_participants("g1").unwrap().remove(2);
        assert!(c.media_flags.screen_share_enabled);
    }

    #[test]
    fn finishing_the_join_counts_as_a_heartbeat() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a"]);
        h.sm.request_join("g1", "b", CallKind::Group).unwrap();

        // Slow but within the join timeout, and no heartbeat while joining.
        h.clock.advance(Duration::from_secs(18));
        h.sm.heartbeat("g1", "a");
        h.offer_answer("g1", "b", "a");
        assert_eq!(h.state("g1", "b"), Some(ConnectionState::Connected));

        h.advance(5);
        assert_eq!(h.state("g1", "b"), Some(ConnectionState::Connected));
    }

    #[test]
    fn leaving_cancels_pending_exchanges_and_blocks_delivery() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b", "c"]);
        h.sm.toggle_media("g1", "a", MediaFlag::ScreenShare, true).unwrap();
        let offer = NegotiationMessage::new("g1", "c", "b", ExchangeKind::Offer, &b"o"[..]);
        h.sm.submit_negotiation_message(offer).unwrap();
        h.events();

        h.sm.request_leave("g1", "b").unwrap();
        let call = h.sm.get("g1").unwrap();
        assert!(call.in_flight().all(|e| !e.involves("b")));

        let late = NegotiationMessage::new("g1", "c", "b", ExchangeKind::Candidate, &b"x"[..]);
        assert_eq!(h.sm.submit_negotiation_message(late).unwrap(), Delivery::Dropped);
        assert!(
            !h.events()
                .iter()
                .any(|e| matches!(e, CallEvent::NegotiationMessage(x) if x.to == "b"))
        );
    }

    #[test]
    fn peer_leaving_releases_pending_renegotiation() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.sm.toggle_media("g1", "a", MediaFlag::ScreenShare, true).unwrap();
        h.sm.request_leave("g1", "b").unwrap();

        let a = h.sm.list_participants("g1").unwrap().remove(0);
        assert_eq!(a.state, ConnectionState::Connected);
        assert!(a.media_flags.screen_share_enabled);
    }

    #[test]
    fn call_exists_exactly_while_it_has_participants() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.sm.request_leave("g1", "a").unwrap();
        assert!(h.sm.get("g1").is_ok());
        h.sm.request_leave("g1", "b").unwrap();
        assert!(matches!(h.sm.get("g1"), Err(CallError::NotFound(_))));
        assert!(h.events().contains(&CallEvent::CallEnded {
            call_id: "g1".into()
        }));

        // Timeouts end calls too.
        h.connect_all("g3", CallKind::Group, &["x"]);
        h.advance(16);
        h.advance(10);
        assert!(matches!(h.sm.get("g3"), Err(CallError::NotFound(_))));
        assert_eq!(h.sm.registry().active_call_count().unwrap(), 0);
    }

    #[test]
    fn leave_is_idempotent() {
        let h = Harness::new();
        h.connect_all("g1", CallKind::Group, &["a", "b"]);
        h.sm.request_leave("g1", "a").unwrap();
        assert!(matches!(
            h.sm.request_leave("g1", "a").unwrap(),
            LeaveOutcome::NotMember
        ));
        assert!(matches!(
            h.sm.request_leave("nope", "a").unwrap(),
            LeaveOutcome::NotMember
        ));
    }

    #[test]
    fn sweeper_thread_applies_timeouts() {
        let config = CallConfig {
            sweep_interval: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_millis(20),
            grace_period: Duration::from_millis(20),
            ..CallConfig::default()
        };
        let sm = Arc::new(CallStateMachine::new(config));
        let rx = sm.subscribe();
        sm.request_join("g1", "a", CallKind::Group).unwrap();
        let sweeper = sm.spawn_sweeper().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ended = false;
        while Instant::now() < deadline {
            if let Ok(CallEvent::CallEnded { call_id }) = rx.recv_timeout(Duration::from_millis(100)) {
                assert_eq!(call_id, "g1");
                ended = true;
                break;
            }
        }
        sweeper.stop();
        assert!(ended, "sweeper should have timed out the silent participant");
    }
}
