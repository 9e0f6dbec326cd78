use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use crate::call::errors::CallError;
use crate::call::events::{CallEvent, EventBus};
use crate::call::types::{
    CallId, CallKind, ConnectionState, MediaFlags, NegotiationExchange, ParticipantId,
};
use crate::log::NoopLogSink;
use crate::log::log_sink::LogSink;
use crate::{sink_debug, sink_info, sink_warn};

/// One user's membership in one call.
#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub state: ConnectionState,
    /// Active media flags, as every peer currently sees them.
    pub media_flags: MediaFlags,
    pub last_heartbeat_at: Instant,
    pub joined_at: Instant,
    pub(crate) state_since: Instant,
    /// Requested flags that still need a renegotiation to become active.
    pub(crate) pending_media: Option<MediaFlags>,
    /// Peers whose answer this participant is waiting for, either to finish
    /// joining or to finish a renegotiation.
    pub(crate) awaiting: BTreeSet<ParticipantId>,
}

impl Participant {
    fn new(participant_id: ParticipantId, now: Instant) -> Self {
        Self {
            participant_id,
            state: ConnectionState::Joining,
            media_flags: MediaFlags::default(),
            last_heartbeat_at: now,
            joined_at: now,
            state_since: now,
            pending_media: None,
            awaiting: BTreeSet::new(),
        }
    }

    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    pub fn pending_media(&self) -> Option<MediaFlags> {
        self.pending_media
    }

    pub fn awaiting_peers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.awaiting.iter()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.state_since = now;
    }
}

/// A negotiation request waiting for its answer.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub exchange: NegotiationExchange,
    pub deadline: Instant,
}

/// One active multi-party session. Owns its participants exclusively.
#[derive(Debug, Clone)]
pub struct Call {
    pub call_id: CallId,
    pub kind: CallKind,
    pub created_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    /// Join order.
    participants: Vec<Participant>,
    links: HashSet<(ParticipantId, ParticipantId)>,
    departed: HashSet<ParticipantId>,
    pub(crate) inflight: VecDeque<InFlight>,
}

fn pair_key(a: &str, b: &str) -> (ParticipantId, ParticipantId) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

impl Call {
    fn new(call_id: CallId, kind: CallKind) -> Self {
        Self {
            call_id,
            kind,
            created_at: SystemTime::now(),
            ended_at: None,
            participants: Vec::new(),
            links: HashSet::new(),
            departed: HashSet::new(),
            inflight: VecDeque::new(),
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    pub(crate) fn participant_mut(&mut self, participant_id: &str) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
    }

    pub(crate) fn participants_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.iter_mut()
    }

    pub fn is_member(&self, participant_id: &str) -> bool {
        self.participant(participant_id).is_some()
    }

    /// True if the participant was a member of this call and has left it.
    pub fn has_departed(&self, participant_id: &str) -> bool {
        self.departed.contains(participant_id)
    }

    pub fn state_of(&self, participant_id: &str) -> Option<ConnectionState> {
        self.participant(participant_id).map(|p| p.state)
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &NegotiationExchange> {
        self.inflight.iter().map(|f| &f.exchange)
    }

    /// Records that `a` and `b` have completed a handshake with each other.
    pub(crate) fn link(&mut self, a: &str, b: &str) {
        self.links.insert(pair_key(a, b));
    }

    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.links.contains(&pair_key(a, b))
    }

    fn remove(&mut self, participant_id: &str) -> Option<Participant> {
        let pos = self
            .participants
            .iter()
            .position(|p| p.participant_id == participant_id)?;
        let mut removed = self.participants.remove(pos);
        removed.state = ConnectionState::Left;
        self.links
            .retain(|(a, b)| a != participant_id && b != participant_id);
        self.departed.insert(participant_id.to_owned());
        Some(removed)
    }
}

/// Result of `SessionRegistry::create_or_join`.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: Participant,
    /// False when the participant was already a member of this call.
    pub joined: bool,
}

#[derive(Debug, Clone)]
pub enum LeaveOutcome {
    NotMember,
    /// The guard declined the removal.
    Retained,
    Left {
        participant: Participant,
        call_ended: bool,
    },
}

/// Call id → call, plus the participant → call index that keeps every
/// participant in at most one call.
///
/// Lock order: the call directory or a single call, then memberships.
/// The directory lock is never held while waiting on a call lock. The
/// memberships lock is always taken last and only for one lookup or update,
/// so two calls never wait on each other's joins and leaves.
pub struct SessionRegistry {
    calls: RwLock<HashMap<CallId, Arc<Mutex<Call>>>>,
    memberships: Mutex<HashMap<ParticipantId, CallId>>,
    group_cap: Option<usize>,
    bus: EventBus,
    log: Arc<dyn LogSink>,
}

impl SessionRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self::with_log(bus, None, Arc::new(NoopLogSink))
    }

    pub fn with_log(bus: EventBus, group_cap: Option<usize>, log: Arc<dyn LogSink>) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            group_cap,
            bus,
            log,
        }
    }

    fn handle(&self, call_id: &str) -> Result<Arc<Mutex<Call>>, CallError> {
        self.calls
            .read()?
            .get(call_id)
            .cloned()
            .ok_or_else(|| CallError::NotFound(call_id.to_owned()))
    }

    /// Looks up `call_id`, creating an empty call when there is none.
    fn open_call(&self, call_id: &str, kind: CallKind) -> Result<Arc<Mutex<Call>>, CallError> {
        if let Some(handle) = self.calls.read()?.get(call_id) {
            return Ok(handle.clone());
        }
        let mut calls = self.calls.write()?;
        Ok(calls
            .entry(call_id.to_owned())
            .or_insert_with(|| {
                sink_info!(self.log, "call {} created (kind={:?})", call_id, kind);
                Arc::new(Mutex::new(Call::new(call_id.to_owned(), kind)))
            })
            .clone())
    }

    /// Claims `participant_id` for `call_id` unless it belongs to another
    /// call. Returns true when this claim is new.
    fn reserve(&self, call_id: &str, participant_id: &str) -> Result<bool, CallError> {
        let mut memberships = self.memberships.lock()?;
        match memberships.get(participant_id) {
            Some(active_call) if active_call != call_id => Err(CallError::AlreadyJoined {
                participant_id: participant_id.to_owned(),
                active_call: active_call.clone(),
            }),
            Some(_) => Ok(false),
            None => {
                memberships.insert(participant_id.to_owned(), call_id.to_owned());
                Ok(true)
            }
        }
    }

    /// Drops the claim of `participant_id` on `call_id`. A claim on another
    /// call is left alone.
    fn release(&self, call_id: &str, participant_id: &str) {
        match self.memberships.lock() {
            Ok(mut memberships) => {
                if memberships.get(participant_id).map(String::as_str) == Some(call_id) {
                    memberships.remove(participant_id);
                }
            }
            Err(e) => sink_warn!(
                self.log,
                "membership of {} in {} not released: {}",
                participant_id,
                call_id,
                e
            ),
        }
    }

    /// Adds `participant_id` to `call_id`, creating the call on first join.
    pub fn create_or_join(
        &self,
        call_id: &str,
        participant_id: &str,
        kind: CallKind,
        now: Instant,
    ) -> Result<JoinOutcome, CallError> {
        self.join_with(call_id, participant_id, kind, now, |_, _| {})
    }

    /// Like `create_or_join`, but runs `init` on the call under the same lock
    /// right after a new participant was added. `init` does not run for a
    /// participant that was already a member.
    ///
    /// The membership is claimed up front and given back if the join fails.
    pub fn join_with<F>(
        &self,
        call_id: &str,
        participant_id: &str,
        kind: CallKind,
        now: Instant,
        init: F,
    ) -> Result<JoinOutcome, CallError>
    where
        F: FnOnce(&mut Call, &str),
    {
        let reserved = self.reserve(call_id, participant_id)?;
        let result = self.join_reserved(call_id, participant_id, kind, now, init);
        if reserved && result.is_err() {
            self.release(call_id, participant_id);
        }
        result
    }

    fn join_reserved<F>(
        &self,
        call_id: &str,
        participant_id: &str,
        kind: CallKind,
        now: Instant,
        init: F,
    ) -> Result<JoinOutcome, CallError>
    where
        F: FnOnce(&mut Call, &str),
    {
        loop {
            let handle = self.open_call(call_id, kind)?;
            let mut call = handle.lock()?;
            // An ended call is already gone from the directory; look again.
            if call.ended_at.is_some() {
                continue;
            }
            return self.join_locked(&mut call, participant_id, kind, now, init);
        }
    }

    fn join_locked<F>(
        &self,
        call: &mut Call,
        participant_id: &str,
        kind: CallKind,
        now: Instant,
        init: F,
    ) -> Result<JoinOutcome, CallError>
    where
        F: FnOnce(&mut Call, &str),
    {
        let call_id = call.call_id.clone();
        if let Some(existing) = call.participant(participant_id) {
            return Ok(JoinOutcome {
                participant: existing.clone(),
                joined: false,
            });
        }

        if let Some(capacity) = call.kind.capacity(self.group_cap) {
            if call.participants.len() >= capacity {
                sink_warn!(
                    self.log,
                    "join rejected: call {} full ({} participants), participant={}",
                    call_id,
                    capacity,
                    participant_id
                );
                return Err(CallError::CallFull {
                    call_id: call_id.clone(),
                    capacity,
                });
            }
        }
        if call.kind != kind {
            sink_debug!(
                self.log,
                "participant {} asked for {:?}, call {} is {:?}",
                participant_id,
                kind,
                call_id,
                call.kind
            );
        }

        // A concurrent failed join of the same participant may have given the
        // claim back; take it again before the participant becomes visible.
        {
            let mut memberships = self.memberships.lock()?;
            let claimed = memberships
                .entry(participant_id.to_owned())
                .or_insert_with(|| call_id.clone());
            if *claimed != call_id {
                return Err(CallError::AlreadyJoined {
                    participant_id: participant_id.to_owned(),
                    active_call: claimed.clone(),
                });
            }
        }

        call.participants
            .push(Participant::new(participant_id.to_owned(), now));
        call.departed.remove(participant_id);

        init(call, participant_id);
        let participant = call
            .participant(participant_id)
            .cloned()
            .ok_or_else(|| CallError::NotMember {
                call_id: call_id.clone(),
                participant_id: participant_id.to_owned(),
            })?;

        sink_info!(
            self.log,
            "participant {} joined call {} ({} members)",
            participant_id,
            call_id,
            call.participants.len()
        );

        Ok(JoinOutcome {
            participant,
            joined: true,
        })
    }

    /// Removes a participant. Idempotent: a non-member is a no-op.
    pub fn leave(&self, call_id: &str, participant_id: &str) -> Result<LeaveOutcome, CallError> {
        self.remove_participant(call_id, participant_id, |_| true, |_, _| {})
    }

    /// Removes a participant if `guard` agrees, running `cleanup` on the call
    /// under the same lock so no other mutation observes a half-applied leave.
    /// Only this call is locked while `cleanup` runs.
    ///
    /// Tears the call down (and publishes `CallEnded`) when it empties.
    pub fn remove_participant<G, C>(
        &self,
        call_id: &str,
        participant_id: &str,
        guard: G,
        cleanup: C,
    ) -> Result<LeaveOutcome, CallError>
    where
        G: FnOnce(&Participant) -> bool,
        C: FnOnce(&mut Call, &Participant),
    {
        let Ok(handle) = self.handle(call_id) else {
            return Ok(LeaveOutcome::NotMember);
        };
        let mut call = handle.lock()?;
        if call.ended_at.is_some() {
            return Ok(LeaveOutcome::NotMember);
        }

        match call.participant(participant_id) {
            None => return Ok(LeaveOutcome::NotMember),
            Some(p) if !guard(p) => return Ok(LeaveOutcome::Retained),
            Some(_) => {}
        }
        let Some(participant) = call.remove(participant_id) else {
            return Ok(LeaveOutcome::NotMember);
        };
        self.release(call_id, participant_id);

        cleanup(&mut call, &participant);

        let call_ended = call.participants.is_empty();
        sink_info!(
            self.log,
            "participant {} left call {} ({} remaining)",
            participant_id,
            call_id,
            call.participants.len()
        );

        if call_ended {
            call.ended_at = Some(SystemTime::now());
            call.inflight.clear();
            self.calls.write()?.remove(call_id);
            sink_info!(self.log, "call {} ended", call_id);
            self.bus.publish(CallEvent::CallEnded {
                call_id: call_id.to_owned(),
            });
        }

        Ok(LeaveOutcome::Left {
            participant,
            call_ended,
        })
    }

    /// Runs `f` with exclusive access to one call.
    pub fn with_call<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut Call) -> R,
    ) -> Result<R, CallError> {
        let handle = self.handle(call_id)?;
        let mut call = handle.lock()?;
        if call.ended_at.is_some() {
            return Err(CallError::NotFound(call_id.to_owned()));
        }
        Ok(f(&mut call))
    }

    pub fn get(&self, call_id: &str) -> Result<Call, CallError> {
        self.with_call(call_id, |call| call.clone())
    }

    /// Participants in join order.
    pub fn list_participants(&self, call_id: &str) -> Result<Vec<Participant>, CallError> {
        self.with_call(call_id, |call| call.participants.clone())
    }

    pub fn call_ids(&self) -> Result<Vec<CallId>, CallError> {
        Ok(self.calls.read()?.keys().cloned().collect())
    }

    pub fn call_of(&self, participant_id: &str) -> Result<Option<CallId>, CallError> {
        Ok(self.memberships.lock()?.get(participant_id).cloned())
    }

    pub fn active_call_count(&self) -> Result<usize, CallError> {
        Ok(self.calls.read()?.len())
    }

    /// Returns a random call id not used by any active call.
    pub fn allocate_call_id(&self) -> Result<CallId, CallError> {
        let calls = self.calls.read()?;
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(|c| char::from(c).to_ascii_lowercase())
                .collect();
            let call_id = format!("call-{suffix}");
            if !calls.contains_key(&call_id) {
                return Ok(call_id);
            }
        }
    }
}
