use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::call::errors::CallError;
use crate::call::events::{CallEvent, EventBus};
use crate::call::registry::{Call, Participant};
use crate::call::relay::{Delivery, SignalingRelay};
use crate::call::types::{
    ConnectionState, ExchangeKind, MediaFlag, MediaFlags, NegotiationExchange, NegotiationMessage,
    ParticipantId,
};
use crate::log::log_sink::LogSink;
use crate::{sink_debug, sink_info};

/// How a media-flag change has to be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPlan {
    /// The flag already has the requested value.
    Unchanged,
    /// Only the track's enabled bit changes; no peer needs a new description.
    ApplyNow,
    /// The participant is not Connected yet or is unreachable; the change
    /// is renegotiated once it is Connected.
    Defer(MediaFlags),
    /// Every connected peer must re-run the handshake before `MediaFlags`
    /// becomes active.
    Renegotiate(MediaFlags),
}

/// What `begin_renegotiation` ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenegotiationStart {
    /// Requests went out to these peers.
    Started(BTreeSet<ParticipantId>),
    /// No peer needed telling; the flags are active already.
    Applied(MediaFlags),
    /// The target equals the active flags; any renegotiation was dropped.
    Reverted,
}

/// Decides which media changes need renegotiation and drives the
/// renegotiation-request fan-out through the relay.
pub struct MediaTrackCoordinator {
    relay: Arc<SignalingRelay>,
    bus: EventBus,
    log: Arc<dyn LogSink>,
}

impl MediaTrackCoordinator {
    pub fn new(relay: Arc<SignalingRelay>, bus: EventBus, log: Arc<dyn LogSink>) -> Self {
        Self { relay, bus, log }
    }

    /// Audio and video ride on tracks that are already negotiated; a screen
    /// share adds or removes a whole source.
    pub fn requires_renegotiation(flag: MediaFlag) -> bool {
        matches!(flag, MediaFlag::ScreenShare)
    }

    pub fn plan(&self, participant: &Participant, flag: MediaFlag, value: bool) -> MediaPlan {
        let intended = participant.pending_media.unwrap_or(participant.media_flags);
        if intended.get(flag) == value {
            return MediaPlan::Unchanged;
        }
        if !Self::requires_renegotiation(flag) {
            return MediaPlan::ApplyNow;
        }
        let target = intended.with(flag, value);
        match participant.state {
            // Links finished during the join were described without it.
            ConnectionState::Joining | ConnectionState::Disconnected => MediaPlan::Defer(target),
            ConnectionState::Connected | ConnectionState::Renegotiating => {
                MediaPlan::Renegotiate(target)
            }
            ConnectionState::Left => MediaPlan::Unchanged,
        }
    }

    /// Peers that must learn about a change to `initiator`'s media.
    pub fn renegotiation_targets(&self, call: &Call, initiator: &str) -> BTreeSet<ParticipantId> {
        if let Some(relay) = self.relay.relay_endpoint() {
            return BTreeSet::from([relay.to_owned()]);
        }
        call.participants()
            .iter()
            .filter(|p| p.participant_id != initiator)
            .filter(|p| {
                matches!(
                    p.state,
                    ConnectionState::Connected | ConnectionState::Renegotiating
                )
            })
            .map(|p| p.participant_id.clone())
            .collect()
    }

    /// Issues one renegotiation-request per target and moves `initiator` to
    /// Renegotiating. Does not wait for answers.
    ///
    /// Any renegotiation `initiator` already had outstanding is superseded.
    pub(crate) fn begin_renegotiation(
        &self,
        call: &mut Call,
        initiator: &str,
        target: MediaFlags,
        now: Instant,
    ) -> Result<RenegotiationStart, CallError> {
        let call_id = call.call_id.clone();
        let not_member = || CallError::NotMember {
            call_id: call_id.clone(),
            participant_id: initiator.to_owned(),
        };
        let active = call
            .participant(initiator)
            .map(|p| p.media_flags)
            .ok_or_else(not_member)?;

        self.withdraw_requests(call, initiator);

        if target == active {
            let p = call.participant_mut(initiator).ok_or_else(not_member)?;
            p.pending_media = None;
            p.awaiting.clear();
            if p.state == ConnectionState::Renegotiating {
                p.set_state(ConnectionState::Connected, now);
                self.bus
                    .state_changed(&call_id, initiator, ConnectionState::Connected);
            }
            return Ok(RenegotiationStart::Reverted);
        }

        let peers = self.renegotiation_targets(call, initiator);
        if peers.is_empty() {
            let p = call.participant_mut(initiator).ok_or_else(not_member)?;
            p.pending_media = None;
            self.commit(call, initiator, target);
            return Ok(RenegotiationStart::Applied(target));
        }

        let mut requested = BTreeSet::new();
        for peer in &peers {
            let msg = NegotiationMessage::new(
                call.call_id.clone(),
                initiator,
                peer.clone(),
                ExchangeKind::RenegotiationRequest,
                Bytes::new(),
            );
            if let Delivery::Delivered { .. } = self.relay.send_in(call, msg, now)? {
                requested.insert(peer.clone());
            }
        }

        let p = call.participant_mut(initiator).ok_or_else(not_member)?;
        p.pending_media = Some(target);
        p.awaiting = requested.clone();
        let entering = p.state != ConnectionState::Renegotiating;
        // Restarting the clock on a superseding toggle is intended.
        p.set_state(ConnectionState::Renegotiating, now);
        if entering {
            self.bus
                .state_changed(&call_id, initiator, ConnectionState::Renegotiating);
        }
        sink_info!(
            self.log,
            "participant {} renegotiating in call {} with {} peer(s), screen_share={}",
            initiator,
            call_id,
            requested.len(),
            target.screen_share_enabled
        );
        Ok(RenegotiationStart::Started(requested))
    }

    /// Drops `initiator`'s outstanding renegotiation-requests and its
    /// awaiting set. The pending flags stay untouched.
    pub(crate) fn withdraw_requests(
        &self,
        call: &mut Call,
        initiator: &str,
    ) -> Vec<NegotiationExchange> {
        let cancelled = self.relay.cancel_where(call, |e| {
            e.from == initiator && e.kind == ExchangeKind::RenegotiationRequest
        });
        if let Some(p) = call.participant_mut(initiator) {
            p.awaiting.clear();
        }
        if !cancelled.is_empty() {
            sink_debug!(
                self.log,
                "withdrew {} renegotiation request(s) of {} in call {}",
                cancelled.len(),
                initiator,
                call.call_id
            );
        }
        cancelled
    }

    /// Makes `flags` the participant's active media and announces it.
    pub(crate) fn commit(&self, call: &mut Call, participant_id: &str, flags: MediaFlags) {
        let call_id = call.call_id.clone();
        let Some(p) = call.participant_mut(participant_id) else {
            return;
        };
        if p.media_flags == flags {
            return;
        }
        p.media_flags = flags;
        self.bus.publish(CallEvent::MediaChanged {
            call_id,
            participant_id: participant_id.to_owned(),
            flags,
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::call::registry::SessionRegistry;
    use crate::call::types::CallKind;
    use crate::log::NoopLogSink;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    fn setup(relay_endpoint: Option<&str>) -> (Arc<SessionRegistry>, MediaTrackCoordinator, Receiver<CallEvent>) {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let log: Arc<dyn LogSink> = Arc::new(NoopLogSink);
        let registry = Arc::new(SessionRegistry::new(bus.clone()));
        let relay = Arc::new(SignalingRelay::new(
            registry.clone(),
            bus.clone(),
            Duration::from_secs(30),
            relay_endpoint.map(str::to_owned),
            log.clone(),
        ));
        (registry, MediaTrackCoordinator::new(relay, bus, log), rx)
    }

    fn join_connected(registry: &SessionRegistry, who: &[&str]) {
        let now = Instant::now();
        for w in who {
            registry
                .join_with("g1", w, CallKind::Group, now, |call, id| {
                    if let Some(p) = call.participant_mut(id) {
                        p.set_state(ConnectionState::Connected, now);
                    }
                })
                .unwrap();
        }
    }

    fn requests(rx: &Receiver<CallEvent>) -> Vec<NegotiationExchange> {
        rx.try_iter()
            .filter_map(|ev| match ev {
                CallEvent::NegotiationMessage(e) if e.kind == ExchangeKind::RenegotiationRequest => {
                    Some(e)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn only_screen_share_needs_renegotiation() {
        assert!(!MediaTrackCoordinator::requires_renegotiation(MediaFlag::Audio));
        assert!(!MediaTrackCoordinator::requires_renegotiation(MediaFlag::Video));
        assert!(MediaTrackCoordinator::requires_renegotiation(MediaFlag::ScreenShare));
    }

    #[test]
    fn plan_depends_on_flag_and_state() {
        let (registry, media, _rx) = setup(None);
        join_connected(&registry, &["a"]);
        let mut p = registry.list_participants("g1").unwrap().remove(0);

        assert_eq!(media.plan(&p, MediaFlag::Audio, true), MediaPlan::Unchanged);
        assert_eq!(media.plan(&p, MediaFlag::Audio, false), MediaPlan::ApplyNow);
        let share = MediaFlags::default().with(MediaFlag::ScreenShare, true);
        assert_eq!(
            media.plan(&p, MediaFlag::ScreenShare, true),
            MediaPlan::Renegotiate(share)
        );

        p.state = ConnectionState::Disconnected;
        assert_eq!(media.plan(&p, MediaFlag::ScreenShare, true), MediaPlan::Defer(share));
        p.state = ConnectionState::Joining;
        assert_eq!(media.plan(&p, MediaFlag::ScreenShare, true), MediaPlan::Defer(share));
        assert_eq!(media.plan(&p, MediaFlag::Audio, false), MediaPlan::ApplyNow);

        // Pending intent counts as the current value.
        p.state = ConnectionState::Renegotiating;
        p.pending_media = Some(share);
        assert_eq!(media.plan(&p, MediaFlag::ScreenShare, true), MediaPlan::Unchanged);
    }

    #[test]
    fn renegotiation_fans_out_to_every_connected_peer() {
        let (registry, media, rx) = setup(None);
        join_connected(&registry, &["a", "b", "c"]);
        registry
            .create_or_join("g1", "joining", CallKind::Group, Instant::now())
            .unwrap();
        let target = MediaFlags::default().with(MediaFlag::ScreenShare, true);

        let start = registry
            .with_call("g1", |c| media.begin_renegotiation(c, "a", target, Instant::now()))
            .unwrap()
            .unwrap();
        let expected: BTreeSet<_> = ["b".to_string(), "c".to_string()].into();
        assert_eq!(start, RenegotiationStart::Started(expected));

        let sent = requests(&rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.from == "a" && e.payload.is_empty()));

        let a = registry.with_call("g1", |c| c.participant("a").cloned()).unwrap().unwrap();
        assert_eq!(a.state, ConnectionState::Renegotiating);
        assert_eq!(a.pending_media(), Some(target));
        assert!(!a.media_flags.screen_share_enabled);
    }

    #[test]
    fn relay_topology_renegotiates_with_relay_only() {
        let (registry, media, rx) = setup(Some("sfu"));
        join_connected(&registry, &["a", "b", "c"]);
        let target = MediaFlags::default().with(MediaFlag::ScreenShare, true);
        registry
            .with_call("g1", |c| media.begin_renegotiation(c, "a", target, Instant::now()))
            .unwrap()
            .unwrap();
        let sent = requests(&rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "sfu");
    }

    #[test]
    fn alone_in_call_applies_immediately() {
        let (registry, media, rx) = setup(None);
        join_connected(&registry, &["a"]);
        let target = MediaFlags::default().with(MediaFlag::ScreenShare, true);
        let start = registry
            .with_call("g1", |c| media.begin_renegotiation(c, "a", target, Instant::now()))
            .unwrap()
            .unwrap();
        assert_eq!(start, RenegotiationStart::Applied(target));
        assert!(rx.try_iter().any(|ev| matches!(
            ev,
            CallEvent::MediaChanged { flags, .. } if flags.screen_share_enabled
        )));
    }

    #[test]
    fn toggling_back_before_answers_reverts() {
        let (registry, media, rx) = setup(None);
        join_connected(&registry, &["a", "b"]);
        let now = Instant::now();
        let share = MediaFlags::default().with(MediaFlag::ScreenShare, true);
        registry
            .with_call("g1", |c| media.begin_renegotiation(c, "a", share, now))
            .unwrap()
            .unwrap();
        let start = registry
            .with_call("g1", |c| media.begin_renegotiation(c, "a", MediaFlags::default(), now))
            .unwrap()
            .unwrap();
        assert_eq!(start, RenegotiationStart::Reverted);

        let (state, in_flight) = registry
            .with_call("g1", |c| (c.state_of("a"), c.in_flight().count()))
            .unwrap();
        assert_eq!(state, Some(ConnectionState::Connected));
        assert_eq!(in_flight, 0);
        drop(rx);
    }
}
