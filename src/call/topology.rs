use std::collections::BTreeSet;

use crate::call::registry::Call;
use crate::call::types::ParticipantId;

/// Decides whom a joining participant must complete an offer/answer with
/// before it counts as Connected.
pub trait HandshakePolicy: Send + Sync {
    fn required_peers(&self, call: &Call, joiner: &str) -> BTreeSet<ParticipantId>;

    /// An endpoint outside the roster that is routable in every call.
    fn relay_endpoint(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Full mesh: the joiner handshakes directly with every other member present
/// when it joins. Members still joining are included, so two simultaneous
/// joiners end up linked to each other as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshPolicy;

impl HandshakePolicy for MeshPolicy {
    fn required_peers(&self, call: &Call, joiner: &str) -> BTreeSet<ParticipantId> {
        call.participants()
            .iter()
            .filter(|p| p.participant_id != joiner)
            .map(|p| p.participant_id.clone())
            .collect()
    }

    fn name(&self) -> &'static str {
        "mesh"
    }
}

/// Every participant handshakes once with a shared relay endpoint, which
/// then carries media between all of them.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    relay_id: ParticipantId,
}

impl RelayPolicy {
    pub fn new(relay_id: impl Into<ParticipantId>) -> Self {
        Self {
            relay_id: relay_id.into(),
        }
    }
}

impl HandshakePolicy for RelayPolicy {
    fn required_peers(&self, _call: &Call, _joiner: &str) -> BTreeSet<ParticipantId> {
        BTreeSet::from([self.relay_id.clone()])
    }

    fn relay_endpoint(&self) -> Option<&str> {
        Some(&self.relay_id)
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}
