//! Call signaling core: who is in which call, how they negotiate media
//! connections with each other, and what happens when they go quiet.

pub mod clock;
pub mod errors;
pub mod events;
pub mod media;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod state_machine;
pub mod topology;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::CallError;
pub use events::{CallEvent, EventBus};
pub use media::{MediaPlan, MediaTrackCoordinator};
pub use presence::{HeartbeatOutcome, PresenceEvent, PresenceMonitor, PresenceSignal};
pub use registry::{Call, JoinOutcome, LeaveOutcome, Participant, SessionRegistry};
pub use relay::{Delivery, SignalingRelay};
pub use state_machine::{CallStateMachine, JoinTicket, SweeperHandle, TickReport, ToggleOutcome};
pub use topology::{HandshakePolicy, MeshPolicy, RelayPolicy};
pub use types::{
    CallId, CallKind, ConnectionState, ExchangeId, ExchangeKind, MediaFlag, MediaFlags,
    NegotiationExchange, NegotiationMessage, ParticipantId,
};
