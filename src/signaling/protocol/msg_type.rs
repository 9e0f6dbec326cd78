// ---- Message type byte ----------------------------------------------------

use crate::signaling::protocol::ProtoError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    Identify = 0x02,
    IdentifyOk = 0x03,
    Error = 0x04,

    AllocateCall = 0x10,
    CallAllocated = 0x11,
    Join = 0x12,
    JoinPending = 0x13,
    Leave = 0x14,
    ListParticipants = 0x15,
    Roster = 0x16,
    StateChanged = 0x17,
    CallEnded = 0x18,
    ParticipantTimedOut = 0x19,

    ToggleMedia = 0x20,
    MediaChanged = 0x21,
    RenegotiationFailed = 0x22,

    Negotiate = 0x28,
    Negotiation = 0x29,

    Ping = 0x30,
    Pong = 0x31,
    Heartbeat = 0x32,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Result<MsgType, ProtoError> {
        use MsgType::*;
        match v {
            0x01 => Ok(Hello),
            0x02 => Ok(Identify),
            0x03 => Ok(IdentifyOk),
            0x04 => Ok(Error),
            0x10 => Ok(AllocateCall),
            0x11 => Ok(CallAllocated),
            0x12 => Ok(Join),
            0x13 => Ok(JoinPending),
            0x14 => Ok(Leave),
            0x15 => Ok(ListParticipants),
            0x16 => Ok(Roster),
            0x17 => Ok(StateChanged),
            0x18 => Ok(CallEnded),
            0x19 => Ok(ParticipantTimedOut),
            0x20 => Ok(ToggleMedia),
            0x21 => Ok(MediaChanged),
            0x22 => Ok(RenegotiationFailed),
            0x28 => Ok(Negotiate),
            0x29 => Ok(Negotiation),
            0x30 => Ok(Ping),
            0x31 => Ok(Pong),
            0x32 => Ok(Heartbeat),
            other => Err(ProtoError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
