use bytes::Bytes;

// ---- Basic types ----------------------------------------------------------

pub type CallId = String;
/// Authenticated identity of one participant, supplied by the transport.
pub type ParticipantId = String;
pub type ExchangeId = u64;

// ---- Call kind ------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CallKind {
    OneToOne = 0x01,
    Group = 0x02,
    GroupWithScreenShare = 0x03,
}

impl CallKind {
    /// Maximum number of live participants, `None` when unbounded.
    ///
    /// `group_cap` only applies to the group kinds; one-to-one is always 2.
    pub fn capacity(self, group_cap: Option<usize>) -> Option<usize> {
        match self {
            CallKind::OneToOne => Some(2),
            CallKind::Group | CallKind::GroupWithScreenShare => group_cap,
        }
    }

    pub fn from_u8(v: u8) -> Option<CallKind> {
        match v {
            0x01 => Some(CallKind::OneToOne),
            0x02 => Some(CallKind::Group),
            0x03 => Some(CallKind::GroupWithScreenShare),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---- Participant lifecycle ------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Joining = 0x01,
    Connected = 0x02,
    Renegotiating = 0x03,
    Disconnected = 0x04,
    Left = 0x05,
}

impl ConnectionState {
    /// States the presence sweep watches for heartbeat loss.
    pub fn is_heartbeat_monitored(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Renegotiating)
    }

    pub fn from_u8(v: u8) -> Option<ConnectionState> {
        match v {
            0x01 => Some(ConnectionState::Joining),
            0x02 => Some(ConnectionState::Connected),
            0x03 => Some(ConnectionState::Renegotiating),
            0x04 => Some(ConnectionState::Disconnected),
            0x05 => Some(ConnectionState::Left),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---- Media flags ----------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MediaFlag {
    Audio = 0x01,
    Video = 0x02,
    ScreenShare = 0x04,
}

impl MediaFlag {
    pub fn from_u8(v: u8) -> Option<MediaFlag> {
        match v {
            0x01 => Some(MediaFlag::Audio),
            0x02 => Some(MediaFlag::Video),
            0x04 => Some(MediaFlag::ScreenShare),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Which media sources a participant contributes.
///
/// A fresh participant starts with microphone and camera on and no screen
/// share.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MediaFlags {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_share_enabled: bool,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_share_enabled: false,
        }
    }
}

impl MediaFlags {
    pub fn get(&self, flag: MediaFlag) -> bool {
        match flag {
            MediaFlag::Audio => self.audio_enabled,
            MediaFlag::Video => self.video_enabled,
            MediaFlag::ScreenShare => self.screen_share_enabled,
        }
    }

    #[must_use]
    pub fn with(mut self, flag: MediaFlag, value: bool) -> Self {
        match flag {
            MediaFlag::Audio => self.audio_enabled = value,
            MediaFlag::Video => self.video_enabled = value,
            MediaFlag::ScreenShare => self.screen_share_enabled = value,
        }
        self
    }

    /// Packs the flags into one byte using the `MediaFlag` bit values.
    pub fn to_bits(self) -> u8 {
        let mut bits = 0;
        for flag in [MediaFlag::Audio, MediaFlag::Video, MediaFlag::ScreenShare] {
            if self.get(flag) {
                bits |= flag.as_u8();
            }
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            audio_enabled: bits & MediaFlag::Audio.as_u8() != 0,
            video_enabled: bits & MediaFlag::Video.as_u8() != 0,
            screen_share_enabled: bits & MediaFlag::ScreenShare.as_u8() != 0,
        }
    }
}

// ---- Negotiation ----------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ExchangeKind {
    Offer = 0x01,
    Answer = 0x02,
    Candidate = 0x03,
    RenegotiationRequest = 0x04,
}

impl ExchangeKind {
    /// Requests stay in flight until the peer answers them.
    pub fn awaits_answer(self) -> bool {
        matches!(self, ExchangeKind::Offer | ExchangeKind::RenegotiationRequest)
    }

    pub fn from_u8(v: u8) -> Option<ExchangeKind> {
        match v {
            0x01 => Some(ExchangeKind::Offer),
            0x02 => Some(ExchangeKind::Answer),
            0x03 => Some(ExchangeKind::Candidate),
            0x04 => Some(ExchangeKind::RenegotiationRequest),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A negotiation message as submitted by an endpoint, before the relay has
/// assigned it an exchange id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiationMessage {
    pub call_id: CallId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub kind: ExchangeKind,
    /// Answers may name the request they complete.
    pub in_reply_to: Option<ExchangeId>,
    /// Opaque session description or candidate, forwarded verbatim.
    pub payload: Bytes,
}

impl NegotiationMessage {
    pub fn new(
        call_id: impl Into<CallId>,
        from: impl Into<ParticipantId>,
        to: impl Into<ParticipantId>,
        kind: ExchangeKind,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from: from.into(),
            to: to.into(),
            kind,
            in_reply_to: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn in_reply_to(mut self, exchange_id: ExchangeId) -> Self {
        self.in_reply_to = Some(exchange_id);
        self
    }
}

/// One message of a connection-setup handshake, as routed by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiationExchange {
    pub exchange_id: ExchangeId,
    pub call_id: CallId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub kind: ExchangeKind,
    pub in_reply_to: Option<ExchangeId>,
    pub payload: Bytes,
}

impl NegotiationExchange {
    pub fn involves(&self, participant_id: &str) -> bool {
        self.from == participant_id || self.to == participant_id
    }
}
