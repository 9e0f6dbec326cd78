use bytes::Bytes;
use std::str;

use super::{Msg, MsgType, ProtoError, RosterEntry, SignalingMsg};
use crate::call::{CallKind, ConnectionState, ExchangeKind, MediaFlag, MediaFlags};

// ---- Encode to body bytes -------------------------------------------------

pub fn encode_msg(msg: &Msg) -> Result<(MsgType, Vec<u8>), ProtoError> {
    use SignalingMsg::*;
    let mut body = Vec::new();

    let msg_type = match msg {
        Hello { client_version } => {
            put_str16(&mut body, client_version)?;
            MsgType::Hello
        }
        Identify { participant_id } => {
            put_str16(&mut body, participant_id)?;
            MsgType::Identify
        }
        IdentifyOk { participant_id } => {
            put_str16(&mut body, participant_id)?;
            MsgType::IdentifyOk
        }
        Error { code, detail } => {
            put_u16(&mut body, *code);
            put_str16(&mut body, detail)?;
            MsgType::Error
        }

        AllocateCall => MsgType::AllocateCall,
        CallAllocated { call_id } => {
            put_str16(&mut body, call_id)?;
            MsgType::CallAllocated
        }
        Join { call_id, kind } => {
            put_str16(&mut body, call_id)?;
            put_u8(&mut body, kind.as_u8());
            MsgType::Join
        }
        JoinPending {
            call_id,
            state,
            peers,
        } => {
            put_str16(&mut body, call_id)?;
            put_u8(&mut body, state.as_u8());
            put_len16(&mut body, peers.len())?;
            for peer in peers {
                put_str16(&mut body, peer)?;
            }
            MsgType::JoinPending
        }
        Leave { call_id } => {
            put_str16(&mut body, call_id)?;
            MsgType::Leave
        }
        ListParticipants { call_id } => {
            put_str16(&mut body, call_id)?;
            MsgType::ListParticipants
        }
        Roster { call_id, entries } => {
            put_str16(&mut body, call_id)?;
            put_len16(&mut body, entries.len())?;
            for entry in entries {
                put_str16(&mut body, &entry.participant_id)?;
                put_u8(&mut body, entry.state.as_u8());
                put_u8(&mut body, entry.media.to_bits());
            }
            MsgType::Roster
        }
        StateChanged {
            call_id,
            participant_id,
            state,
        } => {
            put_str16(&mut body, call_id)?;
            put_str16(&mut body, participant_id)?;
            put_u8(&mut body, state.as_u8());
            MsgType::StateChanged
        }
        CallEnded { call_id } => {
            put_str16(&mut body, call_id)?;
            MsgType::CallEnded
        }
        ParticipantTimedOut {
            call_id,
            participant_id,
        } => {
            put_str16(&mut body, call_id)?;
            put_str16(&mut body, participant_id)?;
            MsgType::ParticipantTimedOut
        }

        ToggleMedia {
            call_id,
            flag,
            value,
        } => {
            put_str16(&mut body, call_id)?;
            put_u8(&mut body, flag.as_u8());
            put_u8(&mut body, u8::from(*value));
            MsgType::ToggleMedia
        }
        MediaChanged {
            call_id,
            participant_id,
            flags,
        } => {
            put_str16(&mut body, call_id)?;
            put_str16(&mut body, participant_id)?;
            put_u8(&mut body, flags.to_bits());
            MsgType::MediaChanged
        }
        RenegotiationFailed {
            call_id,
            participant_id,
        } => {
            put_str16(&mut body, call_id)?;
            put_str16(&mut body, participant_id)?;
            MsgType::RenegotiationFailed
        }

        Negotiate {
            call_id,
            to,
            kind,
            in_reply_to,
            payload,
        } => {
            put_str16(&mut body, call_id)?;
            put_str16(&mut body, to)?;
            put_u8(&mut body, kind.as_u8());
            put_u64(&mut body, *in_reply_to);
            put_bytes32(&mut body, payload)?;
            MsgType::Negotiate
        }
        Negotiation {
            exchange_id,
            call_id,
            from,
            kind,
            in_reply_to,
            payload,
        } => {
            put_u64(&mut body, *exchange_id);
            put_str16(&mut body, call_id)?;
            put_str16(&mut body, from)?;
            put_u8(&mut body, kind.as_u8());
            put_u64(&mut body, *in_reply_to);
            put_bytes32(&mut body, payload)?;
            MsgType::Negotiation
        }

        Ping { nonce } => {
            put_u64(&mut body, *nonce);
            MsgType::Ping
        }
        Pong { nonce } => {
            put_u64(&mut body, *nonce);
            MsgType::Pong
        }
        Heartbeat { call_id } => {
            put_str16(&mut body, call_id)?;
            MsgType::Heartbeat
        }
    };

    Ok((msg_type, body))
}

// ---- Decode from body bytes ----------------------------------------------

pub fn decode_msg(msg_type: MsgType, body: &[u8]) -> Result<Msg, ProtoError> {
    use SignalingMsg::*;
    let mut cursor = Cursor::new(body);

    let msg = match msg_type {
        MsgType::Hello => Hello {
            client_version: cursor.get_string16()?,
        },
        MsgType::Identify => Identify {
            participant_id: cursor.get_string16()?,
        },
        MsgType::IdentifyOk => IdentifyOk {
            participant_id: cursor.get_string16()?,
        },
        MsgType::Error => {
            let code = cursor.get_u16()?;
            let detail = cursor.get_string16()?;
            Error { code, detail }
        }

        MsgType::AllocateCall => AllocateCall,
        MsgType::CallAllocated => CallAllocated {
            call_id: cursor.get_string16()?,
        },
        MsgType::Join => {
            let call_id = cursor.get_string16()?;
            let kind = CallKind::from_u8(cursor.get_u8()?)
                .ok_or(ProtoError::InvalidFormat("unknown call kind"))?;
            Join { call_id, kind }
        }
        MsgType::JoinPending => {
            let call_id = cursor.get_string16()?;
            let state = cursor.get_state()?;
            let count = cursor.get_u16()? as usize;
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                peers.push(cursor.get_string16()?);
            }
            JoinPending {
                call_id,
                state,
                peers,
            }
        }
        MsgType::Leave => Leave {
            call_id: cursor.get_string16()?,
        },
        MsgType::ListParticipants => ListParticipants {
            call_id: cursor.get_string16()?,
        },
        MsgType::Roster => {
            let call_id = cursor.get_string16()?;
            let count = cursor.get_u16()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let participant_id = cursor.get_string16()?;
                let state = cursor.get_state()?;
                let media = MediaFlags::from_bits(cursor.get_u8()?);
                entries.push(RosterEntry {
                    participant_id,
                    state,
                    media,
                });
            }
            Roster { call_id, entries }
        }
        MsgType::StateChanged => {
            let call_id = cursor.get_string16()?;
            let participant_id = cursor.get_string16()?;
            let state = cursor.get_state()?;
            StateChanged {
                call_id,
                participant_id,
                state,
            }
        }
        MsgType::CallEnded => CallEnded {
            call_id: cursor.get_string16()?,
        },
        MsgType::ParticipantTimedOut => ParticipantTimedOut {
            call_id: cursor.get_string16()?,
            participant_id: cursor.get_string16()?,
        },

        MsgType::ToggleMedia => {
            let call_id = cursor.get_string16()?;
            let flag = MediaFlag::from_u8(cursor.get_u8()?)
                .ok_or(ProtoError::InvalidFormat("unknown media flag"))?;
            let value = match cursor.get_u8()? {
                0 => false,
                1 => true,
                _ => return Err(ProtoError::InvalidFormat("toggle value is not 0 or 1")),
            };
            ToggleMedia {
                call_id,
                flag,
                value,
            }
        }
        MsgType::MediaChanged => MediaChanged {
            call_id: cursor.get_string16()?,
            participant_id: cursor.get_string16()?,
            flags: MediaFlags::from_bits(cursor.get_u8()?),
        },
        MsgType::RenegotiationFailed => RenegotiationFailed {
            call_id: cursor.get_string16()?,
            participant_id: cursor.get_string16()?,
        },

        MsgType::Negotiate => {
            let call_id = cursor.get_string16()?;
            let to = cursor.get_string16()?;
            let kind = cursor.get_exchange_kind()?;
            let in_reply_to = cursor.get_u64()?;
            let payload = cursor.get_bytes32()?;
            Negotiate {
                call_id,
                to,
                kind,
                in_reply_to,
                payload,
            }
        }
        MsgType::Negotiation => {
            let exchange_id = cursor.get_u64()?;
            let call_id = cursor.get_string16()?;
            let from = cursor.get_string16()?;
            let kind = cursor.get_exchange_kind()?;
            let in_reply_to = cursor.get_u64()?;
            let payload = cursor.get_bytes32()?;
            Negotiation {
                exchange_id,
                call_id,
                from,
                kind,
                in_reply_to,
                payload,
            }
        }

        MsgType::Ping => Ping {
            nonce: cursor.get_u64()?,
        },
        MsgType::Pong => Pong {
            nonce: cursor.get_u64()?,
        },
        MsgType::Heartbeat => Heartbeat {
            call_id: cursor.get_string16()?,
        },
    };

    cursor.finish()?;
    Ok(msg)
}

// ---- Primitive write helpers ---------------------------------------------

fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// list16 prefix: u16 item count.
fn put_len16(buf: &mut Vec<u8>, len: usize) -> Result<(), ProtoError> {
    let len = u16::try_from(len).map_err(|_| ProtoError::InvalidFormat("list too long"))?;
    put_u16(buf, len);
    Ok(())
}

/// str16 = u16 length + UTF-8 bytes
fn put_str16(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtoError> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| ProtoError::StringTooLong {
        max: u16::MAX as usize,
        actual: bytes.len(),
    })?;

    put_u16(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// bytes32 = u32 length + raw bytes
fn put_bytes32(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ProtoError> {
    let len = u32::try_from(bytes.len()).map_err(|_| ProtoError::TooLarge)?;
    put_u32(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

// ---- Cursor for decoding --------------------------------------------------

#[derive(Debug)]
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let head = self.get_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(u8::from_be_bytes(self.take::<1>()?))
    }

    fn get_u16(&mut self) -> Result<u16, ProtoError> {
        Ok(u16::from_be_bytes(self.take::<2>()?))
    }

    fn get_u32(&mut self) -> Result<u32, ProtoError> {
        Ok(u32::from_be_bytes(self.take::<4>()?))
    }

    fn get_u64(&mut self) -> Result<u64, ProtoError> {
        Ok(u64::from_be_bytes(self.take::<8>()?))
    }

    fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtoError> {
        if self.buf.len() < len {
            return Err(ProtoError::Truncated);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    /// Read str16 = u16 length + UTF-8 bytes
    fn get_str16(&mut self) -> Result<&'a str, ProtoError> {
        let len = self.get_u16()? as usize;
        let bytes = self.get_bytes(len)?;
        str::from_utf8(bytes).map_err(|_| ProtoError::InvalidUtf8)
    }

    fn get_string16(&mut self) -> Result<String, ProtoError> {
        self.get_str16().map(str::to_owned)
    }

    fn get_bytes32(&mut self) -> Result<Bytes, ProtoError> {
        let len = self.get_u32()? as usize;
        self.get_bytes(len).map(Bytes::copy_from_slice)
    }

    fn get_state(&mut self) -> Result<ConnectionState, ProtoError> {
        ConnectionState::from_u8(self.get_u8()?)
            .ok_or(ProtoError::InvalidFormat("unknown connection state"))
    }

    fn get_exchange_kind(&mut self) -> Result<ExchangeKind, ProtoError> {
        ExchangeKind::from_u8(self.get_u8()?)
            .ok_or(ProtoError::InvalidFormat("unknown exchange kind"))
    }

    /// Enforce that we've consumed the whole body.
    fn finish(self) -> Result<(), ProtoError> {
        if !self.buf.is_empty() {
            Err(ProtoError::InvalidFormat("trailing bytes in message body"))
        } else {
            Ok(())
        }
    }
}
