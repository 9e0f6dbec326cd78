use super::{
    FrameError, HEADER_LEN, MAX_BODY_LEN, Msg, MsgType, PROTO_VERSION, ProtoError, decode_msg,
    encode_msg,
};
use std::io::{self, Read, Write};

/// Write a single frame: [ver][type][reserved u16=0][len u32][body...]
pub fn write_frame<W: Write>(w: &mut W, msg_type: MsgType, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "body too large"))?;
    let mut header = [0u8; HEADER_LEN];
    header[0] = PROTO_VERSION;
    header[1] = msg_type.as_u8();
    header[4..8].copy_from_slice(&len.to_be_bytes());
    w.write_all(&header)?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

/// Validates a frame header and returns the message type and body length.
fn parse_header(header: &[u8; HEADER_LEN], max_body: usize) -> Result<(MsgType, usize), ProtoError> {
    if header[0] != PROTO_VERSION {
        return Err(ProtoError::InvalidFormat("bad proto version"));
    }
    let msg_type = MsgType::from_u8(header[1])?;
    // flags ignored for now
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_body {
        return Err(ProtoError::TooLarge);
    }
    Ok((msg_type, len))
}

/// Read a single frame, enforcing a max body length.
pub fn read_frame<R: Read>(r: &mut R, max_body: usize) -> Result<(MsgType, Vec<u8>), FrameError> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;

    let (msg_type, len) = parse_header(&header, max_body)?;

    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;

    Ok((msg_type, body))
}

pub fn write_msg<W: Write>(w: &mut W, msg: &Msg) -> Result<(), FrameError> {
    let (msg_type, body) = encode_msg(msg)?;
    if body.len() > MAX_BODY_LEN {
        return Err(ProtoError::TooLarge.into());
    }
    write_frame(w, msg_type, &body)?;
    Ok(())
}

pub fn read_msg<R: Read>(r: &mut R) -> Result<Msg, FrameError> {
    let (msg_type, body) = read_frame(r, MAX_BODY_LEN)?;
    Ok(decode_msg(msg_type, &body)?)
}

/// Incremental frame reassembly for streams that are read in arbitrary
/// chunks (the TLS connection polls with a read timeout).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete message, or `None` if more bytes are needed.
    pub fn next_msg(&mut self) -> Result<Option<Msg>, FrameError> {
        let Some(header) = self.buf.first_chunk::<HEADER_LEN>() else {
            return Ok(None);
        };
        let (msg_type, len) = parse_header(header, MAX_BODY_LEN)?;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + len).collect();
        Ok(Some(decode_msg(msg_type, &frame[HEADER_LEN..])?))
    }
}
