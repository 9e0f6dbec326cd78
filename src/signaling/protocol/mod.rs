//! Framed binary protocol spoken between participants and the signaling
//! server.

pub mod codec;
pub mod constants;
pub mod errors;
pub mod framing;
pub mod msg;
pub mod msg_type;

pub use codec::{decode_msg, encode_msg};
pub use constants::{HEADER_LEN, MAX_BODY_LEN, PROTO_VERSION};
pub use errors::{FrameError, ProtoError};
pub use framing::{FrameDecoder, read_frame, read_msg, write_frame, write_msg};
pub use msg::{RosterEntry, SignalingMsg};
pub use msg_type::MsgType;

pub type Msg = SignalingMsg;
