use crate::call::CallError;

/// Error codes carried by `Msg::Error`.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest = 1,
    NotIdentified = 2,

    NotFound = 10,
    AlreadyJoined = 11,
    CallFull = 12,
    NotMember = 13,

    InvalidRoute = 20,

    Internal = 50,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<ErrorCode> {
        use ErrorCode::*;
        match v {
            1 => Some(BadRequest),
            2 => Some(NotIdentified),
            10 => Some(NotFound),
            11 => Some(AlreadyJoined),
            12 => Some(CallFull),
            13 => Some(NotMember),
            20 => Some(InvalidRoute),
            50 => Some(Internal),
            _ => None,
        }
    }
}

impl From<&CallError> for ErrorCode {
    fn from(e: &CallError) -> Self {
        match e {
            CallError::NotFound(_) => ErrorCode::NotFound,
            CallError::AlreadyJoined { .. } => ErrorCode::AlreadyJoined,
            CallError::CallFull { .. } => ErrorCode::CallFull,
            CallError::InvalidRoute { .. } => ErrorCode::InvalidRoute,
            CallError::NotMember { .. } => ErrorCode::NotMember,
            CallError::Poisoned => ErrorCode::Internal,
        }
    }
}
