use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// ErrorCauseCode is the numeric cause code carried by ERROR and ABORT
/// chunks, defined in RFC 4960 section 3.3.10.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ErrorCauseCode(pub u16);

pub(crate) const INVALID_STREAM_IDENTIFIER: ErrorCauseCode = ErrorCauseCode(1);
pub(crate) const MISSING_MANDATORY_PARAMETER: ErrorCauseCode = ErrorCauseCode(2);
pub(crate) const STALE_COOKIE_ERROR: ErrorCauseCode = ErrorCauseCode(3);
pub(crate) const OUT_OF_RESOURCE: ErrorCauseCode = ErrorCauseCode(4);
pub(crate) const UNRESOLVABLE_ADDRESS: ErrorCauseCode = ErrorCauseCode(5);
pub(crate) const UNRECOGNIZED_CHUNK_TYPE: ErrorCauseCode = ErrorCauseCode(6);
pub(crate) const INVALID_MANDATORY_PARAMETER: ErrorCauseCode = ErrorCauseCode(7);
pub(crate) const UNRECOGNIZED_PARAMETERS: ErrorCauseCode = ErrorCauseCode(8);
pub(crate) const NO_USER_DATA: ErrorCauseCode = ErrorCauseCode(9);
pub(crate) const COOKIE_RECEIVED_WHILE_SHUTTING_DOWN: ErrorCauseCode = ErrorCauseCode(10);
pub(crate) const RESTART_WITH_NEW_ADDRESSES: ErrorCauseCode = ErrorCauseCode(11);
pub(crate) const USER_INITIATED_ABORT: ErrorCauseCode = ErrorCauseCode(12);
pub(crate) const PROTOCOL_VIOLATION: ErrorCauseCode = ErrorCauseCode(13);

impl fmt::Display for ErrorCauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("Unknown CauseCode: {}", self.0);
        let s = match *self {
            INVALID_STREAM_IDENTIFIER => "Invalid Stream Identifier",
            MISSING_MANDATORY_PARAMETER => "Missing Mandatory Parameter",
            STALE_COOKIE_ERROR => "Stale Cookie Error",
            OUT_OF_RESOURCE => "Out Of Resource",
            UNRESOLVABLE_ADDRESS => "Unresolvable Address",
            UNRECOGNIZED_CHUNK_TYPE => "Unrecognized Chunk Type",
            INVALID_MANDATORY_PARAMETER => "Invalid Mandatory Parameter",
            UNRECOGNIZED_PARAMETERS => "Unrecognized Parameters",
            NO_USER_DATA => "No User Data",
            COOKIE_RECEIVED_WHILE_SHUTTING_DOWN => "Cookie Received While Shutting Down",
            RESTART_WITH_NEW_ADDRESSES => "Restart Of An Association With New Addresses",
            USER_INITIATED_ABORT => "User Initiated Abort",
            PROTOCOL_VIOLATION => "Protocol Violation",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}

pub(crate) const ERROR_CAUSE_HEADER_LENGTH: usize = 4;

/// ErrorCause holds one cause from an ERROR or ABORT chunk. The cause
/// registry is open: unknown codes keep their value bytes verbatim so the
/// rest of the chunk still parses.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorCause {
    pub(crate) code: ErrorCauseCode,
    pub(crate) raw: Bytes,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl ErrorCause {
    /// Stale Cookie Error carries the measure of staleness in microseconds.
    pub(crate) fn stale_cookie(staleness_us: u32) -> Self {
        let mut raw = BytesMut::with_capacity(4);
        raw.put_u32(staleness_us);
        ErrorCause {
            code: STALE_COOKIE_ERROR,
            raw: raw.freeze(),
        }
    }

    /// Protocol Violation carries free-text additional information.
    pub(crate) fn protocol_violation(reason: &str) -> Self {
        ErrorCause {
            code: PROTOCOL_VIOLATION,
            raw: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub(crate) fn user_initiated_abort(reason: &str) -> Self {
        ErrorCause {
            code: USER_INITIATED_ABORT,
            raw: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Staleness delta of a Stale Cookie cause, if it carries one.
    pub(crate) fn staleness_us(&self) -> Option<u32> {
        if self.code == STALE_COOKIE_ERROR && self.raw.len() >= 4 {
            let mut reader = self.raw.clone();
            Some(reader.get_u32())
        } else {
            None
        }
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < ERROR_CAUSE_HEADER_LENGTH {
            return Err(Error::ErrCauseTooShort);
        }

        let reader = &mut raw.clone();
        let code = ErrorCauseCode(reader.get_u16());
        let length = reader.get_u16() as usize;

        if length < ERROR_CAUSE_HEADER_LENGTH || length > raw.len() {
            return Err(Error::ErrCauseTooShort);
        }

        let value_length = length - ERROR_CAUSE_HEADER_LENGTH;
        let raw = raw.slice(ERROR_CAUSE_HEADER_LENGTH..ERROR_CAUSE_HEADER_LENGTH + value_length);

        Ok(ErrorCause { code, raw })
    }

    pub(crate) fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.length());
        self.marshal_to(&mut buf);
        buf.freeze()
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> usize {
        buf.put_u16(self.code.0);
        buf.put_u16(self.length() as u16);
        buf.extend(self.raw.clone());
        buf.len()
    }

    /// Length including the 4-byte cause header, excluding padding.
    pub(crate) fn length(&self) -> usize {
        ERROR_CAUSE_HEADER_LENGTH + self.raw.len()
    }
}
