use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Result carried by a Re-configuration Response, RFC 6525 section 4.4.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u32)]
pub(crate) enum ReconfigResult {
    SuccessNop = 0,
    #[default]
    SuccessPerformed = 1,
    Denied = 2,
    ErrorWrongSsn = 3,
    ErrorRequestAlreadyInProgress = 4,
    ErrorBadSequenceNumber = 5,
    InProgress = 6,
}

impl fmt::Display for ReconfigResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReconfigResult::SuccessNop => "Success - Nothing to do",
            ReconfigResult::SuccessPerformed => "Success - Performed",
            ReconfigResult::Denied => "Denied",
            ReconfigResult::ErrorWrongSsn => "Error - Wrong SSN",
            ReconfigResult::ErrorRequestAlreadyInProgress => {
                "Error - Request already in progress"
            }
            ReconfigResult::ErrorBadSequenceNumber => "Error - Bad Sequence Number",
            ReconfigResult::InProgress => "In progress",
        };
        write!(f, "{s}")
    }
}

impl From<u32> for ReconfigResult {
    fn from(v: u32) -> ReconfigResult {
        match v {
            0 => ReconfigResult::SuccessNop,
            1 => ReconfigResult::SuccessPerformed,
            2 => ReconfigResult::Denied,
            3 => ReconfigResult::ErrorWrongSsn,
            4 => ReconfigResult::ErrorRequestAlreadyInProgress,
            6 => ReconfigResult::InProgress,
            _ => ReconfigResult::ErrorBadSequenceNumber,
        }
    }
}

/// Re-configuration Response: answers one request parameter, matched by
/// the request sequence number it echoes.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamReconfigResponse {
    /// request sequence number of the request this responds to
    pub(crate) response_sequence_number: u32,
    pub(crate) result: ReconfigResult,
}

impl fmt::Display for ParamReconfigResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: rsn={} result={}",
            self.header(),
            self.response_sequence_number,
            self.result
        )
    }
}

impl Param for ParamReconfigResponse {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_RECONFIG_RESPONSE,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_RECONFIG_RESPONSE {
            return Err(Error::ErrUnexpectedParamType);
        }
        // optional sender/receiver TSN fields after the result are accepted
        // and ignored (only sent with SSN/TSN resets, which we deny)
        if header.value_length() < 8 {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader = &mut raw.slice(PARAM_HEADER_LENGTH..);
        let response_sequence_number = reader.get_u32();
        let result = ReconfigResult::from(reader.get_u32());
        Ok(ParamReconfigResponse {
            response_sequence_number,
            result,
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.response_sequence_number);
        buf.put_u32(self.result as u32);
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        8
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
