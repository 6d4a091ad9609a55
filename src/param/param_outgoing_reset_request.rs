use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Outgoing SSN Reset Request, RFC 6525 section 4.1: the sender asks the
/// receiver to reset the incoming SSNs of the listed streams (all streams
/// when the list is empty).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Parameter Type = 13       |      Parameter Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Re-configuration Request Sequence Number            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Re-configuration Response Sequence Number           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                Sender's Last Assigned TSN                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Stream Number 1 (optional)   |    Stream Number 2 (optional) |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamOutgoingResetRequest {
    pub(crate) request_sequence_number: u32,
    pub(crate) response_sequence_number: u32,
    pub(crate) sender_last_tsn: u32,
    pub(crate) stream_identifiers: Vec<u16>,
}

const OUTGOING_RESET_FIXED_LENGTH: usize = 12;

impl fmt::Display for ParamOutgoingResetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: rsn={} streams={:?}",
            self.header(),
            self.request_sequence_number,
            self.stream_identifiers
        )
    }
}

impl Param for ParamOutgoingResetRequest {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_OUTGOING_SSN_RESET_REQUEST,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_OUTGOING_SSN_RESET_REQUEST {
            return Err(Error::ErrUnexpectedParamType);
        }
        if header.value_length() < OUTGOING_RESET_FIXED_LENGTH
            || (header.value_length() - OUTGOING_RESET_FIXED_LENGTH) % 2 != 0
        {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader =
            &mut raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        let request_sequence_number = reader.get_u32();
        let response_sequence_number = reader.get_u32();
        let sender_last_tsn = reader.get_u32();
        let mut stream_identifiers =
            Vec::with_capacity((header.value_length() - OUTGOING_RESET_FIXED_LENGTH) / 2);
        while reader.remaining() >= 2 {
            stream_identifiers.push(reader.get_u16());
        }
        Ok(ParamOutgoingResetRequest {
            request_sequence_number,
            response_sequence_number,
            sender_last_tsn,
            stream_identifiers,
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.request_sequence_number);
        buf.put_u32(self.response_sequence_number);
        buf.put_u32(self.sender_last_tsn);
        for si in &self.stream_identifiers {
            buf.put_u16(*si);
        }
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        OUTGOING_RESET_FIXED_LENGTH + 2 * self.stream_identifiers.len()
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
