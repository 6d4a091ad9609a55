use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Incoming SSN Reset Request, RFC 6525 section 4.2: the sender asks the
/// receiver to reset the outgoing SSNs of the listed streams (all streams
/// when the list is empty).
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamIncomingResetRequest {
    pub(crate) request_sequence_number: u32,
    pub(crate) stream_identifiers: Vec<u16>,
}

const INCOMING_RESET_FIXED_LENGTH: usize = 4;

impl fmt::Display for ParamIncomingResetRequest {
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

impl Param for ParamIncomingResetRequest {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_INCOMING_SSN_RESET_REQUEST,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_INCOMING_SSN_RESET_REQUEST {
            return Err(Error::ErrUnexpectedParamType);
        }
        if header.value_length() < INCOMING_RESET_FIXED_LENGTH
            || (header.value_length() - INCOMING_RESET_FIXED_LENGTH) % 2 != 0
        {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader =
            &mut raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        let request_sequence_number = reader.get_u32();
        let mut stream_identifiers =
            Vec::with_capacity((header.value_length() - INCOMING_RESET_FIXED_LENGTH) / 2);
        while reader.remaining() >= 2 {
            stream_identifiers.push(reader.get_u16());
        }
        Ok(ParamIncomingResetRequest {
            request_sequence_number,
            stream_identifiers,
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.request_sequence_number);
        for si in &self.stream_identifiers {
            buf.put_u16(*si);
        }
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        INCOMING_RESET_FIXED_LENGTH + 2 * self.stream_identifiers.len()
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
