use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// SSN/TSN Reset Request, RFC 6525 section 4.3: a bulk reset of all SSNs
/// and the TSN space in both directions.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamSsnTsnResetRequest {
    pub(crate) request_sequence_number: u32,
}

impl fmt::Display for ParamSsnTsnResetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: rsn={}", self.header(), self.request_sequence_number)
    }
}

impl Param for ParamSsnTsnResetRequest {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_SSN_TSN_RESET_REQUEST,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_SSN_TSN_RESET_REQUEST {
            return Err(Error::ErrUnexpectedParamType);
        }
        if header.value_length() != 4 {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader = &mut raw.slice(PARAM_HEADER_LENGTH..);
        Ok(ParamSsnTsnResetRequest {
            request_sequence_number: reader.get_u32(),
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.request_sequence_number);
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        4
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
