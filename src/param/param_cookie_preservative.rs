use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Cookie Preservative, RFC 4960 section 3.3.3.1: the sender asks for the
/// cookie lifespan to be extended by this many milliseconds.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamCookiePreservative {
    pub(crate) lifespan_increment_ms: u32,
}

impl fmt::Display for ParamCookiePreservative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}ms", self.header(), self.lifespan_increment_ms)
    }
}

impl Param for ParamCookiePreservative {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_COOKIE_PRESERVATIVE,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_COOKIE_PRESERVATIVE {
            return Err(Error::ErrUnexpectedParamType);
        }
        if header.value_length() != 4 {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader = &mut raw.slice(PARAM_HEADER_LENGTH..);
        Ok(ParamCookiePreservative {
            lifespan_increment_ms: reader.get_u32(),
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.lifespan_increment_ms);
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
