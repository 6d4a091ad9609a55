use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_type::*;
use super::*;

/// ParamHeader is the 4-byte TLV prefix shared by all parameters. The wire
/// length counts the header and value, never the trailing padding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamHeader {
    pub(crate) typ: ParamType,
    pub(crate) value_length: u16,
}

pub(crate) const PARAM_HEADER_LENGTH: usize = 4;

impl fmt::Display for ParamHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.typ)
    }
}

impl ParamHeader {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PARAM_HEADER_LENGTH {
            return Err(Error::ErrParamHeaderTooShort);
        }

        let reader = &mut raw.clone();
        let typ = ParamType(reader.get_u16());
        let length = reader.get_u16() as usize;

        if length < PARAM_HEADER_LENGTH || length > raw.len() {
            return Err(Error::ErrParamLengthInvalid);
        }

        Ok(ParamHeader {
            typ,
            value_length: (length - PARAM_HEADER_LENGTH) as u16,
        })
    }

    pub(crate) fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        buf.put_u16(self.typ.0);
        buf.put_u16(self.value_length + PARAM_HEADER_LENGTH as u16);
        Ok(buf.len())
    }

    pub(crate) fn value_length(&self) -> usize {
        self.value_length as usize
    }
}
