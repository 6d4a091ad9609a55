use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Supported Address Types, RFC 4960 section 3.3.2.1: the address families
/// the INIT sender can support, as parameter type codes (5 = IPv4,
/// 6 = IPv6, 11 = host name).
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamSupportedAddressTypes {
    pub(crate) address_types: Vec<u16>,
}

impl fmt::Display for ParamSupportedAddressTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.header(), self.address_types)
    }
}

impl Param for ParamSupportedAddressTypes {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_SUPPORTED_ADDRESS_TYPES,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_SUPPORTED_ADDRESS_TYPES {
            return Err(Error::ErrUnexpectedParamType);
        }
        if header.value_length() % 2 != 0 {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader =
            &mut raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        let mut address_types = Vec::with_capacity(header.value_length() / 2);
        while reader.remaining() >= 2 {
            address_types.push(reader.get_u16());
        }
        Ok(ParamSupportedAddressTypes { address_types })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        for t in &self.address_types {
            buf.put_u16(*t);
        }
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        2 * self.address_types.len()
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
