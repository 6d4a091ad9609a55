use std::fmt;

use bytes::{Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Host Name Address, RFC 4960 section 3.3.2.1. The value is a host name
/// kept as raw bytes; any terminating NUL belongs to the value.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamHostNameAddress {
    pub(crate) host_name: Bytes,
}

impl fmt::Display for ParamHostNameAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.header(),
            String::from_utf8_lossy(&self.host_name)
        )
    }
}

impl Param for ParamHostNameAddress {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_HOST_NAME_ADDRESS,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_HOST_NAME_ADDRESS {
            return Err(Error::ErrUnexpectedParamType);
        }
        let host_name = raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        Ok(ParamHostNameAddress { host_name })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.extend(self.host_name.clone());
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        self.host_name.len()
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
