use std::fmt;
use std::net::IpAddr;

use bytes::{Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// IPv4 Address (type 5) and IPv6 Address (type 6) parameters, RFC 4960
/// section 3.3.2.1. Carried in INIT/INIT ACK; with a single-path transport
/// they are parsed and ignored, but must round-trip.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamIpAddress {
    pub(crate) address: IpAddr,
}

impl fmt::Display for ParamIpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.header(), self.address)
    }
}

impl Param for ParamIpAddress {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: match self.address {
                IpAddr::V4(_) => PT_IPV4_ADDRESS,
                IpAddr::V6(_) => PT_IPV6_ADDRESS,
            },
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        let value = raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        let address = match header.typ {
            PT_IPV4_ADDRESS => {
                if value.len() != 4 {
                    return Err(Error::ErrParamLengthInvalid);
                }
                let mut b = [0u8; 4];
                b.copy_from_slice(&value);
                IpAddr::from(b)
            }
            PT_IPV6_ADDRESS => {
                if value.len() != 16 {
                    return Err(Error::ErrParamLengthInvalid);
                }
                let mut b = [0u8; 16];
                b.copy_from_slice(&value);
                IpAddr::from(b)
            }
            _ => return Err(Error::ErrUnexpectedParamType),
        };
        Ok(ParamIpAddress { address })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        match self.address {
            IpAddr::V4(a) => buf.extend_from_slice(&a.octets()),
            IpAddr::V6(a) => buf.extend_from_slice(&a.octets()),
        }
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        match self.address {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
