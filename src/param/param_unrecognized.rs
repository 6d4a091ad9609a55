use std::fmt;

use bytes::{Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Unrecognized Parameter (type 8): reports a parameter from a received
/// INIT back to the sender inside the INIT ACK. The offending parameter is
/// nested whole, header included.
#[derive(Debug, Clone)]
pub(crate) struct ParamUnrecognized {
    param: Box<dyn Param + Send + Sync>,
}

impl ParamUnrecognized {
    pub(crate) fn wrap(param: Box<dyn Param + Send + Sync>) -> Self {
        Self { param }
    }
}

impl fmt::Display for ParamUnrecognized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.header(), self.param)
    }
}

impl Param for ParamUnrecognized {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_UNRECOGNIZED_PARAM,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_UNRECOGNIZED_PARAM {
            return Err(Error::ErrUnexpectedParamType);
        }
        let nested = raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        let param = build_param(&nested)?;
        Ok(Self { param })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        self.param.marshal_to(buf)?;
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        PARAM_HEADER_LENGTH + self.param.value_length()
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
