use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_header::*;
use super::param_type::*;
use super::*;

/// Add Outgoing (type 17) / Add Incoming (type 18) Streams Request,
/// RFC 6525 sections 4.5 and 4.6. Both directions share one layout, so a
/// single struct carries them, told apart by `incoming`.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamAddStreams {
    pub(crate) incoming: bool,
    pub(crate) request_sequence_number: u32,
    pub(crate) number_of_new_streams: u16,
}

impl fmt::Display for ParamAddStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: rsn={} new={}",
            self.header(),
            self.request_sequence_number,
            self.number_of_new_streams
        )
    }
}

impl Param for ParamAddStreams {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: if self.incoming {
                PT_ADD_INCOMING_STREAMS_REQUEST
            } else {
                PT_ADD_OUTGOING_STREAMS_REQUEST
            },
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        let incoming = match header.typ {
            PT_ADD_OUTGOING_STREAMS_REQUEST => false,
            PT_ADD_INCOMING_STREAMS_REQUEST => true,
            _ => return Err(Error::ErrUnexpectedParamType),
        };
        if header.value_length() != 8 {
            return Err(Error::ErrParamLengthInvalid);
        }
        let reader = &mut raw.slice(PARAM_HEADER_LENGTH..);
        let request_sequence_number = reader.get_u32();
        let number_of_new_streams = reader.get_u16();
        // 2 reserved bytes follow
        Ok(ParamAddStreams {
            incoming,
            request_sequence_number,
            number_of_new_streams,
        })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.put_u32(self.request_sequence_number);
        buf.put_u16(self.number_of_new_streams);
        buf.put_u16(0); // reserved
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
