use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::param::param_header::PARAM_HEADER_LENGTH;
use crate::param::param_heartbeat_info::ParamHeartbeatInfo;
use crate::param::{build_param, Param};
use crate::util::padding_needed;

/// ChunkHeartbeatAck echoes a HEARTBEAT back to its sender (RFC 4960
/// section 3.3.6), carrying the Heartbeat Info parameter unchanged.
#[derive(Default, Debug)]
pub(crate) struct ChunkHeartbeatAck {
    pub(crate) params: Vec<Box<dyn Param + Send + Sync>>,
}

impl fmt::Display for ChunkHeartbeatAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header())
    }
}

impl Chunk for ChunkHeartbeatAck {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_HEARTBEAT_ACK,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_HEARTBEAT_ACK {
            return Err(Error::ErrUnexpectedChunkType);
        }
        if header.value_length() < PARAM_HEADER_LENGTH {
            return Err(Error::ErrHeartbeatMissingInfo);
        }

        let info = build_param(&raw.slice(CHUNK_HEADER_SIZE..))?;
        if info
            .as_any()
            .downcast_ref::<ParamHeartbeatInfo>()
            .is_none()
        {
            return Err(Error::ErrHeartbeatAckWrongParam);
        }

        Ok(ChunkHeartbeatAck { params: vec![info] })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        // A HEARTBEAT ACK must carry exactly one Heartbeat Info parameter.
        if self.params.len() != 1 {
            return Err(Error::ErrHeartbeatAckWrongParam);
        }

        self.header().marshal_to(writer)?;
        for (idx, p) in self.params.iter().enumerate() {
            let pp = p.marshal()?;
            writer.extend(pp);
            if idx != self.params.len() - 1 {
                let cnt = padding_needed(writer.len());
                writer.extend(vec![0u8; cnt]);
            }
        }
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        let mut l = 0;
        for (idx, p) in self.params.iter().enumerate() {
            let p_len = PARAM_HEADER_LENGTH + p.value_length();
            l += p_len;
            if idx != self.params.len() - 1 {
                l += padding_needed(p_len);
            }
        }
        l
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
