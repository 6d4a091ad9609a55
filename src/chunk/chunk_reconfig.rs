use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::param::param_header::PARAM_HEADER_LENGTH;
use crate::param::{build_param, Param};
use crate::util::padding_needed;

/// ChunkReconfig is the RE-CONFIG chunk of RFC 6525 section 3.1. It
/// carries at most two reconfiguration parameters; a request may travel
/// together with a response to the peer's own request.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 130  |  Chunk Flags  |      Chunk Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  Re-configuration Parameter                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |             Re-configuration Parameter (optional)             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Default, Debug)]
pub(crate) struct ChunkReconfig {
    pub(crate) param_a: Option<Box<dyn Param + Send + Sync>>,
    pub(crate) param_b: Option<Box<dyn Param + Send + Sync>>,
}

impl Clone for ChunkReconfig {
    fn clone(&self) -> Self {
        ChunkReconfig {
            param_a: self.param_a.clone(),
            param_b: self.param_b.clone(),
        }
    }
}

impl fmt::Display for ChunkReconfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = String::new();
        if let Some(param_a) = &self.param_a {
            res += format!("Param A:\n {param_a}").as_str();
        }
        if let Some(param_b) = &self.param_b {
            res += format!("Param B:\n {param_b}").as_str()
        }
        write!(f, "{res}")
    }
}

impl Chunk for ChunkReconfig {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_RECONFIG,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_RECONFIG {
            return Err(Error::ErrUnexpectedChunkType);
        }
        if header.value_length() < PARAM_HEADER_LENGTH {
            return Err(Error::ErrReconfigMissingParam);
        }

        let end = CHUNK_HEADER_SIZE + header.value_length();
        let param_a = build_param(&raw.slice(CHUNK_HEADER_SIZE..end))?;

        let pa_len = PARAM_HEADER_LENGTH + param_a.value_length();
        let offset = CHUNK_HEADER_SIZE + pa_len + padding_needed(pa_len);
        let param_b = if offset + PARAM_HEADER_LENGTH <= end {
            Some(build_param(&raw.slice(offset..end))?)
        } else {
            None
        };

        Ok(ChunkReconfig {
            param_a: Some(param_a),
            param_b,
        })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;
        if let Some(param_a) = &self.param_a {
            param_a.marshal_to(writer)?;
        } else {
            return Err(Error::ErrReconfigMissingParam);
        }
        if let Some(param_b) = &self.param_b {
            // Pad between the two parameters, not after the last.
            let cnt = padding_needed(writer.len());
            writer.extend(vec![0u8; cnt]);
            param_b.marshal_to(writer)?;
        }
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        let mut l = 0;
        if let Some(param_a) = &self.param_a {
            l += PARAM_HEADER_LENGTH + param_a.value_length();
        }
        if let Some(param_b) = &self.param_b {
            l += padding_needed(l) + PARAM_HEADER_LENGTH + param_b.value_length();
        }
        l
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
