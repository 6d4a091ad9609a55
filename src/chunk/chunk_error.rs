use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::error_cause::*;
use crate::util::padding_needed;

/// ChunkError reports recoverable conditions to the peer without closing
/// the association (RFC 4960 section 3.3.10), for example a stale cookie
/// or an unrecognized chunk type that asked to be reported.
#[derive(Default, Debug, Clone)]
pub(crate) struct ChunkError {
    pub(crate) error_causes: Vec<ErrorCause>,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = self.header().to_string();
        for cause in &self.error_causes {
            res += format!("\n - {cause}").as_str();
        }
        write!(f, "{res}")
    }
}

impl Chunk for ChunkError {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_ERROR,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_ERROR {
            return Err(Error::ErrUnexpectedChunkType);
        }

        let mut error_causes = vec![];
        let mut offset = CHUNK_HEADER_SIZE;
        let end = CHUNK_HEADER_SIZE + header.value_length();
        while offset + ERROR_CAUSE_HEADER_LENGTH <= end {
            let e = ErrorCause::unmarshal(&raw.slice(offset..end))?;
            offset += e.length() + padding_needed(e.length());
            error_causes.push(e);
        }

        Ok(ChunkError { error_causes })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;
        for (idx, ec) in self.error_causes.iter().enumerate() {
            writer.extend(ec.marshal());
            if idx != self.error_causes.len() - 1 {
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
        for (idx, ec) in self.error_causes.iter().enumerate() {
            l += ec.length();
            if idx != self.error_causes.len() - 1 {
                l += padding_needed(ec.length());
            }
        }
        l
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
