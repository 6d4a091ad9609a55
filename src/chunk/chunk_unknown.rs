use std::fmt;

use bytes::{Bytes, BytesMut};

use super::chunk_header::*;
use super::*;

/// ChunkUnknown preserves a chunk of unrecognized type so its handling
/// can follow the two high bits of the type code (RFC 4960 section 3.2):
/// the raw bytes are kept for the Unrecognized Chunk Type error cause.
#[derive(Default, Debug, Clone)]
pub(crate) struct ChunkUnknown {
    pub(crate) header: ChunkHeader,
    pub(crate) value: Bytes,
}

impl fmt::Display for ChunkUnknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)
    }
}

impl Chunk for ChunkUnknown {
    fn header(&self) -> ChunkHeader {
        self.header.clone()
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());
        Ok(ChunkUnknown { header, value })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header.marshal_to(writer)?;
        writer.extend(self.value.clone());
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        self.value.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

impl ChunkUnknown {
    /// The whole chunk as sent, for echoing inside an ERROR or ABORT.
    pub(crate) fn raw_chunk(&self) -> Result<Bytes> {
        self.marshal()
    }
}
