use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use super::param_header::*;
use super::param_type::*;
use super::*;

const COOKIE_ISSUED_AT_LENGTH: usize = 8;
const COOKIE_TAGS_LENGTH: usize = 8;
const COOKIE_NONCE_LENGTH: usize = 16;
pub(crate) const COOKIE_VALUE_LENGTH: usize =
    COOKIE_ISSUED_AT_LENGTH + COOKIE_TAGS_LENGTH + COOKIE_NONCE_LENGTH;

/// State Cookie issued in INIT ACK and echoed in COOKIE ECHO. The value
/// binds the handshake: issue time (for the staleness check), both
/// verification tags, and a random nonce. Opaque to the peer.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ParamStateCookie {
    pub(crate) cookie: Bytes,
}

impl fmt::Display for ParamStateCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.header(), self.cookie)
    }
}

impl Param for ParamStateCookie {
    fn header(&self) -> ParamHeader {
        ParamHeader {
            typ: PT_STATE_COOKIE,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ParamHeader::unmarshal(raw)?;
        if header.typ != PT_STATE_COOKIE {
            return Err(Error::ErrUnexpectedParamType);
        }
        let cookie = raw.slice(PARAM_HEADER_LENGTH..PARAM_HEADER_LENGTH + header.value_length());
        Ok(ParamStateCookie { cookie })
    }

    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(buf)?;
        buf.extend(self.cookie.clone());
        Ok(buf.len())
    }

    fn value_length(&self) -> usize {
        self.cookie.len()
    }

    fn clone_to(&self) -> Box<dyn Param + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

impl ParamStateCookie {
    pub(crate) fn new(local_tag: u32, peer_tag: u32) -> Self {
        let mut cookie = BytesMut::with_capacity(COOKIE_VALUE_LENGTH);
        cookie.put_u64(unix_time_ms());
        cookie.put_u32(local_tag);
        cookie.put_u32(peer_tag);
        let mut nonce = [0u8; COOKIE_NONCE_LENGTH];
        rand::thread_rng().fill(&mut nonce);
        cookie.extend_from_slice(&nonce);

        ParamStateCookie {
            cookie: cookie.freeze(),
        }
    }

    /// Fields the cookie binds, or None when the echoed value has the
    /// wrong shape.
    pub(crate) fn decode(&self) -> Option<(u64, u32, u32)> {
        if self.cookie.len() != COOKIE_VALUE_LENGTH {
            return None;
        }
        let mut reader = self.cookie.clone();
        let issued_at_ms = reader.get_u64();
        let local_tag = reader.get_u32();
        let peer_tag = reader.get_u32();
        Some((issued_at_ms, local_tag, peer_tag))
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
