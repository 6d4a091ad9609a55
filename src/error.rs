use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the protocol engine.
///
/// Wire-format violations (`ErrChunk*`, `ErrParam*`, `ErrPacket*`,
/// `ErrChecksumMismatch`) abort decoding of the offending chunk or packet
/// without corrupting association state. State and handshake errors may
/// tear the association down; the per-call errors (`ErrStreamClosed`,
/// `ErrPayloadTooBig`, ...) fail only the call that raised them.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too short for a chunk header")]
    ErrChunkHeaderTooShort,
    #[error("chunk length field is inconsistent with the buffer")]
    ErrChunkLengthInvalid,
    #[error("chunk is too short for its mandatory fields")]
    ErrChunkTooShort,
    #[error("chunk type does not match the expected type")]
    ErrUnexpectedChunkType,

    #[error("INIT chunk flags must be zero")]
    ErrInitFlagsNonZero,
    #[error("initiate tag must not be zero")]
    ErrInitTagZero,
    #[error("number of inbound streams must not be zero")]
    ErrInitInboundStreamsZero,
    #[error("number of outbound streams must not be zero")]
    ErrInitOutboundStreamsZero,
    #[error("advertised receiver window credit is below the minimum of 1500")]
    ErrInitAdvertisedWindowTooSmall,
    #[error("INIT ACK carries no state cookie")]
    ErrInitAckNoCookie,
    #[error("INIT chunk must not be bundled with any other chunk")]
    ErrInitChunkBundled,
    #[error("packet carrying an INIT chunk must have a verification tag of zero")]
    ErrInitVerificationTagNotZero,

    #[error("HEARTBEAT carries no heartbeat info parameter")]
    ErrHeartbeatMissingInfo,
    #[error("HEARTBEAT ACK must carry exactly one heartbeat info parameter")]
    ErrHeartbeatAckWrongParam,

    #[error("RECONFIG carries no reconfiguration parameter")]
    ErrReconfigMissingParam,

    #[error("raw is too short for a parameter header")]
    ErrParamHeaderTooShort,
    #[error("parameter length field is inconsistent with the buffer")]
    ErrParamLengthInvalid,
    #[error("unhandled parameter type `{typ}`")]
    ErrParamTypeUnhandled { typ: u16 },
    #[error("parameter type does not match the expected type")]
    ErrUnexpectedParamType,

    #[error("raw is too short for an error cause")]
    ErrCauseTooShort,

    #[error("raw is too short for a packet header")]
    ErrPacketHeaderTooShort,
    #[error("packet checksum mismatch")]
    ErrChecksumMismatch,
    #[error("packet source port must not be zero")]
    ErrPacketSourcePortZero,
    #[error("packet destination port must not be zero")]
    ErrPacketDestinationPortZero,

    #[error("DCEP message is too short")]
    ErrDcepTooShort,
    #[error("DCEP message type is unknown")]
    ErrDcepUnknownMessageType,
    #[error("DCEP channel type is unknown")]
    ErrDcepUnknownChannelType,

    #[error("association is closed")]
    ErrAssociationClosed,
    #[error("association closed before the handshake completed")]
    ErrAssociationClosedBeforeConn,
    #[error("association init failed")]
    ErrAssociationInitFailed,
    #[error("no INIT stored to send")]
    ErrInitNotStoredToSend,
    #[error("no COOKIE ECHO stored to send")]
    ErrCookieEchoNotStoredToSend,
    #[error("tsn not found in the inflight queue")]
    ErrInflightQueueTsnPop,
    #[error("handshake failed waiting for INIT ACK")]
    ErrHandshakeInitAck,
    #[error("handshake failed waiting for COOKIE ECHO")]
    ErrHandshakeCookieEcho,
    #[error("state cookie is stale")]
    ErrStaleCookie,
    #[error("state cookie does not bind this handshake")]
    ErrCookieMismatch,
    #[error("chunk received in an incompatible association state")]
    ErrChunkInState,
    #[error("unhandled chunk type")]
    ErrChunkTypeUnhandled,
    #[error("silently discard")]
    ErrSilentlyDiscard,
    #[error("abort chunk with following error causes: {0}")]
    ErrAbortChunk(String),

    #[error("a stream with this identifier already exists")]
    ErrStreamAlreadyExist,
    #[error("stream is closed")]
    ErrStreamClosed,
    #[error("message larger than the maximum message size")]
    ErrPayloadTooBig,
    #[error("operation requires an established association")]
    ErrNotEstablished,
    #[error("no complete message to read yet")]
    ErrTryAgain,

    #[error("{0}")]
    Other(String),
}
