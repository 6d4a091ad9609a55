use bytes::{Bytes, BytesMut};

use super::chunk_abort::*;
use super::chunk_cookie_ack::*;
use super::chunk_data::*;
use super::chunk_error::*;
use super::chunk_forward_tsn::*;
use super::chunk_header::*;
use super::chunk_init::*;
use super::chunk_reconfig::*;
use super::chunk_sack::*;
use super::chunk_shutdown::*;
use super::chunk_type::*;
use super::*;
use crate::error_cause::*;
use crate::param::param_outgoing_reset_request::ParamOutgoingResetRequest;
use crate::param::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use crate::param::param_state_cookie::ParamStateCookie;
use crate::param::Param;

///////////////////////////////////////////////////////////////////
// chunk_type_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_chunk_type_string() {
    let tt = vec![
        (CT_DATA, "DATA"),
        (CT_INIT, "INIT"),
        (CT_INIT_ACK, "INIT-ACK"),
        (CT_SACK, "SACK"),
        (CT_HEARTBEAT, "HEARTBEAT"),
        (CT_HEARTBEAT_ACK, "HEARTBEAT-ACK"),
        (CT_ABORT, "ABORT"),
        (CT_SHUTDOWN, "SHUTDOWN"),
        (CT_SHUTDOWN_ACK, "SHUTDOWN-ACK"),
        (CT_ERROR, "ERROR"),
        (CT_COOKIE_ECHO, "COOKIE-ECHO"),
        (CT_COOKIE_ACK, "COOKIE-ACK"),
        (CT_SHUTDOWN_COMPLETE, "SHUTDOWN-COMPLETE"),
        (CT_RECONFIG, "RECONFIG"),
        (CT_FORWARD_TSN, "FORWARD-TSN"),
        (ChunkType(255), "Unknown ChunkType: 255"),
    ];

    for (ct, expected) in tt {
        assert_eq!(
            ct.to_string(),
            expected,
            "failed to stringify chunkType {ct}"
        );
    }
}

#[test]
fn test_chunk_type_unknown_action() {
    // The two high bits of the type decide the receiver's reaction.
    assert_eq!(
        ChunkType(0x0f).unknown_action(),
        UnknownChunkAction::DiscardPacket
    );
    assert_eq!(
        ChunkType(0x4f).unknown_action(),
        UnknownChunkAction::DiscardPacketAndReport
    );
    assert_eq!(ChunkType(0x8f).unknown_action(), UnknownChunkAction::Skip);
    assert_eq!(
        ChunkType(0xcf).unknown_action(),
        UnknownChunkAction::SkipAndReport
    );
}

///////////////////////////////////////////////////////////////////
// chunk_header_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_chunk_header_rejects_short_buffer() {
    let raw = Bytes::from_static(&[0x0b, 0x00]);
    assert!(ChunkHeader::unmarshal(&raw).is_err());
}

#[test]
fn test_chunk_header_rejects_bad_length() {
    // declared length below the header size
    let raw = Bytes::from_static(&[0x0b, 0x00, 0x00, 0x02]);
    assert!(ChunkHeader::unmarshal(&raw).is_err());

    // declared length beyond the buffer
    let raw = Bytes::from_static(&[0x0b, 0x00, 0x00, 0x10]);
    assert!(ChunkHeader::unmarshal(&raw).is_err());
}

#[test]
fn test_chunk_header_ignores_padding_content() -> Result<()> {
    // senders are required to zero-pad, but a receiver tolerates any
    // padding bytes (RFC 4960 section 3.2)
    let raw = Bytes::from_static(&[0x0b, 0x00, 0x00, 0x05, 0xaa, 0x01, 0x02, 0x03]);
    let header = ChunkHeader::unmarshal(&raw)?;
    assert_eq!(header.typ, CT_COOKIE_ACK);
    assert_eq!(header.value_length(), 1);
    Ok(())
}

#[test]
fn test_chunk_header_round_trip() -> Result<()> {
    let raw = Bytes::from_static(&[0x0b, 0x00, 0x00, 0x04]);
    let header = ChunkHeader::unmarshal(&raw)?;
    assert_eq!(header.typ, CT_COOKIE_ACK);
    assert_eq!(header.value_length(), 0);
    assert_eq!(header.marshal()?, raw);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_data_test
///////////////////////////////////////////////////////////////////

static CHUNK_DATA_BYTES: Bytes = Bytes::from_static(&[
    0x00, 0x06, 0x00, 0x19, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x33, 0x74, 0x65, 0x73, 0x74, 0x20, 0x64, 0x61, 0x74, 0x61, 0x00, 0x00, 0x00,
]);

#[test]
fn test_data_chunk_unmarshal() -> Result<()> {
    let chunk = ChunkData::unmarshal(&CHUNK_DATA_BYTES)?;

    assert!(chunk.unordered, "chunk is unordered");
    assert!(chunk.beginning_fragment, "chunk is a beginning fragment");
    assert!(!chunk.ending_fragment);
    assert!(!chunk.immediate_sack);
    assert_eq!(chunk.tsn, 1);
    assert_eq!(chunk.stream_identifier, 1);
    assert_eq!(chunk.stream_sequence_number, 0);
    assert_eq!(chunk.payload_type, PayloadProtocolIdentifier::String);
    assert_eq!(&chunk.user_data[..], b"test data");
    Ok(())
}

#[test]
fn test_data_chunk_marshal() -> Result<()> {
    let chunk = ChunkData {
        unordered: true,
        beginning_fragment: true,
        tsn: 1,
        stream_identifier: 1,
        payload_type: PayloadProtocolIdentifier::String,
        user_data: Bytes::from_static(b"test data"),
        ..Default::default()
    };

    // Marshal emits no padding; the packet adds it.
    assert_eq!(chunk.marshal()?, CHUNK_DATA_BYTES.slice(..25));
    Ok(())
}

#[test]
fn test_data_chunk_abandoned_needs_all_inflight() {
    let mut chunk = ChunkData {
        ending_fragment: false,
        ..Default::default()
    };
    chunk.set_abandoned(true);
    assert!(
        !chunk.abandoned(),
        "must not be abandoned until every fragment is inflight"
    );

    chunk.ending_fragment = true;
    chunk.set_all_inflight();
    assert!(chunk.abandoned());
}

///////////////////////////////////////////////////////////////////
// chunk_init_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_init_round_trip() -> Result<()> {
    let mut init = ChunkInit {
        is_ack: false,
        initiate_tag: 0xdeadbeef,
        advertised_receiver_window_credit: 1024 * 1024,
        num_outbound_streams: 10,
        num_inbound_streams: 10,
        initial_tsn: 4242,
        params: vec![],
    };
    init.set_supported_extensions();

    let raw = init.marshal()?;
    let init2 = ChunkInit::unmarshal(&raw)?;

    assert!(!init2.is_ack);
    assert_eq!(init2.initiate_tag, 0xdeadbeef);
    assert_eq!(init2.advertised_receiver_window_credit, 1024 * 1024);
    assert_eq!(init2.num_outbound_streams, 10);
    assert_eq!(init2.num_inbound_streams, 10);
    assert_eq!(init2.initial_tsn, 4242);
    assert_eq!(init2.params.len(), 2);
    init2.check()
}

#[test]
fn test_init_ack_round_trip_with_cookie() -> Result<()> {
    let cookie = ParamStateCookie::new(0x01020304, 0x0a0b0c0d);
    let init_ack = ChunkInit {
        is_ack: true,
        initiate_tag: 1,
        advertised_receiver_window_credit: 512 * 1024,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 123,
        params: vec![Box::new(cookie.clone())],
    };

    let raw = init_ack.marshal()?;
    let init_ack2 = ChunkInit::unmarshal(&raw)?;
    assert!(init_ack2.is_ack);

    let cookie2 = init_ack2.params[0]
        .as_any()
        .downcast_ref::<ParamStateCookie>()
        .ok_or(Error::ErrInitAckNoCookie)?;
    assert_eq!(cookie2.cookie, cookie.cookie);
    Ok(())
}

#[test]
fn test_init_check_rejects_invalid_fields() {
    let valid = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 1500,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        ..Default::default()
    };
    assert!(valid.check().is_ok());

    let mut init = valid.clone();
    init.initiate_tag = 0;
    assert!(init.check().is_err(), "zero initiate tag");

    let mut init = valid.clone();
    init.num_outbound_streams = 0;
    assert!(init.check().is_err(), "zero outbound streams");

    let mut init = valid.clone();
    init.num_inbound_streams = 0;
    assert!(init.check().is_err(), "zero inbound streams");

    let mut init = valid;
    init.advertised_receiver_window_credit = 1499;
    assert!(init.check().is_err(), "a_rwnd below 1500");
}

#[test]
fn test_init_rejects_nonzero_flags() -> Result<()> {
    let init = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 1500,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        ..Default::default()
    };
    let raw = init.marshal()?;
    let mut corrupted = BytesMut::from(&raw[..]);
    corrupted[1] = 0x01;
    assert!(ChunkInit::unmarshal(&corrupted.freeze()).is_err());
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_sack_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_sack_round_trip() -> Result<()> {
    let sack = ChunkSack {
        cumulative_tsn_ack: 1000,
        advertised_receiver_window_credit: 121212,
        gap_ack_blocks: vec![
            GapAckBlock { start: 2, end: 3 },
            GapAckBlock { start: 5, end: 5 },
        ],
        duplicate_tsn: vec![999],
    };

    let raw = sack.marshal()?;
    let sack2 = ChunkSack::unmarshal(&raw)?;
    assert_eq!(sack2.cumulative_tsn_ack, 1000);
    assert_eq!(sack2.advertised_receiver_window_credit, 121212);
    assert_eq!(sack2.gap_ack_blocks, sack.gap_ack_blocks);
    assert_eq!(sack2.duplicate_tsn, vec![999]);
    Ok(())
}

#[test]
fn test_sack_rejects_inconsistent_counts() -> Result<()> {
    let sack = ChunkSack {
        cumulative_tsn_ack: 1,
        advertised_receiver_window_credit: 2,
        gap_ack_blocks: vec![GapAckBlock { start: 2, end: 3 }],
        duplicate_tsn: vec![],
    };
    let raw = sack.marshal()?;

    // Claim two gap ack blocks while carrying one.
    let mut corrupted = BytesMut::from(&raw[..]);
    corrupted[13] = 0x02;
    assert!(ChunkSack::unmarshal(&corrupted.freeze()).is_err());
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_abort_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_abort_chunk_one_error_cause() -> Result<()> {
    let abort1 = ChunkAbort {
        error_causes: vec![ErrorCause {
            code: PROTOCOL_VIOLATION,
            ..Default::default()
        }],
    };

    let b = abort1.marshal()?;
    let abort2 = ChunkAbort::unmarshal(&b)?;

    assert_eq!(abort2.error_causes.len(), 1, "should have only one cause");
    assert_eq!(
        abort2.error_causes[0].code,
        PROTOCOL_VIOLATION,
        "should match"
    );
    Ok(())
}

#[test]
fn test_abort_chunk_many_error_causes() -> Result<()> {
    let abort1 = ChunkAbort {
        error_causes: vec![
            ErrorCause {
                code: INVALID_MANDATORY_PARAMETER,
                ..Default::default()
            },
            ErrorCause {
                code: UNRECOGNIZED_CHUNK_TYPE,
                ..Default::default()
            },
            ErrorCause::user_initiated_abort("closing"),
        ],
    };

    let b = abort1.marshal()?;
    let abort2 = ChunkAbort::unmarshal(&b)?;
    assert_eq!(abort2.error_causes.len(), 3, "should have three causes");
    assert_eq!(abort2.error_causes[0].code, INVALID_MANDATORY_PARAMETER);
    assert_eq!(abort2.error_causes[1].code, UNRECOGNIZED_CHUNK_TYPE);
    assert_eq!(abort2.error_causes[2].code, USER_INITIATED_ABORT);
    assert_eq!(&abort2.error_causes[2].raw[..], b"closing");
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_error_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_error_chunk_stale_cookie_cause() -> Result<()> {
    let ec = ChunkError {
        error_causes: vec![ErrorCause::stale_cookie(250_000)],
    };
    let raw = ec.marshal()?;
    let ec2 = ChunkError::unmarshal(&raw)?;
    assert_eq!(ec2.error_causes.len(), 1);
    assert_eq!(ec2.error_causes[0].staleness_us(), Some(250_000));
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_shutdown_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_shutdown_round_trip() -> Result<()> {
    let shutdown = ChunkShutdown {
        cumulative_tsn_ack: 0x12345678,
    };
    let raw = shutdown.marshal()?;
    let shutdown2 = ChunkShutdown::unmarshal(&raw)?;
    assert_eq!(shutdown2.cumulative_tsn_ack, 0x12345678);
    Ok(())
}

#[test]
fn test_shutdown_rejects_wrong_length() {
    let raw = Bytes::from_static(&[0x07, 0x00, 0x00, 0x06, 0x12, 0x34]);
    assert!(ChunkShutdown::unmarshal(&raw).is_err());
}

///////////////////////////////////////////////////////////////////
// chunk_forward_tsn_test
///////////////////////////////////////////////////////////////////

static CHUNK_FORWARD_TSN_BYTES: Bytes = Bytes::from_static(&[
    0xc0, 0x0, 0x0, 0x8, 0x0, 0x0, 0x0, 0x3,
]);

#[test]
fn test_chunk_forward_tsn_success() -> Result<()> {
    let tests = vec![
        CHUNK_FORWARD_TSN_BYTES.clone(),
        Bytes::from_static(&[0xc0, 0x0, 0x0, 0xc, 0x0, 0x0, 0x0, 0x3, 0x0, 0x4, 0x0, 0x5]),
        Bytes::from_static(&[
            0xc0, 0x0, 0x0, 0x10, 0x0, 0x0, 0x0, 0x3, 0x0, 0x4, 0x0, 0x5, 0x0, 0x6, 0x0, 0x7,
        ]),
    ];

    for binary in tests {
        let actual = ChunkForwardTsn::unmarshal(&binary)?;
        let b = actual.marshal()?;
        assert_eq!(b, binary, "test not equal");
    }
    Ok(())
}

#[test]
fn test_chunk_forward_tsn_unmarshal_failure() {
    let tests = vec![
        ("chunk header to short", Bytes::from_static(&[0xc0])),
        (
            "missing cumulative TSN",
            Bytes::from_static(&[0xc0, 0x0, 0x0, 0x4]),
        ),
        (
            "wrong chunk type",
            Bytes::from_static(&[0x0, 0x0, 0x0, 0x8, 0x0, 0x0, 0x0, 0x3]),
        ),
    ];

    for (name, binary) in tests {
        let result = ChunkForwardTsn::unmarshal(&binary);
        assert!(result.is_err(), "expected unmarshal: {name} to fail.");
    }
}

///////////////////////////////////////////////////////////////////
// chunk_reconfig_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_chunk_reconfig_success() -> Result<()> {
    let tests = vec![
        Bytes::from_static(&[
            0x82, 0x0, 0x0, 0x1a, 0x0, 0xd, 0x0, 0x16, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x2,
            0x0, 0x0, 0x0, 0x3, 0x0, 0x4, 0x0, 0x5, 0x0, 0x6,
        ]),
        Bytes::from_static(&[0x82, 0x0, 0x0, 0xc, 0x0, 0xe, 0x0, 0x8, 0x0, 0x0, 0x0, 0x1]),
        Bytes::from_static(&[
            0x82, 0x0, 0x0, 0x10, 0x0, 0x10, 0x0, 0xc, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1,
        ]),
    ];

    for (i, binary) in tests.iter().enumerate() {
        let actual = ChunkReconfig::unmarshal(binary)?;
        let b = actual.marshal()?;
        assert_eq!(b, binary, "test {i} not equal: {b:?} vs {binary:?}");
    }
    Ok(())
}

#[test]
fn test_chunk_reconfig_unmarshal_failure() {
    let mut buf = BytesMut::new();
    buf.extend(vec![0x82, 0x0, 0x0, 0x18, 0x0, 0xd, 0x0, 0x16]);
    // Param too short for its own declared length.
    buf.extend(vec![0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x2, 0x0, 0x0, 0x0, 0x3]);
    let tests = vec![
        ("chunk header to short", Bytes::from_static(&[0x82])),
        (
            "missing parse param type",
            Bytes::from_static(&[0x82, 0x0, 0x0, 0x4]),
        ),
        (
            "wrong param",
            Bytes::from_static(&[0x82, 0x0, 0x0, 0x8, 0x0, 0xd, 0x0, 0x4]),
        ),
        ("wrong param length", buf.freeze()),
    ];

    for (name, binary) in tests {
        let result = ChunkReconfig::unmarshal(&binary);
        assert!(result.is_err(), "expected unmarshal: {name} to fail.");
    }
}

#[test]
fn test_chunk_reconfig_request_and_response_bundled() -> Result<()> {
    let req = ParamOutgoingResetRequest {
        request_sequence_number: 3,
        sender_last_tsn: 10,
        stream_identifiers: vec![42],
        ..Default::default()
    };
    let resp = ParamReconfigResponse {
        response_sequence_number: 2,
        result: ReconfigResult::SuccessPerformed,
    };
    let rc = ChunkReconfig {
        param_a: Some(Box::new(req)),
        param_b: Some(Box::new(resp)),
    };

    let raw = rc.marshal()?;
    let rc2 = ChunkReconfig::unmarshal(&raw)?;

    let req2 = rc2
        .param_a
        .as_ref()
        .and_then(|p| p.as_any().downcast_ref::<ParamOutgoingResetRequest>())
        .ok_or(Error::ErrReconfigMissingParam)?;
    assert_eq!(req2.request_sequence_number, 3);
    assert_eq!(req2.stream_identifiers, vec![42]);

    let resp2 = rc2
        .param_b
        .as_ref()
        .and_then(|p| p.as_any().downcast_ref::<ParamReconfigResponse>())
        .ok_or(Error::ErrReconfigMissingParam)?;
    assert_eq!(resp2.response_sequence_number, 2);
    assert_eq!(resp2.result, ReconfigResult::SuccessPerformed);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// chunk_cookie_ack_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_cookie_ack_round_trip() -> Result<()> {
    let raw = ChunkCookieAck.marshal()?;
    assert_eq!(&raw[..], &[0x0b, 0x00, 0x00, 0x04]);
    ChunkCookieAck::unmarshal(&raw)?;
    Ok(())
}
