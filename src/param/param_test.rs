use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::param_add_streams::*;
use super::param_header::*;
use super::param_incoming_reset_request::*;
use super::param_ip_address::*;
use super::param_outgoing_reset_request::*;
use super::param_reconfig_response::*;
use super::param_ssn_tsn_reset_request::*;
use super::param_state_cookie::*;
use super::param_type::*;
use super::param_unknown::*;
use super::*;

///////////////////////////////////////////////////////////////////
// param_type_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_param_type_unrecognized_bits() {
    // high bit: skip and continue; next bit: report
    assert!(!PT_STATE_COOKIE.skip_if_unrecognized());
    assert!(!PT_STATE_COOKIE.report_if_unrecognized());

    let skip_only = ParamType(0x8123);
    assert!(skip_only.skip_if_unrecognized());
    assert!(!skip_only.report_if_unrecognized());

    let skip_and_report = ParamType(0xc123);
    assert!(skip_and_report.skip_if_unrecognized());
    assert!(skip_and_report.report_if_unrecognized());

    let stop_and_report = ParamType(0x4123);
    assert!(!stop_and_report.skip_if_unrecognized());
    assert!(stop_and_report.report_if_unrecognized());
}

///////////////////////////////////////////////////////////////////
// param_header_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_param_header_rejects_invalid_lengths() {
    // too short for a header
    assert!(ParamHeader::unmarshal(&Bytes::from_static(&[0x00])).is_err());

    // declared length below the header size
    assert!(ParamHeader::unmarshal(&Bytes::from_static(&[0x00, 0x07, 0x00, 0x01])).is_err());

    // declared length beyond the buffer
    assert!(
        ParamHeader::unmarshal(&Bytes::from_static(&[0x00, 0x07, 0x00, 0x09, 0xff])).is_err()
    );
}

///////////////////////////////////////////////////////////////////
// build_param_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_build_param_skippable_unknown_type_is_preserved() -> Result<()> {
    // 0xc00f: both high bits set, so parse as ParamUnknown and keep going.
    let raw = Bytes::from_static(&[0xc0, 0x0f, 0x00, 0x06, 0xaa, 0xbb, 0x00, 0x00]);
    let p = build_param(&raw)?;
    let unknown = p
        .as_any()
        .downcast_ref::<ParamUnknown>()
        .ok_or(Error::ErrUnexpectedParamType)?;
    assert_eq!(unknown.typ, 0xc00f);
    assert_eq!(&unknown.value[..], &[0xaa, 0xbb]);

    // and it re-marshals bit for bit (padding excluded)
    assert_eq!(p.marshal()?, raw.slice(..6));
    Ok(())
}

#[test]
fn test_build_param_stop_unknown_type_fails() {
    // 0x400f: stop processing this chunk's parameters.
    let raw = Bytes::from_static(&[0x40, 0x0f, 0x00, 0x06, 0xaa, 0xbb, 0x00, 0x00]);
    let result = build_param(&raw);
    assert!(matches!(
        result,
        Err(Error::ErrParamTypeUnhandled { typ: 0x400f })
    ));
}

#[test]
fn test_build_param_empty_buffer() {
    assert!(build_param(&Bytes::new()).is_err());
}

///////////////////////////////////////////////////////////////////
// param_state_cookie_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_state_cookie_binds_tags() -> Result<()> {
    let cookie = ParamStateCookie::new(0x01020304, 0x05060708);
    let raw = cookie.marshal()?;
    let cookie2 = ParamStateCookie::unmarshal(&raw)?;

    let (issued_at_ms, local_tag, peer_tag) =
        cookie2.decode().ok_or(Error::ErrCookieMismatch)?;
    assert_eq!(local_tag, 0x01020304);
    assert_eq!(peer_tag, 0x05060708);
    assert!(issued_at_ms > 0);
    Ok(())
}

#[test]
fn test_state_cookie_wrong_shape_does_not_decode() {
    let cookie = ParamStateCookie {
        cookie: Bytes::from_static(&[1, 2, 3]),
    };
    assert!(cookie.decode().is_none());
}

#[test]
fn test_state_cookie_nonce_is_random() {
    let a = ParamStateCookie::new(1, 2);
    let b = ParamStateCookie::new(1, 2);
    assert_ne!(a.cookie, b.cookie, "two cookies must differ in nonce");
}

///////////////////////////////////////////////////////////////////
// param_ip_address_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_ip_address_round_trip() -> Result<()> {
    let v4 = ParamIpAddress {
        address: "192.0.2.1".parse::<IpAddr>().unwrap(),
    };
    let raw = v4.marshal()?;
    assert_eq!(raw.len(), 8);
    assert_eq!(ParamIpAddress::unmarshal(&raw)?.address, v4.address);

    let v6 = ParamIpAddress {
        address: "2001:db8::1".parse::<IpAddr>().unwrap(),
    };
    let raw = v6.marshal()?;
    assert_eq!(raw.len(), 20);
    assert_eq!(ParamIpAddress::unmarshal(&raw)?.address, v6.address);
    Ok(())
}

#[test]
fn test_ip_address_rejects_wrong_value_length() {
    // IPv4 parameter with 3 address bytes
    let raw = Bytes::from_static(&[0x00, 0x05, 0x00, 0x07, 0xc0, 0x00, 0x02]);
    assert!(ParamIpAddress::unmarshal(&raw).is_err());
}

///////////////////////////////////////////////////////////////////
// reconfig param tests
///////////////////////////////////////////////////////////////////

#[test]
fn test_outgoing_reset_request_round_trip() -> Result<()> {
    let req = ParamOutgoingResetRequest {
        request_sequence_number: 100,
        response_sequence_number: 52,
        sender_last_tsn: 99,
        stream_identifiers: vec![1, 2, 3],
    };
    let raw = req.marshal()?;
    let req2 = ParamOutgoingResetRequest::unmarshal(&raw)?;
    assert_eq!(req2, req);
    Ok(())
}

#[test]
fn test_outgoing_reset_request_empty_stream_list() -> Result<()> {
    // empty list means all streams
    let req = ParamOutgoingResetRequest {
        request_sequence_number: 1,
        ..Default::default()
    };
    let raw = req.marshal()?;
    assert_eq!(raw.len(), PARAM_HEADER_LENGTH + 12);
    let req2 = ParamOutgoingResetRequest::unmarshal(&raw)?;
    assert!(req2.stream_identifiers.is_empty());
    Ok(())
}

#[test]
fn test_outgoing_reset_request_rejects_truncated() {
    let raw = Bytes::from_static(&[0x0, 0xd, 0x0, 0x8, 0x0, 0x0, 0x0, 0x1]);
    assert!(ParamOutgoingResetRequest::unmarshal(&raw).is_err());
}

#[test]
fn test_incoming_reset_request_round_trip() -> Result<()> {
    let req = ParamIncomingResetRequest {
        request_sequence_number: 7,
        stream_identifiers: vec![0, 1],
    };
    let raw = req.marshal()?;
    let req2 = ParamIncomingResetRequest::unmarshal(&raw)?;
    assert_eq!(req2, req);
    Ok(())
}

#[test]
fn test_ssn_tsn_reset_request_round_trip() -> Result<()> {
    let req = ParamSsnTsnResetRequest {
        request_sequence_number: 31,
    };
    let raw = req.marshal()?;
    let req2 = ParamSsnTsnResetRequest::unmarshal(&raw)?;
    assert_eq!(req2.request_sequence_number, 31);
    Ok(())
}

#[test]
fn test_reconfig_response_round_trip() -> Result<()> {
    let resp = ParamReconfigResponse {
        response_sequence_number: 12,
        result: ReconfigResult::ErrorBadSequenceNumber,
    };
    let raw = resp.marshal()?;
    let resp2 = ParamReconfigResponse::unmarshal(&raw)?;
    assert_eq!(resp2, resp);
    Ok(())
}

#[test]
fn test_reconfig_response_accepts_optional_tsn_fields() -> Result<()> {
    // responses to SSN/TSN resets append sender and receiver TSNs
    let mut raw = BytesMut::new();
    raw.put_u16(16); // reconfig response
    raw.put_u16(20);
    raw.put_u32(5); // response seq
    raw.put_u32(1); // result
    raw.put_u32(1000); // sender's next TSN
    raw.put_u32(2000); // receiver's next TSN
    let resp = ParamReconfigResponse::unmarshal(&raw.freeze())?;
    assert_eq!(resp.response_sequence_number, 5);
    assert_eq!(resp.result, ReconfigResult::SuccessPerformed);
    Ok(())
}

#[test]
fn test_reconfig_result_from_u32() {
    assert_eq!(ReconfigResult::from(0), ReconfigResult::SuccessNop);
    assert_eq!(ReconfigResult::from(1), ReconfigResult::SuccessPerformed);
    assert_eq!(ReconfigResult::from(2), ReconfigResult::Denied);
    assert_eq!(ReconfigResult::from(6), ReconfigResult::InProgress);
    assert_eq!(
        ReconfigResult::from(12345),
        ReconfigResult::ErrorBadSequenceNumber
    );
}

#[test]
fn test_add_streams_round_trip() -> Result<()> {
    for incoming in [false, true] {
        let p = ParamAddStreams {
            incoming,
            request_sequence_number: 55,
            number_of_new_streams: 16,
        };
        let raw = p.marshal()?;
        let p2 = ParamAddStreams::unmarshal(&raw)?;
        assert_eq!(p2, p);
    }
    Ok(())
}

///////////////////////////////////////////////////////////////////
// padding interplay
///////////////////////////////////////////////////////////////////

#[test]
fn test_param_length_excludes_padding() -> Result<()> {
    // A 2-byte value yields a wire length of 6 even though 8 bytes travel.
    let p = ParamUnknown {
        typ: 0x8001,
        value: Bytes::from_static(&[0xab, 0xcd]),
    };
    let raw = p.marshal()?;
    assert_eq!(raw.len(), 6);
    let mut reader = raw.slice(2..);
    assert_eq!(reader.get_u16(), 6);
    Ok(())
}
