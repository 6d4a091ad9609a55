#[cfg(test)]
mod param_test;

pub(crate) mod param_add_streams;
pub(crate) mod param_chunk_list;
pub(crate) mod param_cookie_preservative;
pub(crate) mod param_forward_tsn_supported;
pub(crate) mod param_header;
pub(crate) mod param_heartbeat_info;
pub(crate) mod param_host_name_address;
pub(crate) mod param_incoming_reset_request;
pub(crate) mod param_ip_address;
pub(crate) mod param_outgoing_reset_request;
pub(crate) mod param_random;
pub(crate) mod param_reconfig_response;
pub(crate) mod param_requested_hmac_algorithm;
pub(crate) mod param_ssn_tsn_reset_request;
pub(crate) mod param_state_cookie;
pub(crate) mod param_supported_address_types;
pub(crate) mod param_supported_extensions;
pub(crate) mod param_type;
pub(crate) mod param_unknown;
pub(crate) mod param_unrecognized;

use std::any::Any;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use param_add_streams::*;
use param_chunk_list::*;
use param_cookie_preservative::*;
use param_forward_tsn_supported::*;
use param_header::*;
use param_heartbeat_info::*;
use param_host_name_address::*;
use param_incoming_reset_request::*;
use param_ip_address::*;
use param_outgoing_reset_request::*;
use param_random::*;
use param_reconfig_response::*;
use param_requested_hmac_algorithm::*;
use param_ssn_tsn_reset_request::*;
use param_state_cookie::*;
use param_supported_address_types::*;
use param_supported_extensions::*;
use param_type::*;
use param_unknown::*;
use param_unrecognized::*;

use crate::error::{Error, Result};

/// Common capability of every TLV parameter. Mirrors [`crate::chunk::Chunk`]
/// plus cloning behind the trait object, since chunks own boxed parameter
/// lists.
pub(crate) trait Param: fmt::Display + fmt::Debug {
    fn header(&self) -> ParamHeader;
    fn unmarshal(raw: &Bytes) -> Result<Self>
    where
        Self: Sized;
    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize>;
    fn value_length(&self) -> usize;
    fn clone_to(&self) -> Box<dyn Param + Send + Sync>;
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    fn marshal(&self) -> Result<Bytes> {
        let capacity = PARAM_HEADER_LENGTH + self.value_length();
        let mut buf = BytesMut::with_capacity(capacity);
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl Clone for Box<dyn Param + Send + Sync> {
    fn clone(&self) -> Box<dyn Param + Send + Sync> {
        self.clone_to()
    }
}

/// The parameter registry: decodes one TLV into its typed parameter.
///
/// Unrecognized type codes degrade instead of failing the whole chunk:
/// when the type's high bit asks the receiver to skip and continue, the
/// raw value is preserved in a [`ParamUnknown`]; otherwise an error tells
/// the caller to stop parsing further parameters.
pub(crate) fn build_param(raw_param: &Bytes) -> Result<Box<dyn Param + Send + Sync>> {
    if raw_param.len() < PARAM_HEADER_LENGTH {
        return Err(Error::ErrParamHeaderTooShort);
    }
    let reader = &mut raw_param.clone();
    let raw_type = reader.get_u16();
    match ParamType(raw_type) {
        PT_HEARTBEAT_INFO => Ok(Box::new(ParamHeartbeatInfo::unmarshal(raw_param)?)),
        PT_IPV4_ADDRESS | PT_IPV6_ADDRESS => Ok(Box::new(ParamIpAddress::unmarshal(raw_param)?)),
        PT_STATE_COOKIE => Ok(Box::new(ParamStateCookie::unmarshal(raw_param)?)),
        PT_UNRECOGNIZED_PARAM => Ok(Box::new(ParamUnrecognized::unmarshal(raw_param)?)),
        PT_COOKIE_PRESERVATIVE => Ok(Box::new(ParamCookiePreservative::unmarshal(raw_param)?)),
        PT_HOST_NAME_ADDRESS => Ok(Box::new(ParamHostNameAddress::unmarshal(raw_param)?)),
        PT_SUPPORTED_ADDRESS_TYPES => {
            Ok(Box::new(ParamSupportedAddressTypes::unmarshal(raw_param)?))
        }
        PT_OUTGOING_SSN_RESET_REQUEST => {
            Ok(Box::new(ParamOutgoingResetRequest::unmarshal(raw_param)?))
        }
        PT_INCOMING_SSN_RESET_REQUEST => {
            Ok(Box::new(ParamIncomingResetRequest::unmarshal(raw_param)?))
        }
        PT_SSN_TSN_RESET_REQUEST => Ok(Box::new(ParamSsnTsnResetRequest::unmarshal(raw_param)?)),
        PT_RECONFIG_RESPONSE => Ok(Box::new(ParamReconfigResponse::unmarshal(raw_param)?)),
        PT_ADD_OUTGOING_STREAMS_REQUEST | PT_ADD_INCOMING_STREAMS_REQUEST => {
            Ok(Box::new(ParamAddStreams::unmarshal(raw_param)?))
        }
        PT_RANDOM => Ok(Box::new(ParamRandom::unmarshal(raw_param)?)),
        PT_CHUNK_LIST => Ok(Box::new(ParamChunkList::unmarshal(raw_param)?)),
        PT_REQUESTED_HMAC_ALGORITHM => {
            Ok(Box::new(ParamRequestedHmacAlgorithm::unmarshal(raw_param)?))
        }
        PT_SUPPORTED_EXTENSIONS => Ok(Box::new(ParamSupportedExtensions::unmarshal(raw_param)?)),
        PT_FORWARD_TSN_SUPPORTED => Ok(Box::new(ParamForwardTsnSupported::unmarshal(raw_param)?)),
        typ if typ.skip_if_unrecognized() => Ok(Box::new(ParamUnknown::unmarshal(raw_param)?)),
        _ => Err(Error::ErrParamTypeUnhandled { typ: raw_type }),
    }
}
