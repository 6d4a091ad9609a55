use std::fmt;

/// ParamType identifies an optional/variable-length parameter inside a
/// chunk (RFC 4960 section 3.2.1, RFC 6525 section 4, RFC 4895, RFC 3758).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) struct ParamType(pub(crate) u16);

pub(crate) const PT_HEARTBEAT_INFO: ParamType = ParamType(1);
pub(crate) const PT_IPV4_ADDRESS: ParamType = ParamType(5);
pub(crate) const PT_IPV6_ADDRESS: ParamType = ParamType(6);
pub(crate) const PT_STATE_COOKIE: ParamType = ParamType(7);
pub(crate) const PT_UNRECOGNIZED_PARAM: ParamType = ParamType(8);
pub(crate) const PT_COOKIE_PRESERVATIVE: ParamType = ParamType(9);
pub(crate) const PT_HOST_NAME_ADDRESS: ParamType = ParamType(11);
pub(crate) const PT_SUPPORTED_ADDRESS_TYPES: ParamType = ParamType(12);
pub(crate) const PT_OUTGOING_SSN_RESET_REQUEST: ParamType = ParamType(13);
pub(crate) const PT_INCOMING_SSN_RESET_REQUEST: ParamType = ParamType(14);
pub(crate) const PT_SSN_TSN_RESET_REQUEST: ParamType = ParamType(15);
pub(crate) const PT_RECONFIG_RESPONSE: ParamType = ParamType(16);
pub(crate) const PT_ADD_OUTGOING_STREAMS_REQUEST: ParamType = ParamType(17);
pub(crate) const PT_ADD_INCOMING_STREAMS_REQUEST: ParamType = ParamType(18);
pub(crate) const PT_RANDOM: ParamType = ParamType(32770);
pub(crate) const PT_CHUNK_LIST: ParamType = ParamType(32771);
pub(crate) const PT_REQUESTED_HMAC_ALGORITHM: ParamType = ParamType(32772);
pub(crate) const PT_SUPPORTED_EXTENSIONS: ParamType = ParamType(32776);
pub(crate) const PT_FORWARD_TSN_SUPPORTED: ParamType = ParamType(49152);

impl ParamType {
    /// True when the two high bits of the type ask the receiver to skip an
    /// unrecognized parameter and keep parsing the rest of the chunk
    /// (RFC 4960 section 3.2.1).
    pub(crate) fn skip_if_unrecognized(self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// True when an unrecognized parameter of this type must be reported
    /// back to the sender in an Unrecognized Parameter.
    pub(crate) fn report_if_unrecognized(self) -> bool {
        self.0 & 0x4000 != 0
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("Unknown ParamType: {}", self.0);
        let s = match *self {
            PT_HEARTBEAT_INFO => "Heartbeat Info",
            PT_IPV4_ADDRESS => "IPv4 Address",
            PT_IPV6_ADDRESS => "IPv6 Address",
            PT_STATE_COOKIE => "State Cookie",
            PT_UNRECOGNIZED_PARAM => "Unrecognized Parameter",
            PT_COOKIE_PRESERVATIVE => "Cookie Preservative",
            PT_HOST_NAME_ADDRESS => "Host Name Address",
            PT_SUPPORTED_ADDRESS_TYPES => "Supported Address Types",
            PT_OUTGOING_SSN_RESET_REQUEST => "Outgoing SSN Reset Request",
            PT_INCOMING_SSN_RESET_REQUEST => "Incoming SSN Reset Request",
            PT_SSN_TSN_RESET_REQUEST => "SSN/TSN Reset Request",
            PT_RECONFIG_RESPONSE => "Re-configuration Response",
            PT_ADD_OUTGOING_STREAMS_REQUEST => "Add Outgoing Streams Request",
            PT_ADD_INCOMING_STREAMS_REQUEST => "Add Incoming Streams Request",
            PT_RANDOM => "Random",
            PT_CHUNK_LIST => "Chunk List",
            PT_REQUESTED_HMAC_ALGORITHM => "Requested HMAC Algorithm",
            PT_SUPPORTED_EXTENSIONS => "Supported Extensions",
            PT_FORWARD_TSN_SUPPORTED => "Forward TSN Supported",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}
