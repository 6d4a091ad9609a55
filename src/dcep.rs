//! Data Channel Establishment Protocol (DCEP) messages.
//!
//! DCEP rides on top of the transport as ordinary user messages with
//! payload protocol identifier 50, always sent ordered and reliable. The
//! side opening a channel sends DATA_CHANNEL_OPEN as the first message on
//! the stream; the peer answers DATA_CHANNEL_ACK on the same stream.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::stream::ReliabilityType;

const MESSAGE_TYPE_ACK: u8 = 0x02;
const MESSAGE_TYPE_OPEN: u8 = 0x03;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_RELIABLE_UNORDERED: u8 = 0x80;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED: u8 = 0x81;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED: u8 = 0x82;

/// DATA_CHANNEL_OPEN is the message type byte plus an 11-byte fixed part
/// (channel type, priority, reliability parameter, label and protocol
/// lengths) before the variable-length label and protocol.
const CHANNEL_OPEN_HEADER_LENGTH: usize = 12;

pub const CHANNEL_PRIORITY_BELOW_NORMAL: u16 = 128;
pub const CHANNEL_PRIORITY_NORMAL: u16 = 256;
pub const CHANNEL_PRIORITY_HIGH: u16 = 512;
pub const CHANNEL_PRIORITY_EXTRA_HIGH: u16 = 1024;

/// Channel type carried in DATA_CHANNEL_OPEN. The high bit selects
/// unordered delivery; the low bits select the reliability mode.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelType {
    #[default]
    Reliable,
    ReliableUnordered,
    PartialReliableRexmit,
    PartialReliableRexmitUnordered,
    PartialReliableTimed,
    PartialReliableTimedUnordered,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelType::Reliable => "Reliable",
            ChannelType::ReliableUnordered => "ReliableUnordered",
            ChannelType::PartialReliableRexmit => "PartialReliableRexmit",
            ChannelType::PartialReliableRexmitUnordered => "PartialReliableRexmitUnordered",
            ChannelType::PartialReliableTimed => "PartialReliableTimed",
            ChannelType::PartialReliableTimedUnordered => "PartialReliableTimedUnordered",
        };
        write!(f, "{s}")
    }
}

impl ChannelType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            CHANNEL_TYPE_RELIABLE => Ok(ChannelType::Reliable),
            CHANNEL_TYPE_RELIABLE_UNORDERED => Ok(ChannelType::ReliableUnordered),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => Ok(ChannelType::PartialReliableRexmit),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED => {
                Ok(ChannelType::PartialReliableRexmitUnordered)
            }
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => Ok(ChannelType::PartialReliableTimed),
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED => {
                Ok(ChannelType::PartialReliableTimedUnordered)
            }
            _ => Err(Error::ErrDcepUnknownChannelType),
        }
    }

    fn byte(&self) -> u8 {
        match self {
            ChannelType::Reliable => CHANNEL_TYPE_RELIABLE,
            ChannelType::ReliableUnordered => CHANNEL_TYPE_RELIABLE_UNORDERED,
            ChannelType::PartialReliableRexmit => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            ChannelType::PartialReliableRexmitUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED
            }
            ChannelType::PartialReliableTimed => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
            ChannelType::PartialReliableTimedUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED
            }
        }
    }

    pub fn unordered(&self) -> bool {
        self.byte() & 0x80 != 0
    }

    pub fn reliability(&self) -> ReliabilityType {
        match self.byte() & 0x7f {
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => ReliabilityType::Rexmit,
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => ReliabilityType::Timed,
            _ => ReliabilityType::Reliable,
        }
    }
}

/// DATA_CHANNEL_OPEN message body.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Type (0x03)  |  Channel Type |            Priority           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Reliability Parameter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Label Length          |       Protocol Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Label .. Protocol ..                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: Bytes,
    pub protocol: Bytes,
}

/// A parsed DCEP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcepMessage {
    Open(DataChannelOpen),
    Ack,
}

impl fmt::Display for DcepMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcepMessage::Open(open) => write!(
                f,
                "DATA_CHANNEL_OPEN type={} label={}",
                open.channel_type,
                String::from_utf8_lossy(&open.label)
            ),
            DcepMessage::Ack => write!(f, "DATA_CHANNEL_ACK"),
        }
    }
}

impl DcepMessage {
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::ErrDcepTooShort);
        }

        match raw[0] {
            MESSAGE_TYPE_ACK => Ok(DcepMessage::Ack),
            MESSAGE_TYPE_OPEN => {
                if raw.len() < CHANNEL_OPEN_HEADER_LENGTH {
                    return Err(Error::ErrDcepTooShort);
                }

                let reader = &mut raw.slice(1..);
                let channel_type = ChannelType::from_byte(reader.get_u8())?;
                let priority = reader.get_u16();
                let reliability_parameter = reader.get_u32();
                let label_length = reader.get_u16() as usize;
                let protocol_length = reader.get_u16() as usize;

                if reader.remaining() < label_length + protocol_length {
                    return Err(Error::ErrDcepTooShort);
                }
                let label = reader.copy_to_bytes(label_length);
                let protocol = reader.copy_to_bytes(protocol_length);

                Ok(DcepMessage::Open(DataChannelOpen {
                    channel_type,
                    priority,
                    reliability_parameter,
                    label,
                    protocol,
                }))
            }
            _ => Err(Error::ErrDcepUnknownMessageType),
        }
    }

    pub fn marshal(&self) -> Bytes {
        match self {
            DcepMessage::Ack => Bytes::from_static(&[MESSAGE_TYPE_ACK]),
            DcepMessage::Open(open) => {
                let mut writer = BytesMut::with_capacity(
                    CHANNEL_OPEN_HEADER_LENGTH + open.label.len() + open.protocol.len(),
                );
                writer.put_u8(MESSAGE_TYPE_OPEN);
                writer.put_u8(open.channel_type.byte());
                writer.put_u16(open.priority);
                writer.put_u32(open.reliability_parameter);
                writer.put_u16(open.label.len() as u16);
                writer.put_u16(open.protocol.len() as u16);
                writer.extend_from_slice(&open.label);
                writer.extend_from_slice(&open.protocol);
                writer.freeze()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static CHANNEL_OPEN_BYTES: [u8; 25] = [
        0x03, // message type
        0x00, // channel type
        0x0f, 0x35, // priority
        0x00, 0xff, 0x0f, 0x35, // reliability parameter
        0x00, 0x05, // label length
        0x00, 0x08, // protocol length
        0x6c, 0x61, 0x62, 0x65, 0x6c, // "label"
        0x70, 0x72, 0x6f, 0x74, 0x6f, 0x63, 0x6f, 0x6c, // "protocol"
    ];

    #[test]
    fn test_channel_open_unmarshal() -> Result<()> {
        let msg = DcepMessage::unmarshal(&Bytes::from_static(&CHANNEL_OPEN_BYTES))?;
        let open = match msg {
            DcepMessage::Open(open) => open,
            other => panic!("unexpected message {other:?}"),
        };
        assert_eq!(open.channel_type, ChannelType::Reliable);
        assert_eq!(open.priority, 3893);
        assert_eq!(open.reliability_parameter, 16715573);
        assert_eq!(&open.label[..], b"label");
        assert_eq!(&open.protocol[..], b"protocol");
        Ok(())
    }

    #[test]
    fn test_channel_open_marshal_round_trip() -> Result<()> {
        let open = DataChannelOpen {
            channel_type: ChannelType::Reliable,
            priority: 3893,
            reliability_parameter: 16715573,
            label: Bytes::from_static(b"label"),
            protocol: Bytes::from_static(b"protocol"),
        };
        let raw = DcepMessage::Open(open.clone()).marshal();
        assert_eq!(&raw[..], &CHANNEL_OPEN_BYTES);
        assert_eq!(DcepMessage::unmarshal(&raw)?, DcepMessage::Open(open));
        Ok(())
    }

    #[test]
    fn test_ack_round_trip() -> Result<()> {
        let raw = DcepMessage::Ack.marshal();
        assert_eq!(&raw[..], &[0x02]);
        assert_eq!(DcepMessage::unmarshal(&raw)?, DcepMessage::Ack);
        Ok(())
    }

    #[test]
    fn test_unmarshal_rejects_bad_input() {
        assert!(matches!(
            DcepMessage::unmarshal(&Bytes::new()),
            Err(Error::ErrDcepTooShort)
        ));
        assert!(matches!(
            DcepMessage::unmarshal(&Bytes::from_static(&[0x01])),
            Err(Error::ErrDcepUnknownMessageType)
        ));
        // unknown channel type byte
        let mut bad = CHANNEL_OPEN_BYTES;
        bad[1] = 0x11;
        assert!(matches!(
            DcepMessage::unmarshal(&Bytes::copy_from_slice(&bad)),
            Err(Error::ErrDcepUnknownChannelType)
        ));
        // label length runs past the buffer
        let truncated = Bytes::from_static(&CHANNEL_OPEN_BYTES[..14]);
        assert!(matches!(
            DcepMessage::unmarshal(&truncated),
            Err(Error::ErrDcepTooShort)
        ));
    }

    #[test]
    fn test_unmarshal_rejects_truncated_open_fixed_part() {
        // every prefix shorter than the 12-byte fixed part must error out,
        // including 11 bytes where only the protocol length is missing
        for n in 1..CHANNEL_OPEN_HEADER_LENGTH {
            let truncated = Bytes::copy_from_slice(&CHANNEL_OPEN_BYTES[..n]);
            assert!(
                matches!(
                    DcepMessage::unmarshal(&truncated),
                    Err(Error::ErrDcepTooShort)
                ),
                "{n}-byte DATA_CHANNEL_OPEN must be rejected"
            );
        }
    }

    #[test]
    fn test_channel_type_reliability_mapping() {
        assert!(!ChannelType::Reliable.unordered());
        assert!(ChannelType::ReliableUnordered.unordered());
        assert!(ChannelType::PartialReliableTimedUnordered.unordered());
        assert_eq!(
            ChannelType::Reliable.reliability(),
            ReliabilityType::Reliable
        );
        assert_eq!(
            ChannelType::PartialReliableRexmitUnordered.reliability(),
            ReliabilityType::Rexmit
        );
        assert_eq!(
            ChannelType::PartialReliableTimed.reliability(),
            ReliabilityType::Timed
        );
    }
}
