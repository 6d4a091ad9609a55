//! SCTP (RFC 4960) transport core for WebRTC data channels.
//!
//! This crate implements the protocol engine that multiplexes reliable,
//! optionally ordered message streams over an unreliable datagram
//! transport: the binary chunk/parameter codec, the association state
//! machine (four-way handshake, acknowledgment and retransmission,
//! RFC 6525 stream reconfiguration) and the concurrency shell around it.
//!
//! An [`Association`] owns one transport connection. Inbound streams and
//! state transitions are reported through an [`AssociationListener`];
//! messages arriving on a stream are delivered to its [`StreamListener`]
//! in order. Data channels negotiated with DCEP are announced with their
//! label once the DATA_CHANNEL_OPEN message has been parsed.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod association;
mod chunk;
pub mod dcep;
mod error;
mod error_cause;
mod packet;
mod param;
mod queue;
pub mod stream;
mod timer;
mod util;

pub use crate::association::{Association, AssociationListener, Config};
pub use crate::chunk::chunk_data::PayloadProtocolIdentifier;
pub use crate::dcep::ChannelType;
pub use crate::error::{Error, Result};
pub use crate::stream::{Message, ReliabilityType, Stream, StreamListener};
