use std::collections::VecDeque;

use crate::packet::Packet;

/// Control chunks awaiting transmission, already framed into packets.
pub(crate) type ControlQueue = VecDeque<Packet>;
