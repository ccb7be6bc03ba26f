//! First-byte frame tags.
//!
//! The first byte of every inbound connection (and of every sub-stream of a
//! v2 multiplexed session) selects the sub-protocol. The byte values are
//! on-wire contract; renumbering them requires version negotiation with
//! every peer, client, and agent in the fleet.

/// Sub-protocol selector read as the first byte of a connection or
/// sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// Request-reply RPC session.
    Rpc = 0x01,
    /// Hand the connection to the consensus transport.
    Raft = 0x02,
    /// Multiplexing session, v1: sub-streams carry request-reply RPC only.
    MuxV1 = 0x03,
    /// Upgrade the connection to TLS, then read the frame byte again.
    Tls = 0x04,
    /// Streaming RPC.
    Streaming = 0x05,
    /// Multiplexing session, v2: sub-streams choose between request-reply
    /// and streaming RPC.
    MuxV2 = 0x06,
}

impl FrameTag {
    /// Interpret a wire byte, `None` for bytes outside the alphabet.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Rpc),
            0x02 => Some(Self::Raft),
            0x03 => Some(Self::MuxV1),
            0x04 => Some(Self::Tls),
            0x05 => Some(Self::Streaming),
            0x06 => Some(Self::MuxV2),
            _ => None,
        }
    }

    /// The wire byte for this tag.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_wire_stable() {
        assert_eq!(FrameTag::Rpc.byte(), 0x01);
        assert_eq!(FrameTag::Raft.byte(), 0x02);
        assert_eq!(FrameTag::MuxV1.byte(), 0x03);
        assert_eq!(FrameTag::Tls.byte(), 0x04);
        assert_eq!(FrameTag::Streaming.byte(), 0x05);
        assert_eq!(FrameTag::MuxV2.byte(), 0x06);
    }

    #[test]
    fn round_trips_and_rejects() {
        for byte in 0x01..=0x06 {
            assert_eq!(FrameTag::from_byte(byte).unwrap().byte(), byte);
        }
        assert_eq!(FrameTag::from_byte(0x00), None);
        assert_eq!(FrameTag::from_byte(0x07), None);
        assert_eq!(FrameTag::from_byte(0xff), None);
    }
}
