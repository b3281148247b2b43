//! Inbound RTP parsing and multicast reception.
//!
//! The radio engine emits one RTP packet (RFC 3550) per UDP datagram on the
//! audio and spectrum multicast groups. This module parses the fixed header
//! and routes payloads to sessions by SSRC.
//!
//! ## RTP fixed header (RFC 3550 §5.1)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload is PCM (big-endian signed 16-bit) for audio channels and an
//! array of power values for spectrum channels. The SSRC is the routing key:
//! the manager hands it to the engine at channel creation and the receiver
//! looks it up on every datagram.

pub mod receiver;

pub use receiver::RtpReceiver;

/// Length of the RTP fixed header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// A parsed view of one RTP packet. Borrows the datagram buffer — callers
/// that keep the payload past the next socket read must copy it.
#[derive(Debug, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    /// Marker bit.
    pub marker: bool,
    /// Sequence number, big-endian on the wire.
    pub sequence: u16,
    /// Media clock timestamp.
    pub timestamp: u32,
    /// Synchronization source — the routing key.
    pub ssrc: u32,
    /// Payload after header, CSRC list, extension, and padding.
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse a single RTP packet from a UDP datagram.
    ///
    /// Returns `None` for anything that is not a well-formed version-2
    /// packet: too short, wrong version, or a CSRC list / header extension /
    /// padding count that runs past the end of the datagram. Malformed
    /// traffic on a shared multicast group is expected, so this is a
    /// drop-not-error path.
    pub fn parse(datagram: &'a [u8]) -> Option<Self> {
        if datagram.len() < RTP_HEADER_LEN {
            return None;
        }

        let version = datagram[0] >> 6;
        if version != 2 {
            return None;
        }

        let padding = datagram[0] & 0x20 != 0;
        let extension = datagram[0] & 0x10 != 0;
        let csrc_count = (datagram[0] & 0x0F) as usize;
        let marker = datagram[1] & 0x80 != 0;
        let payload_type = datagram[1] & 0x7F;

        let sequence = u16::from_be_bytes([datagram[2], datagram[3]]);
        let timestamp = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let ssrc = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if offset > datagram.len() {
            return None;
        }

        if extension {
            // Extension header: 16-bit profile id, 16-bit length in words.
            if offset + 4 > datagram.len() {
                return None;
            }
            let words = u16::from_be_bytes([datagram[offset + 2], datagram[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if offset > datagram.len() {
                return None;
            }
        }

        let mut end = datagram.len();
        if padding {
            let pad = *datagram.last()? as usize;
            if pad == 0 || offset + pad > end {
                return None;
            }
            end -= pad;
        }

        Some(RtpPacket {
            payload_type,
            marker,
            sequence,
            timestamp,
            ssrc,
            payload: &datagram[offset..end],
        })
    }
}
