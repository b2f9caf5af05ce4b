//! Wire format of a SUFT frame.
//!
//! ```text
//! offset 0:   6 bytes magic
//! offset 6:   2 bytes big-endian length of everything after the id pair
//! offset 8:   4 bytes big-endian remote id (the recipient's local id)
//! offset 12:  4 bytes big-endian local id (the sender's local id)
//! offset 16:  4 bytes big-endian seq
//! offset 20:  4 bytes big-endian ack
//! offset 24:  1 byte flags
//! offset 25:  1 byte send-attempt count
//! offset 26:  payload, at most MSS bytes
//! ```
//!
//! The 26 bytes of overhead fit a 1472-byte UDP payload budget, which puts
//! the maximum segment size at 1438 bytes.

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;

pub const MAGIC: [u8; 6] = *b"\xa9SUF\x01\x9a";

pub const MAGIC_SIZE: usize = 6;
/// Transport header: magic, length and the connection-id pair.
pub const TH_SIZE: usize = MAGIC_SIZE + 10;
/// Connection header: seq, ack, flags and send count.
pub const CH_SIZE: usize = 10;
/// Full header overhead of a frame.
pub const AH_SIZE: usize = TH_SIZE + CH_SIZE;

/// Maximum payload bytes per frame: 1500 MTU - 20 IP - 8 UDP - 26 SUFT,
/// minus 8 bytes of PPPoE headroom.
pub const MSS: usize = 1438;

/// The seq used when acknowledging a FIN. Never a data seq.
pub const FIN_ACK_SEQ: u32 = 0xFFFF_0000;
/// Reserved connection id / seq that never appears as a valid value.
pub const INVALID_SEQ: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NIL: Flags = Flags(0);
    pub const SYN: Flags = Flags(1);
    pub const ACK: Flags = Flags(1 << 1);
    pub const SACK: Flags = Flags(1 << 2);
    pub const TIME: Flags = Flags(1 << 3);
    pub const DATA: Flags = Flags(1 << 4);
    pub const RESET: Flags = Flags(1 << 6);
    pub const FIN: Flags = Flags(1 << 7);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 7] = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::SACK, "SACK"),
            (Flags::TIME, "TIME"),
            (Flags::DATA, "DATA"),
            (Flags::RESET, "RESET"),
            (Flags::FIN, "FIN"),
        ];

        if self.0 == 0 {
            return write!(f, "NOOP");
        }

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }

        Ok(())
    }
}

/// The id pair stamped on every frame, from the local side's point of view:
/// `lid` is the id we assigned and expect the peer to echo, `rid` is the id
/// the peer assigned. `rid == 0` means the peer has not told us yet (SYN).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnId {
    pub lid: u32,
    pub rid: u32,
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub scnt: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn control(seq: u32, ack: u32, flags: Flags) -> Packet {
        Packet {
            seq,
            ack,
            flags,
            scnt: 0,
            payload: Bytes::new(),
        }
    }

    /// Serialise into a full frame addressed with `id`.
    ///
    /// The recipient looks itself up by the first id on the wire, so our
    /// `rid` goes first and our `lid` second.
    pub fn encode(&self, id: ConnId) -> Vec<u8> {
        let mut buf = vec![0u8; AH_SIZE + self.payload.len()];

        buf[..MAGIC_SIZE].copy_from_slice(&MAGIC);
        let len = (CH_SIZE + self.payload.len()) as u16;
        buf[6..8].copy_from_slice(&len.to_be_bytes());
        buf[8..12].copy_from_slice(&id.rid.to_be_bytes());
        buf[12..16].copy_from_slice(&id.lid.to_be_bytes());
        buf[16..20].copy_from_slice(&self.seq.to_be_bytes());
        buf[20..24].copy_from_slice(&self.ack.to_be_bytes());
        buf[24] = self.flags.bits();
        buf[25] = self.scnt;
        buf[AH_SIZE..].copy_from_slice(&self.payload);

        buf
    }

    /// Deserialise the connection header and payload, i.e. everything after
    /// the transport header of a validated frame.
    pub fn decode(body: &[u8]) -> Packet {
        debug_assert!(body.len() >= CH_SIZE);

        Packet {
            seq: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            ack: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            flags: Flags::from_bits(body[8]),
            scnt: body[9],
            payload: Bytes::copy_from_slice(&body[CH_SIZE..]),
        }
    }
}

/// Validate a datagram and extract the id pair, seen from the receiver:
/// `lid` is the id the frame is addressed to, `rid` is the sender's id.
///
/// Returns `None` for anything that must be silently dropped: short
/// datagrams, magic mismatches and length mismatches.
pub fn parse_frame(datagram: &[u8]) -> Option<ConnId> {
    if datagram.len() < AH_SIZE {
        return None;
    }

    if datagram[..MAGIC_SIZE] != MAGIC {
        return None;
    }

    let declared = u16::from_be_bytes([datagram[6], datagram[7]]) as usize;
    if declared != datagram.len() - TH_SIZE {
        return None;
    }

    Some(ConnId {
        lid: u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
        rid: u32::from_be_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet {
            seq: 42,
            ack: 17,
            flags: Flags::DATA,
            scnt: 1,
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn frame_carries_both_ids() {
        let frame = sample().encode(ConnId { lid: 7, rid: 9 });

        let id = parse_frame(&frame).unwrap();

        // The receiver reads the pair from its own perspective.
        assert_eq!(id.lid, 9);
        assert_eq!(id.rid, 7);
    }

    #[test]
    fn header_fields_survive_encoding() {
        let frame = sample().encode(ConnId { lid: 1, rid: 2 });

        let pk = Packet::decode(&frame[TH_SIZE..]);

        assert_eq!(pk.seq, 42);
        assert_eq!(pk.ack, 17);
        assert_eq!(pk.flags, Flags::DATA);
        assert_eq!(pk.scnt, 1);
        assert_eq!(&pk.payload[..], b"hello");
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(parse_frame(&[0u8; AH_SIZE - 1]).is_none());
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let mut frame = sample().encode(ConnId { lid: 1, rid: 2 });
        frame[0] ^= 0xff;

        assert!(parse_frame(&frame).is_none());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut frame = sample().encode(ConnId { lid: 1, rid: 2 });
        frame[7] ^= 0x01;

        assert!(parse_frame(&frame).is_none());
    }

    #[test]
    fn flags_render_combined_names() {
        assert_eq!(format!("{:?}", Flags::SYN | Flags::ACK), "SYN+ACK");
        assert_eq!(format!("{:?}", Flags::NIL), "NOOP");
    }
}
