use std::fmt::{Debug, Formatter};
use std::ops::BitOr;

use bytes::{Buf, BufMut, BytesMut};

/// Bit field in a packet header. Flags combine freely on the wire (`SYN|ACK`,
///  `FIN|ACK`, ...); bits this implementation does not know are kept as-is
///  and ignored on receive.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// connection requested
    pub const SYN: PacketFlags = PacketFlags(1);
    /// acknowledges the reliable packet with the header's batch number
    pub const ACK: PacketFlags = PacketFlags(2);
    /// no more messages, close the session
    pub const FIN: PacketFlags = PacketFlags(4);
    /// keepalive, no payload
    pub const KEP: PacketFlags = PacketFlags(8);
    /// reliable packet: retained, re-sent and acknowledged
    pub const REL: PacketFlags = PacketFlags(16);
    /// local wakeup sentinel - never sent to a peer, rejected if received
    pub const CANCEL: PacketFlags = PacketFlags(1 << 31);

    pub const NONE: PacketFlags = PacketFlags(0);

    pub fn from_bits(bits: u32) -> PacketFlags {
        PacketFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl Debug for PacketFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }

        let mut remaining = self.0;
        let mut first = true;
        for (bit, name) in [
            (PacketFlags::SYN, "SYN"),
            (PacketFlags::ACK, "ACK"),
            (PacketFlags::FIN, "FIN"),
            (PacketFlags::KEP, "KEP"),
            (PacketFlags::REL, "REL"),
            (PacketFlags::CANCEL, "CANCEL"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
                remaining &= !bit.0;
            }
        }
        if remaining != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{:#x}", remaining)?;
        }
        Ok(())
    }
}

/// The fixed header in front of every datagram's payload - all numbers in
///  network byte order (BE):
/// ```ascii
/// 0: sequence number (u32) - incremented for every outgoing datagram,
///     including acks and keepalives
/// 4: batch number (u32) - incremented only when a reliable data packet is
///     sent; defines delivery order. For an ACK, the batch number being
///     acknowledged.
/// 8: flags (u32)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq: u32,
    pub batch: u32,
    pub flags: PacketFlags,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<u32>();

    pub fn new(seq: u32, batch: u32, flags: PacketFlags) -> PacketHeader {
        PacketHeader { seq, batch, flags }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u32(self.batch);
        buf.put_u32(self.flags.bits());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let seq = buf.try_get_u32()?;
        let batch = buf.try_get_u32()?;
        let flags = PacketFlags::from_bits(buf.try_get_u32()?);
        Ok(PacketHeader { seq, batch, flags })
    }
}
