use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::packet_header::{PacketFlags, PacketHeader};

/// A reliable packet waiting for its ack, kept byte-exact for re-sending.
pub(crate) struct PendingPacket {
    pub header: PacketHeader,
    /// full wire representation (header plus payload) - a resend puts these
    ///  exact bytes back on the socket
    pub bytes: Bytes,
    pub first_send: Instant,
    pub last_resend: Instant,
}

/// The set of recently sent reliable packets, keyed by batch number.
///
/// Entries are inserted when a reliable packet first goes out and removed by
///  a matching ack. The scheduler re-sends the entry that has waited longest
///  and declares the connection lost once any entry's total wait runs out.
///  Acks may arrive in any order.
pub(crate) struct RetransmitTable {
    entries: FxHashMap<u32, PendingPacket>,
}

impl RetransmitTable {
    pub fn new() -> RetransmitTable {
        RetransmitTable {
            entries: FxHashMap::default(),
        }
    }

    pub fn insert(&mut self, header: PacketHeader, bytes: Bytes, now: Instant) {
        debug_assert!(header.flags.contains(PacketFlags::REL));
        self.entries.insert(
            header.batch,
            PendingPacket {
                header,
                bytes,
                first_send: now,
                last_resend: now,
            },
        );
    }

    /// Remove the entry for `batch`. Returns false if there is none (a
    ///  duplicate or late ack - not an error).
    pub fn acknowledge(&mut self, batch: u32) -> bool {
        self.entries.remove(&batch).is_some()
    }

    /// The entry that has gone longest without a (re)send.
    pub fn next_resend(&self) -> Option<(u32, Instant)> {
        self.entries
            .iter()
            .min_by_key(|(_, p)| p.last_resend)
            .map(|(&batch, p)| (batch, p.last_resend))
    }

    /// The earliest first-send time over all entries, for the total timeout.
    pub fn earliest_first_send(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.first_send).min()
    }

    /// Fetch the wire bytes of `batch` for a resend and record the attempt.
    pub fn mark_resent(&mut self, batch: u32, now: Instant) -> Option<Bytes> {
        let pending = self.entries.get_mut(&batch)?;
        pending.last_resend = now;
        Some(pending.bytes.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
