use std::collections::VecDeque;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::packet::Packet;

enum Slot {
    /// holds a deliverable packet
    Committed(Packet),
    /// placeholder for the reliable packet with this batch number
    Reserved(u32),
}

struct Reservation {
    /// position of the reserved slot, counted from the start of the session
    ///  (stable across pops, unlike a `VecDeque` index)
    index: u64,
    created: Instant,
}

/// The delivery queue between the I/O loop and `receive`.
///
/// An ordered sequence of slots, each either *committed* (a packet ready for
///  the caller) or *reserved* (a hole for a reliable packet whose
///  predecessors arrived first). Only the head slot can be popped, and only
///  if it is committed - this is what keeps reliable delivery in batch order
///  while holes exist.
pub(crate) struct DeliveryQueue {
    slots: VecDeque<Slot>,
    /// session-wide index of `slots[0]`
    head_index: u64,
    reservations: FxHashMap<u32, Reservation>,
}

impl DeliveryQueue {
    pub fn new() -> DeliveryQueue {
        DeliveryQueue {
            slots: VecDeque::new(),
            head_index: 0,
            reservations: FxHashMap::default(),
        }
    }

    /// Append a deliverable packet at the tail.
    pub fn push_committed(&mut self, packet: Packet) {
        self.slots.push_back(Slot::Committed(packet));
    }

    /// Append a hole for `batch` at the tail and index it for later commit.
    pub fn reserve(&mut self, batch: u32, now: Instant) {
        let index = self.head_index + self.slots.len() as u64;
        self.slots.push_back(Slot::Reserved(batch));
        self.reservations.insert(batch, Reservation { index, created: now });
    }

    /// Convert the hole for `batch` into a committed slot, keeping its
    ///  position in the queue.
    pub fn commit_reserved(&mut self, batch: u32, packet: Packet) -> anyhow::Result<()> {
        let Some(reservation) = self.reservations.remove(&batch) else {
            bail!("no reservation for batch {}", batch);
        };
        let pos = (reservation.index - self.head_index) as usize;
        debug_assert!(matches!(self.slots[pos], Slot::Reserved(b) if b == batch));
        self.slots[pos] = Slot::Committed(packet);
        Ok(())
    }

    /// Pop the head slot if it is committed.
    pub fn pop_committed(&mut self) -> Option<Packet> {
        match self.slots.front() {
            Some(Slot::Committed(_)) => {
                let Some(Slot::Committed(packet)) = self.slots.pop_front() else {
                    unreachable!()
                };
                self.head_index += 1;
                Some(packet)
            }
            _ => None,
        }
    }

    /// True if the queue has a reservation for `batch` that is not yet
    ///  committed.
    pub fn is_reserved(&self, batch: u32) -> bool {
        self.reservations.contains_key(&batch)
    }

    /// The outstanding reservation created earliest, for the reservation
    ///  timeout.
    pub fn oldest_reservation(&self) -> Option<(u32, Instant)> {
        self.reservations
            .iter()
            .min_by_key(|(_, r)| r.created)
            .map(|(&batch, r)| (batch, r.created))
    }

    /// The smallest batch number still reserved. Everything below it (and
    ///  above the last delivered batch) is committed.
    pub fn smallest_reserved_batch(&self) -> Option<u32> {
        self.reservations.keys().min().copied()
    }

    /// Remove the hole for `batch` together with every slot behind it.
    ///
    /// Committed slots behind the hole cannot be delivered without breaking
    ///  reliable ordering, so they go as well. The deliverable prefix in
    ///  front of the hole stays.
    pub fn drop_reservation(&mut self, batch: u32) -> bool {
        let Some(reservation) = self.reservations.remove(&batch) else {
            return false;
        };
        let pos = (reservation.index - self.head_index) as usize;
        self.slots.truncate(pos);
        let cutoff = reservation.index;
        self.reservations.retain(|_, r| r.index < cutoff);
        true
    }

    pub fn has_reservations(&self) -> bool {
        !self.reservations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.reservations.clear();
        self.head_index = 0;
    }
}
