use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::events::{next_event, IoEvent};
use crate::packet::Packet;
use crate::packet_header::{PacketFlags, PacketHeader};
use crate::retransmit::RetransmitTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Disconnected,
    Connected,
    /// FIN sent, waiting for the peer's close confirmation
    Closing,
}

/// What processing one incoming datagram or timer event asks the caller to
///  do. The session never touches the socket itself: the lock around it can
///  be released before these frames go out.
#[derive(Default)]
pub(crate) struct Dispatch {
    /// finished datagrams to transmit to the session peer, in order
    pub frames: Vec<Bytes>,
    /// a slot was committed - wake blocked `receive` calls
    pub delivered: bool,
    /// the session ended - wake everything
    pub closed: bool,
}

/// Per-session protocol state: the connection state machine, both counter
///  sets, the retransmission table and the delivery queue.
///
/// All methods are synchronous and run under the engine's one lock. Frame
///  composition assigns `seq` (every datagram) and `batch` (reliable
///  datagrams only) and registers reliable frames for retransmission, so a
///  composed frame is complete the moment the lock is dropped.
pub(crate) struct Session {
    config: Arc<LinkConfig>,
    pub state: SessionState,
    pub remote_addr: Option<SocketAddr>,
    /// a session existed and ended - distinguishes *peer-closed* from
    ///  *not-connected* for late `receive` calls draining the queue
    pub session_ended: bool,

    local_seq: u32,
    local_batch: u32,
    /// highest sequence number observed from the peer
    remote_seq: u32,
    /// highest reliable batch committed in order, i.e. with no hole below it
    remote_batch: u32,
    /// highest reliable batch with a slot reserved or committed
    remote_batch_reserved: u32,

    pub retransmit: RetransmitTable,
    pub delivery: DeliveryQueue,

    pub time_last_send: Instant,
    pub time_last_received: Instant,
}

impl Session {
    pub fn new(config: Arc<LinkConfig>) -> Session {
        let now = Instant::now();
        Session {
            config,
            state: SessionState::Disconnected,
            remote_addr: None,
            session_ended: false,
            local_seq: 0,
            local_batch: 0,
            remote_seq: 0,
            remote_batch: 0,
            remote_batch_reserved: 0,
            retransmit: RetransmitTable::new(),
            delivery: DeliveryQueue::new(),
            time_last_send: now,
            time_last_received: now,
        }
    }

    /// Reset everything for a fresh session with `remote`. Unlike
    ///  [`Session::teardown`] this also discards undrained deliveries of the
    ///  previous session.
    fn begin_session(&mut self, remote: SocketAddr, now: Instant) {
        self.state = SessionState::Disconnected;
        self.remote_addr = Some(remote);
        self.session_ended = false;
        self.local_seq = 0;
        self.local_batch = 0;
        self.remote_seq = 0;
        self.remote_batch = 0;
        self.remote_batch_reserved = 0;
        self.retransmit.clear();
        self.delivery.clear();
        self.time_last_send = now;
        self.time_last_received = now;
    }

    /// End the session: flush undeliverable queue slots, forget pending
    ///  retransmissions, go to DISCONNECTED.
    ///
    /// Committed slots in front of the first hole stay poppable - the caller
    ///  may still drain what was already in order when the session died.
    pub fn teardown(&mut self, reason: &str) {
        debug!("session with {:?} ends: {}", self.remote_addr, reason);

        while let Some(batch) = self.delivery.smallest_reserved_batch() {
            self.delivery.drop_reservation(batch);
        }
        self.retransmit.clear();
        self.state = SessionState::Disconnected;
        self.remote_addr = None;
        self.session_ended = true;
    }

    /// Assign counters, serialize, and (for reliable frames) register for
    ///  retransmission. `batch` is the explicit batch field value for
    ///  non-reliable frames (the acknowledged batch for acks); reliable
    ///  frames consume the next local batch number instead.
    fn frame(&mut self, flags: PacketFlags, batch: u32, payload: &[u8], now: Instant) -> Bytes {
        let batch = if flags.contains(PacketFlags::REL) {
            let b = self.local_batch;
            self.local_batch = self.local_batch.wrapping_add(1);
            b
        } else {
            batch
        };

        let header = PacketHeader::new(self.local_seq, batch, flags);
        self.local_seq = self.local_seq.wrapping_add(1);

        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);
        let bytes = buf.freeze();

        if flags.contains(PacketFlags::REL) {
            self.retransmit.insert(header, bytes.clone(), now);
        }
        self.time_last_send = now;

        trace!("composed {:?} seq {} batch {} ({} payload bytes)", flags, header.seq, batch, payload.len());
        bytes
    }

    // --- connection setup -------------------------------------------------

    /// Active open: reset for a new session and compose the SYN. The caller
    ///  drives the handshake; the SYN sits in the retransmission table until
    ///  the SYN+ACK acknowledges it.
    pub fn start_connect(&mut self, remote: SocketAddr, now: Instant) -> Bytes {
        self.begin_session(remote, now);
        self.frame(PacketFlags::SYN | PacketFlags::REL, 0, &[], now)
    }

    /// The peer accepted: sync counters to its SYN+ACK, acknowledge it, go
    ///  CONNECTED. Returns the ack frame.
    pub fn complete_connect(&mut self, header: PacketHeader, now: Instant) -> Bytes {
        self.time_last_received = now;
        self.remote_seq = header.seq;
        self.retransmit.acknowledge(header.batch);
        self.remote_batch = header.batch;
        self.remote_batch_reserved = header.batch;
        self.state = SessionState::Connected;
        debug!("connected to {:?}", self.remote_addr);

        self.frame(PacketFlags::ACK, header.batch, &[], now)
    }

    /// Passive open: adopt the sender of a SYN as the session peer and
    ///  compose the SYN+ACK, which both accepts and acknowledges (the SYN is
    ///  the first reliable packet of the peer's session, so the shared batch
    ///  field serves both purposes). The SYN+ACK is reliable and re-sent
    ///  until the peer's ack arrives.
    pub fn accept_syn(&mut self, remote: SocketAddr, header: PacketHeader, now: Instant) -> Bytes {
        self.begin_session(remote, now);
        self.time_last_received = now;
        self.remote_seq = header.seq;
        self.remote_batch = header.batch;
        self.remote_batch_reserved = header.batch;
        self.state = SessionState::Connected;
        debug!("accepted connection from {:?}", remote);

        self.frame(PacketFlags::SYN | PacketFlags::ACK | PacketFlags::REL, 0, &[], now)
    }

    // --- data phase -------------------------------------------------------

    pub fn compose_data(&mut self, payload: &[u8], reliable: bool, now: Instant) -> Bytes {
        let flags = if reliable { PacketFlags::REL } else { PacketFlags::NONE };
        self.frame(flags, 0, payload, now)
    }

    pub fn compose_fin(&mut self, now: Instant) -> Bytes {
        self.state = SessionState::Closing;
        debug!("closing session with {:?}", self.remote_addr);
        self.frame(PacketFlags::FIN | PacketFlags::REL, 0, &[], now)
    }

    /// Process one origin-validated datagram from the session peer.
    pub fn process_datagram(&mut self, header: PacketHeader, payload: &[u8], now: Instant) -> Dispatch {
        let mut out = Dispatch::default();

        if self.state == SessionState::Disconnected {
            trace!("no session, dropping datagram");
            return out;
        }
        if header.flags.contains(PacketFlags::CANCEL) {
            warn!("rejecting datagram carrying the local-only CANCEL flag from {:?}", self.remote_addr);
            return out;
        }

        self.time_last_received = now;
        if header.seq > self.remote_seq {
            self.remote_seq = header.seq;
        }

        if header.flags.contains(PacketFlags::ACK) {
            if self.retransmit.acknowledge(header.batch) {
                trace!("batch {} acknowledged", header.batch);
            } else {
                trace!("ack for batch {} without pending packet - late or duplicate", header.batch);
            }
        }

        if header.flags.contains(PacketFlags::KEP) {
            trace!("keepalive from {:?}", self.remote_addr);
            return out;
        }
        if header.flags.contains(PacketFlags::FIN) {
            self.handle_fin(header, &mut out, now);
            return out;
        }
        if header.flags.contains(PacketFlags::SYN) {
            // handshake duplicate: our ack got lost or overtaken
            if header.flags.contains(PacketFlags::REL) {
                debug!("re-acknowledging handshake duplicate from {:?}", self.remote_addr);
                let ack = self.frame(PacketFlags::ACK, header.batch, &[], now);
                out.frames.push(ack);
            }
            return out;
        }
        if header.flags.contains(PacketFlags::REL) {
            self.handle_reliable(header, payload, &mut out, now);
            return out;
        }
        if header.flags.contains(PacketFlags::ACK) {
            // pure ack, fully handled above
            return out;
        }

        // best-effort data: committed immediately, bypassing reservations
        trace!("best-effort delivery of {} bytes", payload.len());
        self.delivery.push_committed(Packet::from_slice(payload, false));
        out.delivered = true;
        out
    }

    /// Reliable data dispatch: every case answers with an ack, exactly one
    ///  case commits a new slot.
    fn handle_reliable(&mut self, header: PacketHeader, payload: &[u8], out: &mut Dispatch, now: Instant) {
        let batch = header.batch;

        if batch <= self.remote_batch {
            debug!("batch {} already delivered - duplicate", batch);
        } else if self.delivery.is_reserved(batch) {
            trace!("batch {} fills its reserved slot", batch);
            if let Err(e) = self.delivery.commit_reserved(batch, Packet::from_slice(payload, true)) {
                warn!("reservation for batch {} vanished: {}", batch, e);
            }
            self.remote_batch = self
                .delivery
                .smallest_reserved_batch()
                .map(|b| b - 1)
                .unwrap_or(self.remote_batch_reserved);
            out.delivered = true;
        } else if batch <= self.remote_batch_reserved {
            debug!("batch {} already committed but not yet delivered - duplicate", batch);
        } else if batch == self.remote_batch.wrapping_add(1) {
            // in order, no holes outstanding
            debug_assert_eq!(self.remote_batch, self.remote_batch_reserved);
            trace!("batch {} committed in order", batch);
            self.delivery.push_committed(Packet::from_slice(payload, true));
            self.remote_batch = batch;
            self.remote_batch_reserved = batch;
            out.delivered = true;
        } else {
            // the peer is ahead of us: reserve the gap, commit this one behind it
            debug!(
                "batch {} arrived before {}..{} - reserving",
                batch,
                self.remote_batch_reserved + 1,
                batch
            );
            for missing in (self.remote_batch_reserved + 1)..batch {
                self.delivery.reserve(missing, now);
            }
            self.delivery.push_committed(Packet::from_slice(payload, true));
            self.remote_batch_reserved = batch;
        }

        let ack = self.frame(PacketFlags::ACK, batch, &[], now);
        out.frames.push(ack);
    }

    fn handle_fin(&mut self, header: PacketHeader, out: &mut Dispatch, now: Instant) {
        match self.state {
            SessionState::Connected => {
                // peer-initiated close: confirm and stop
                debug!("peer {:?} closes the connection", self.remote_addr);
                let reply = self.frame(PacketFlags::FIN | PacketFlags::ACK, header.batch, &[], now);
                out.frames.push(reply);
                self.teardown("closed by peer");
                out.closed = true;
            }
            SessionState::Closing => {
                // either the peer's FIN+ACK reply, or its own FIN in a
                //  simultaneous close - the latter still wants an ack
                if header.flags.contains(PacketFlags::REL) && !header.flags.contains(PacketFlags::ACK) {
                    let ack = self.frame(PacketFlags::ACK, header.batch, &[], now);
                    out.frames.push(ack);
                }
                self.teardown("close confirmed");
                out.closed = true;
            }
            SessionState::Disconnected => {}
        }
    }

    // --- timers -----------------------------------------------------------

    pub fn on_timer(&mut self, event: IoEvent, now: Instant) -> Dispatch {
        let mut out = Dispatch::default();
        if self.state == SessionState::Disconnected {
            // torn down between scheduling and firing
            return out;
        }
        match event {
            IoEvent::AckResend(batch) => {
                if let Some(bytes) = self.retransmit.mark_resent(batch, now) {
                    debug!("re-sending unacknowledged batch {}", batch);
                    self.time_last_send = now;
                    out.frames.push(bytes);
                }
            }
            IoEvent::AckTimeout => {
                warn!("reliable packet unacknowledged past the total timeout");
                self.teardown("ack timeout");
                out.closed = true;
            }
            IoEvent::Keepalive => {
                trace!("idle - emitting keepalive");
                let kep = self.frame(PacketFlags::KEP, 0, &[], now);
                out.frames.push(kep);
            }
            IoEvent::RecvTimeout => {
                warn!("nothing received past the total timeout - peer is gone");
                self.teardown("receive timeout");
                out.closed = true;
            }
            IoEvent::ReserveTimeout => {
                warn!("delivery hole unfilled past the total timeout");
                self.teardown("reservation timeout");
                out.closed = true;
            }
            IoEvent::Reloop => {}
        }
        out
    }

    pub fn next_event(&self, now: Instant) -> (IoEvent, Instant) {
        next_event(
            &self.retransmit,
            &self.delivery,
            self.time_last_send,
            self.time_last_received,
            &self.config,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn session() -> Session {
        Session::new(Arc::new(LinkConfig::default()))
    }

    /// a connected pair with counters synced through the real handshake frames
    fn connected_pair() -> (Session, Session) {
        let now = Instant::now();
        let mut connector = session();
        let mut acceptor = session();

        let syn = connector.start_connect(addr(2), now);
        let syn_header = PacketHeader::deser(&mut &syn[..]).unwrap();

        let syn_ack = acceptor.accept_syn(addr(1), syn_header, now);
        let syn_ack_header = PacketHeader::deser(&mut &syn_ack[..]).unwrap();

        let ack = connector.complete_connect(syn_ack_header, now);
        let ack_header = PacketHeader::deser(&mut &ack[..]).unwrap();
        acceptor.process_datagram(ack_header, &[], now);

        (connector, acceptor)
    }

    fn parse(frame: &Bytes) -> (PacketHeader, Vec<u8>) {
        let mut buf: &[u8] = frame;
        let header = PacketHeader::deser(&mut buf).unwrap();
        (header, buf.to_vec())
    }

    #[test]
    fn test_connect_handshake_frames() {
        let now = Instant::now();
        let mut connector = session();

        let syn = connector.start_connect(addr(2), now);
        let (syn_header, payload) = parse(&syn);
        assert_eq!(syn_header, PacketHeader::new(0, 0, PacketFlags::SYN | PacketFlags::REL));
        assert!(payload.is_empty());
        assert_eq!(connector.retransmit.len(), 1);
        assert_eq!(connector.state, SessionState::Disconnected);

        let ack = connector.complete_connect(PacketHeader::new(0, 0, PacketFlags::SYN | PacketFlags::ACK | PacketFlags::REL), now);
        let (ack_header, _) = parse(&ack);
        assert_eq!(ack_header.flags, PacketFlags::ACK);
        assert_eq!(ack_header.batch, 0);
        assert_eq!(connector.state, SessionState::Connected);
        assert!(connector.retransmit.is_empty(), "SYN+ACK acknowledges the SYN");
    }

    #[test]
    fn test_accept_handshake_frames() {
        let now = Instant::now();
        let mut acceptor = session();

        let syn_ack = acceptor.accept_syn(addr(1), PacketHeader::new(0, 0, PacketFlags::SYN | PacketFlags::REL), now);
        let (header, _) = parse(&syn_ack);
        assert_eq!(header.flags, PacketFlags::SYN | PacketFlags::ACK | PacketFlags::REL);
        assert_eq!(acceptor.state, SessionState::Connected);
        assert_eq!(acceptor.remote_addr, Some(addr(1)));
        assert_eq!(acceptor.retransmit.len(), 1, "SYN+ACK awaits the peer's ack");
    }

    #[test]
    fn test_every_frame_increments_seq() {
        let now = Instant::now();
        let (mut connector, _) = connected_pair();

        let keepalive = connector.on_timer(IoEvent::Keepalive, now).frames.pop().unwrap();

        let seqs: Vec<u32> = [
            connector.compose_data(b"a", true, now),
            connector.compose_data(b"b", false, now),
            keepalive,
            connector.compose_data(b"c", true, now),
        ]
        .iter()
        .map(|f| parse(f).0.seq)
        .collect();

        assert_eq!(seqs, vec![3, 4, 2, 5], "every frame consumes a sequence number");
    }

    #[test]
    fn test_reliable_batch_numbers_increase_only_for_reliable() {
        let now = Instant::now();
        let (mut connector, _) = connected_pair();

        let (h1, _) = parse(&connector.compose_data(b"a", true, now));
        let (h2, _) = parse(&connector.compose_data(b"x", false, now));
        let (h3, _) = parse(&connector.compose_data(b"b", true, now));

        assert_eq!(h1.batch, 1, "batch 0 went to the SYN");
        assert!(h2.flags.is_empty());
        assert_eq!(h3.batch, 2);
    }

    #[test]
    fn test_in_order_reliable_delivery() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        let out = acceptor.process_datagram(PacketHeader::new(10, 1, PacketFlags::REL), b"ping", now);
        assert!(out.delivered);
        assert_eq!(out.frames.len(), 1);
        let (ack, _) = parse(&out.frames[0]);
        assert_eq!(ack.flags, PacketFlags::ACK);
        assert_eq!(ack.batch, 1);

        let delivered = acceptor.delivery.pop_committed().unwrap();
        assert_eq!(delivered.data(), b"ping");
        assert!(delivered.is_reliable());
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent_but_acked() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        for _ in 0..3 {
            let out = acceptor.process_datagram(PacketHeader::new(10, 1, PacketFlags::REL), b"ping", now);
            let (ack, _) = parse(&out.frames[0]);
            assert_eq!(ack.flags, PacketFlags::ACK);
            assert_eq!(ack.batch, 1);
        }

        assert!(acceptor.delivery.pop_committed().is_some());
        assert!(acceptor.delivery.pop_committed().is_none(), "three sends, one delivery");
    }

    #[test]
    fn test_out_of_order_batches_fill_reservations() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        // batch 3 first: holes for 1 and 2
        let out = acceptor.process_datagram(PacketHeader::new(10, 3, PacketFlags::REL), b"three", now);
        assert!(!out.delivered);
        assert!(acceptor.delivery.pop_committed().is_none(), "head is a hole");

        // batch 1 fills the head hole
        acceptor.process_datagram(PacketHeader::new(11, 1, PacketFlags::REL), b"one", now);
        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"one");
        assert!(acceptor.delivery.pop_committed().is_none(), "batch 2 still missing");

        // batch 2 completes the sequence
        acceptor.process_datagram(PacketHeader::new(12, 2, PacketFlags::REL), b"two", now);
        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"two");
        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"three");
    }

    #[test]
    fn test_duplicate_of_committed_undelivered_batch() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        acceptor.process_datagram(PacketHeader::new(10, 3, PacketFlags::REL), b"three", now);
        let out = acceptor.process_datagram(PacketHeader::new(11, 3, PacketFlags::REL), b"three", now);

        let (ack, _) = parse(&out.frames[0]);
        assert_eq!(ack.batch, 3);
        assert!(!out.delivered);
        assert_eq!(acceptor.delivery.len(), 3, "holes 1+2 plus the single slot for 3");
    }

    #[test]
    fn test_in_order_after_filled_hole() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        acceptor.process_datagram(PacketHeader::new(10, 2, PacketFlags::REL), b"two", now);
        acceptor.process_datagram(PacketHeader::new(11, 1, PacketFlags::REL), b"one", now);

        // with the hole filled, batch 3 is in order again
        let out = acceptor.process_datagram(PacketHeader::new(12, 3, PacketFlags::REL), b"three", now);
        assert!(out.delivered);

        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"one");
        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"two");
        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"three");
    }

    #[test]
    fn test_best_effort_interleaves_in_arrival_order() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        acceptor.process_datagram(PacketHeader::new(10, 1, PacketFlags::REL), b"rel-1", now);
        let out = acceptor.process_datagram(PacketHeader::new(11, 0, PacketFlags::NONE), b"loose", now);
        assert!(out.delivered);
        assert!(out.frames.is_empty(), "best-effort traffic is not acknowledged");
        acceptor.process_datagram(PacketHeader::new(12, 2, PacketFlags::REL), b"rel-2", now);

        let order: Vec<Vec<u8>> = std::iter::from_fn(|| acceptor.delivery.pop_committed())
            .map(|p| p.data().to_vec())
            .collect();
        assert_eq!(order, vec![b"rel-1".to_vec(), b"loose".to_vec(), b"rel-2".to_vec()]);
    }

    #[test]
    fn test_best_effort_bypasses_reservations() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        // hole for batch 1, then best-effort data: it must not fill the hole
        acceptor.process_datagram(PacketHeader::new(10, 2, PacketFlags::REL), b"two", now);
        acceptor.process_datagram(PacketHeader::new(11, 1, PacketFlags::NONE), b"loose", now);

        assert!(acceptor.delivery.pop_committed().is_none(), "hole for batch 1 still blocks the head");
        assert!(acceptor.delivery.is_reserved(1));
    }

    #[test]
    fn test_ack_clears_retransmit_entry() {
        let now = Instant::now();
        let (mut connector, _) = connected_pair();

        connector.compose_data(b"data", true, now);
        assert_eq!(connector.retransmit.len(), 1);

        connector.process_datagram(PacketHeader::new(10, 1, PacketFlags::ACK), &[], now);
        assert!(connector.retransmit.is_empty());
    }

    #[test]
    fn test_peer_fin_closes_and_confirms() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        acceptor.process_datagram(PacketHeader::new(10, 1, PacketFlags::REL), b"last", now);
        let out = acceptor.process_datagram(PacketHeader::new(11, 2, PacketFlags::FIN | PacketFlags::REL), &[], now);

        assert!(out.closed);
        let (reply, _) = parse(&out.frames[0]);
        assert_eq!(reply.flags, PacketFlags::FIN | PacketFlags::ACK);
        assert_eq!(reply.batch, 2);
        assert_eq!(acceptor.state, SessionState::Disconnected);

        // deliveries committed before the close remain drainable
        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"last");
    }

    #[test]
    fn test_close_confirmation_completes_disconnect() {
        let now = Instant::now();
        let (mut connector, _) = connected_pair();

        connector.compose_fin(now);
        assert_eq!(connector.state, SessionState::Closing);
        assert_eq!(connector.retransmit.len(), 1);

        let out = connector.process_datagram(PacketHeader::new(10, 1, PacketFlags::FIN | PacketFlags::ACK), &[], now);
        assert!(out.closed);
        assert!(out.frames.is_empty());
        assert_eq!(connector.state, SessionState::Disconnected);
        assert!(connector.retransmit.is_empty());
    }

    #[test]
    fn test_simultaneous_close_acks_the_peer_fin() {
        let now = Instant::now();
        let (mut connector, _) = connected_pair();

        connector.compose_fin(now);
        let out = connector.process_datagram(PacketHeader::new(10, 1, PacketFlags::FIN | PacketFlags::REL), &[], now);

        assert!(out.closed);
        let (ack, _) = parse(&out.frames[0]);
        assert!(ack.flags.contains(PacketFlags::ACK));
        assert_eq!(ack.batch, 1);
    }

    #[test]
    fn test_teardown_keeps_deliverable_prefix() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        acceptor.process_datagram(PacketHeader::new(10, 1, PacketFlags::REL), b"one", now);
        acceptor.process_datagram(PacketHeader::new(11, 3, PacketFlags::REL), b"three", now);

        acceptor.teardown("test");
        assert_eq!(acceptor.state, SessionState::Disconnected);

        assert_eq!(acceptor.delivery.pop_committed().unwrap().data(), b"one");
        assert!(acceptor.delivery.pop_committed().is_none(), "slot behind the hole was flushed");
    }

    #[test]
    fn test_cancel_flag_is_rejected() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();
        let before = acceptor.time_last_received;

        let later = now + std::time::Duration::from_millis(50);
        let out = acceptor.process_datagram(PacketHeader::new(99, 1, PacketFlags::CANCEL | PacketFlags::REL), b"x", later);

        assert!(out.frames.is_empty());
        assert!(!out.delivered);
        assert_eq!(acceptor.time_last_received, before, "rejected datagrams do not count as liveness");
        assert!(acceptor.delivery.is_empty());
    }

    #[test]
    fn test_keepalive_refreshes_liveness_without_delivery() {
        let now = Instant::now();
        let (_, mut acceptor) = connected_pair();

        let later = now + std::time::Duration::from_millis(100);
        let out = acceptor.process_datagram(PacketHeader::new(10, 0, PacketFlags::KEP), &[], later);

        assert!(out.frames.is_empty());
        assert!(!out.delivered);
        assert_eq!(acceptor.time_last_received, later);
        assert!(acceptor.delivery.is_empty());
    }

    #[test]
    fn test_resend_timer_replays_exact_bytes() {
        let now = Instant::now();
        let (mut connector, _) = connected_pair();

        let original = connector.compose_data(b"data", true, now);
        let out = connector.on_timer(IoEvent::AckResend(1), now + std::time::Duration::from_millis(250));

        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0], original);
    }

    #[test]
    fn test_loss_timers_tear_the_session_down() {
        let now = Instant::now();
        for event in [IoEvent::AckTimeout, IoEvent::RecvTimeout, IoEvent::ReserveTimeout] {
            let (mut connector, _) = connected_pair();
            let out = connector.on_timer(event, now);
            assert!(out.closed, "{:?} must end the session", event);
            assert_eq!(connector.state, SessionState::Disconnected);
        }
    }
}
