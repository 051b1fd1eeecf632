//! Shared helpers for the integration tests: shortened protocol timeouts and
//! a raw-datagram prober that speaks the wire format directly, standing in
//! for a peer whose behaviour (drops, duplicates, reordering, silence) the
//! test controls exactly.

#![allow(dead_code)] // each test binary uses its own subset of the probes

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use udplink::{LinkConfig, PacketFlags, PacketHeader};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

/// Protocol timeouts scaled down so loss and liveness scenarios finish in
/// well under a second.
pub fn test_config() -> LinkConfig {
    LinkConfig {
        timeout_total: Duration::from_millis(600),
        timeout_short: Duration::from_millis(50),
        ..LinkConfig::default()
    }
}

pub const TEST_TIMEOUT_TOTAL: Duration = Duration::from_millis(600);
pub const TEST_TIMEOUT_SHORT: Duration = Duration::from_millis(50);

/// A hand-driven peer that fabricates headers on a plain UDP socket.
pub struct RawPeer {
    socket: UdpSocket,
    remote: SocketAddr,
    seq: u32,
}

impl RawPeer {
    pub async fn new(remote_port: u16) -> RawPeer {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind raw peer");
        RawPeer {
            socket,
            remote: SocketAddr::from(([127, 0, 0, 1], remote_port)),
            seq: 0,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    /// Send one datagram with a fabricated header. The sequence number
    /// advances automatically; batch and flags are the test's business.
    pub async fn send_raw(&mut self, batch: u32, flags: PacketFlags, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
        PacketHeader::new(self.seq, batch, flags).ser(&mut buf);
        self.seq += 1;
        buf.extend_from_slice(payload);
        self.socket
            .send_to(&buf, self.remote)
            .await
            .expect("raw send");
    }

    /// Re-send a datagram byte-exactly (duplicate on the wire): same batch,
    /// same flags, same payload, but a fixed sequence number of the caller's
    /// choosing.
    pub async fn send_raw_with_seq(&self, seq: u32, batch: u32, flags: PacketFlags, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
        PacketHeader::new(seq, batch, flags).ser(&mut buf);
        buf.extend_from_slice(payload);
        self.socket
            .send_to(&buf, self.remote)
            .await
            .expect("raw send");
    }

    /// Next datagram from the engine, parsed. Panics after two seconds of
    /// silence - every test expects traffic well before that.
    pub async fn recv_frame(&self) -> (PacketHeader, Vec<u8>) {
        let mut buf = vec![0u8; 65535];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a frame from the engine")
            .expect("raw receive");
        let mut slice = &buf[..len];
        let header = PacketHeader::deser(&mut slice).expect("engine sent an unparsable header");
        (header, slice.to_vec())
    }

    /// Skip frames until one with the wanted flags arrives.
    pub async fn await_flags(&self, flags: PacketFlags) -> (PacketHeader, Vec<u8>) {
        loop {
            let (header, payload) = self.recv_frame().await;
            if header.flags.contains(flags) {
                return (header, payload);
            }
        }
    }

    /// Skip frames until the ack for `batch` arrives.
    pub async fn await_ack(&self, batch: u32) -> PacketHeader {
        loop {
            let (header, _) = self.recv_frame().await;
            if header.flags.contains(PacketFlags::ACK) && header.batch == batch {
                return header;
            }
        }
    }

    /// Count acks for `batch` seen within `window`, ignoring keepalives and
    /// whatever else flows by.
    pub async fn count_acks(&self, batch: u32, window: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + window;
        let mut count = 0;
        let mut buf = vec![0u8; 65535];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return count;
            }
            match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    let mut slice = &buf[..len];
                    if let Ok(header) = PacketHeader::deser(&mut slice) {
                        if header.flags.contains(PacketFlags::ACK) && header.batch == batch {
                            count += 1;
                        }
                    }
                }
                Ok(Err(e)) => panic!("raw receive failed: {}", e),
                Err(_) => return count,
            }
        }
    }

    /// Run the active-open handshake: SYN out, SYN+ACK in, ACK out. After
    /// this the engine under test considers the raw peer its session peer.
    pub async fn handshake(&mut self) {
        self.send_raw(0, PacketFlags::SYN | PacketFlags::REL, &[]).await;
        let (syn_ack, _) = self
            .await_flags(PacketFlags::SYN | PacketFlags::ACK)
            .await;
        self.send_raw(syn_ack.batch, PacketFlags::ACK, &[]).await;
    }
}
