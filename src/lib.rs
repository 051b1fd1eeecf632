//! A reliable, connection-oriented, message-preserving transport layered on
//!  top of plain UDP.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data as opposed to a stream of bytes): message boundaries survive the
//!   wire, there is no fragmentation and no reassembly.
//! * A familiar socket-like surface - bind, connect, accept, send, receive,
//!   disconnect - with an explicit handshake and graceful teardown, but
//!   datagram semantics underneath.
//! * Per-message choice of delivery mode:
//!   * *reliable*: the packet is retained and re-sent until acknowledged, and
//!     handed to the receiving application in the order it was sent, holes
//!     being bridged by reserved delivery slots
//!   * *best-effort*: fire and forget, delivered in arrival order interleaved
//!     with reliable traffic
//! * One engine instance speaks to exactly one remote peer; liveness is
//!   maintained with keepalives and a receive timeout, so a vanished peer is
//!   detected without user traffic
//! * A caller-facing API that can be driven from any task, serialized by a
//!   single lock, with a background I/O task owning the socket reads and all
//!   protocol timers
//! * Explicitly *no* congestion control, flow control windows or encryption -
//!   different trade-offs than TCP or QUIC
//!
//! ## Header
//!
//! Packet header (inside a UDP datagram) - all numbers in network byte order
//!  (BE):
//! ```ascii
//! 0: sequence number (u32): incremented for every outgoing datagram,
//!     including acks and keepalives; tracks liveness
//! 4: batch number (u32): incremented only for reliable data packets;
//!     defines the delivery order. For an ACK, the batch being acknowledged.
//! 8: flags (u32):
//!     * SYN    = 1      connection requested
//!     * ACK    = 2      acknowledges the reliable packet `batch`
//!     * FIN    = 4      no more messages
//!     * KEP    = 8      keepalive
//!     * REL    = 16     reliable packet: retained, re-sent, acknowledged
//!     * CANCEL = 1<<31  local wakeup sentinel, never valid on the wire
//! ```
//! The payload follows the header and may be empty (pure control datagrams).
//!
//! ## Control datagrams
//!
//! * *SYN* (+REL): requests a connection; the first reliable packet of a
//!   session, so it consumes batch number 0.
//! * *SYN+ACK* (+REL): accepts a connection and acknowledges the SYN in one
//!   datagram.
//! * *FIN* (+REL): initiates the graceful close; answered with FIN+ACK.
//! * *KEP*: keepalive, sent after a short timeout of send-side silence.
//! * *ACK*: acknowledges the reliable packet whose batch number it carries.
//!   Acks may arrive in any order; duplicates are ignored.
//!
//! ## Timeouts
//!
//! Two durations govern all timing (see [`LinkConfig`]): a *short* timeout
//!  driving retransmission and keepalives, and a *total* timeout after which
//!  an unacknowledged packet, a silent peer or an unfilled delivery hole
//!  declares the connection lost.

mod cancellation;
mod config;
mod delivery_queue;
mod error;
mod events;
mod packet;
mod packet_header;
mod retransmit;
mod send_pipeline;
mod session;
mod socket;

pub use config::LinkConfig;
pub use error::{LinkError, Result};
pub use packet::Packet;
pub use packet_header::{PacketFlags, PacketHeader};
pub use socket::LinkSocket;
