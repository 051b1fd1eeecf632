use std::cmp::min;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::cancellation::CancelChannel;
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::packet::Packet;
use crate::packet_header::{PacketFlags, PacketHeader};
use crate::send_pipeline::SendPipeline;
use crate::session::{Dispatch, Session, SessionState};

struct Binding {
    socket: Arc<UdpSocket>,
    pipeline: SendPipeline,
}

/// State shared between the API facade and the background I/O task.
struct Shared {
    config: Arc<LinkConfig>,
    /// the one lock of the engine: protocol state, counters, both tables,
    ///  the delivery queue and the liveness timestamps all live behind it
    session: RwLock<Session>,
    binding: RwLock<Option<Binding>>,
    blocking: AtomicBool,
    cancel: CancelChannel,
    /// notified when a delivery commits or the session ends
    recv_notify: Notify,
    /// nudges the I/O loop to recompute its deadline after the facade
    ///  changed timer-relevant state (new reliable packet, FIN, ...)
    io_nudge: Notify,
}

/// A connection-oriented, message-preserving socket over UDP.
///
/// Speaks to exactly one remote peer at a time. Messages keep their
///  boundaries; per message the caller chooses reliable delivery
///  (retransmitted until acknowledged, handed out in the order the peer sent
///  them) or best-effort (fire and forget, delivered in arrival order).
///
/// All state sits behind one lock shared with a background I/O task that is
///  started by a successful `connect`/`accept` and drives timers, acks,
///  keepalives and retransmissions. In blocking mode (the default) calls wait
///  up to the configured total timeout; in non-blocking mode a call that
///  cannot complete immediately fails with [`LinkError::WouldBlock`].
pub struct LinkSocket {
    shared: Arc<Shared>,
    io_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for LinkSocket {
    fn drop(&mut self) {
        if let Some(handle) = self.io_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Default for LinkSocket {
    fn default() -> LinkSocket {
        LinkSocket::new()
    }
}

impl LinkSocket {
    /// Passing this to [`LinkSocket::bind`] lets the OS pick a free port.
    pub const ANY_PORT: u16 = 0;

    pub fn new() -> LinkSocket {
        Self::with_config(LinkConfig::default())
            .expect("default configuration is valid")
    }

    pub fn with_config(config: LinkConfig) -> anyhow::Result<LinkSocket> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(LinkSocket {
            shared: Arc::new(Shared {
                config: config.clone(),
                session: RwLock::new(Session::new(config)),
                binding: RwLock::new(None),
                blocking: AtomicBool::new(true),
                cancel: CancelChannel::new(),
                recv_notify: Notify::new(),
                io_nudge: Notify::new(),
            }),
            io_task: StdMutex::new(None),
        })
    }

    // --- binding ----------------------------------------------------------

    pub async fn bind(&self, port: u16) -> Result<()> {
        let mut binding = self.shared.binding.write().await;
        if binding.is_some() {
            return Err(LinkError::AlreadyBound);
        }

        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        info!("bound to {:?}", socket.local_addr()?);
        let pipeline = SendPipeline::new(Arc::new(socket.clone()));
        *binding = Some(Binding { socket, pipeline });
        Ok(())
    }

    /// Release the port. A live session is torn down without the graceful
    ///  close exchange; blocked callers are woken.
    pub async fn unbind(&self) {
        self.stop_io_task();
        {
            let mut session = self.shared.session.write().await;
            if session.state != SessionState::Disconnected {
                session.teardown("socket unbound");
            }
        }
        self.shared.recv_notify.notify_waiters();
        *self.shared.binding.write().await = None;
        debug!("socket unbound");
    }

    pub async fn is_bound(&self) -> bool {
        self.shared.binding.read().await.is_some()
    }

    pub async fn local_port(&self) -> Result<u16> {
        let binding = self.shared.binding.read().await;
        match binding.as_ref() {
            Some(b) => Ok(b.socket.local_addr()?.port()),
            None => Err(LinkError::NotBound),
        }
    }

    // --- connection state -------------------------------------------------

    pub async fn is_connected(&self) -> bool {
        self.shared.session.read().await.state == SessionState::Connected
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.session.read().await.remote_addr
    }

    pub async fn remote_port(&self) -> Option<u16> {
        self.remote_addr().await.map(|a| a.port())
    }

    // --- blocking mode & cancellation -------------------------------------

    pub fn set_blocking(&self, blocking: bool) {
        self.shared.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn get_blocking(&self) -> bool {
        self.shared.blocking.load(Ordering::SeqCst)
    }

    /// Unblock every currently blocked call with [`LinkError::Cancelled`].
    ///
    /// Calls entered after this returns are unaffected, and the connection
    ///  itself stays up.
    pub fn cancel(&self) {
        debug!("cancelling blocked calls");
        self.shared.cancel.cancel();
    }

    // --- connection setup -------------------------------------------------

    /// Active open: send a SYN to `addr:port` and wait for the peer's
    ///  SYN+ACK, re-sending every short timeout. On success the background
    ///  I/O task takes over the socket.
    pub async fn connect(&self, addr: IpAddr, port: u16) -> Result<()> {
        let (socket, pipeline) = self.require_binding().await?;
        if !self.get_blocking() {
            // a handshake cannot complete without a round trip
            return Err(LinkError::WouldBlock);
        }

        let remote = SocketAddr::new(addr, port);
        let epoch = self.shared.cancel.epoch();

        let syn = {
            let mut session = self.shared.session.write().await;
            if session.state != SessionState::Disconnected {
                return Err(LinkError::AlreadyConnected);
            }
            session.start_connect(remote, Instant::now())
        };
        debug!("connecting to {:?}", remote);
        pipeline.send_packet(remote, &syn).await;

        let deadline = Instant::now() + self.shared.config.timeout_total;
        let mut buf = vec![0u8; LinkConfig::MAX_DATAGRAM_LEN];
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.shared.session.write().await.teardown("connect timed out");
                return Err(LinkError::Timeout);
            }
            let resend_at = {
                let session = self.shared.session.read().await;
                session
                    .retransmit
                    .next_resend()
                    .map(|(_, last)| last + self.shared.config.timeout_short)
                    .unwrap_or(deadline)
            };

            tokio::select! {
                res = socket.recv_from(&mut buf) => {
                    let (len, from) = match res {
                        Ok(x) => x,
                        Err(e) => {
                            self.shared.session.write().await.teardown("socket error during connect");
                            return Err(e.into());
                        }
                    };
                    if from != remote {
                        debug!("datagram from foreign origin {:?} during connect - dropping", from);
                        continue;
                    }
                    let mut payload = &buf[..len];
                    let Ok(header) = PacketHeader::deser(&mut payload) else {
                        debug!("malformed datagram during connect - dropping");
                        continue;
                    };
                    if header.flags.contains(PacketFlags::CANCEL) {
                        warn!("rejecting datagram carrying the local-only CANCEL flag");
                        continue;
                    }
                    if header.flags.contains(PacketFlags::SYN) && header.flags.contains(PacketFlags::ACK) {
                        let ack = {
                            let mut session = self.shared.session.write().await;
                            session.complete_connect(header, Instant::now())
                        };
                        pipeline.send_packet(remote, &ack).await;
                        self.start_io_task(socket.clone(), pipeline.clone());
                        info!("connected to {:?}", remote);
                        return Ok(());
                    }
                    trace!("ignoring {:?} during connect", header.flags);
                }
                _ = sleep_until(min(resend_at, deadline)) => {
                    let frames = {
                        let mut session = self.shared.session.write().await;
                        let now = Instant::now();
                        match session.retransmit.next_resend() {
                            Some((batch, last)) if last + self.shared.config.timeout_short <= now => {
                                session.on_timer(crate::events::IoEvent::AckResend(batch), now).frames
                            }
                            _ => Vec::new(),
                        }
                    };
                    for frame in &frames {
                        pipeline.send_packet(remote, frame).await;
                    }
                }
                _ = self.shared.cancel.cancelled(epoch) => {
                    self.shared.session.write().await.teardown("connect cancelled");
                    return Err(LinkError::Cancelled);
                }
            }
        }
    }

    /// Passive open: wait for a SYN on the bound socket, adopt its sender as
    ///  the session peer and answer with a SYN+ACK. In non-blocking mode only
    ///  datagrams already queued on the socket are considered.
    pub async fn accept(&self) -> Result<()> {
        let (socket, pipeline) = self.require_binding().await?;
        {
            let session = self.shared.session.read().await;
            if session.state != SessionState::Disconnected {
                return Err(LinkError::AlreadyConnected);
            }
        }

        let epoch = self.shared.cancel.epoch();
        let mut buf = vec![0u8; LinkConfig::MAX_DATAGRAM_LEN];

        if !self.get_blocking() {
            loop {
                match socket.try_recv_from(&mut buf) {
                    Ok((len, from)) => {
                        if let Some(header) = Self::parse_syn(&buf[..len], from) {
                            return self.finish_accept(&socket, &pipeline, from, header).await;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return Err(LinkError::WouldBlock);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let deadline = Instant::now() + self.shared.config.timeout_total;
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => {
                    let (len, from) = res?;
                    if let Some(header) = Self::parse_syn(&buf[..len], from) {
                        return self.finish_accept(&socket, &pipeline, from, header).await;
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(LinkError::Timeout);
                }
                _ = self.shared.cancel.cancelled(epoch) => {
                    return Err(LinkError::Cancelled);
                }
            }
        }
    }

    /// A datagram qualifies as a connection request if it parses and carries
    ///  SYN without ACK (a stray SYN+ACK is somebody else's handshake).
    fn parse_syn(mut datagram: &[u8], from: SocketAddr) -> Option<PacketHeader> {
        let Ok(header) = PacketHeader::deser(&mut datagram) else {
            debug!("malformed datagram from {:?} while accepting - dropping", from);
            return None;
        };
        if header.flags.contains(PacketFlags::CANCEL) {
            warn!("rejecting datagram carrying the local-only CANCEL flag");
            return None;
        }
        if header.flags.contains(PacketFlags::SYN) && !header.flags.contains(PacketFlags::ACK) {
            Some(header)
        } else {
            trace!("ignoring {:?} from {:?} while accepting", header.flags, from);
            None
        }
    }

    async fn finish_accept(
        &self,
        socket: &Arc<UdpSocket>,
        pipeline: &SendPipeline,
        from: SocketAddr,
        header: PacketHeader,
    ) -> Result<()> {
        let syn_ack = {
            let mut session = self.shared.session.write().await;
            session.accept_syn(from, header, Instant::now())
        };
        pipeline.send_packet(from, &syn_ack).await;
        self.start_io_task(socket.clone(), pipeline.clone());
        info!("accepted connection from {:?}", from);
        Ok(())
    }

    /// Graceful close: send a FIN and wait up to the total timeout for the
    ///  peer's confirmation, then reset either way.
    pub async fn disconnect(&self) -> Result<()> {
        let Ok((_, pipeline)) = self.require_binding().await else {
            return Ok(());
        };

        let epoch = self.shared.cancel.epoch();
        let fin = {
            let mut session = self.shared.session.write().await;
            match session.state {
                SessionState::Disconnected => return Ok(()),
                SessionState::Closing => None,
                SessionState::Connected => {
                    let remote = session
                        .remote_addr
                        .expect("a connected session has a remote peer");
                    Some((session.compose_fin(Instant::now()), remote))
                }
            }
        };
        if let Some((frame, remote)) = fin {
            pipeline.send_packet(remote, &frame).await;
            // the FIN's retransmission deadline supersedes whatever the I/O
            //  loop is currently sleeping towards
            self.shared.io_nudge.notify_waiters();
        }

        let deadline = Instant::now() + self.shared.config.timeout_total;
        loop {
            let notified = self.shared.recv_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.session.read().await.state == SessionState::Disconnected {
                break;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {
                    self.shared.session.write().await.teardown("close timed out");
                    self.shared.recv_notify.notify_waiters();
                    break;
                }
                _ = self.shared.cancel.cancelled(epoch) => {
                    // not fatal: the I/O loop finishes the close on its own
                    return Err(LinkError::Cancelled);
                }
            }
        }
        self.stop_io_task();
        Ok(())
    }

    // --- traffic ----------------------------------------------------------

    /// Hand one message to the datagram layer. Success means the datagram
    ///  was passed on, not that it was acknowledged.
    pub async fn send(&self, data: &[u8], reliable: bool) -> Result<()> {
        let (_, pipeline) = self.require_binding().await?;
        if data.len() > self.shared.config.max_payload_len {
            return Err(LinkError::PayloadTooLarge {
                size: data.len(),
                max: self.shared.config.max_payload_len,
            });
        }

        let (frame, remote) = {
            let mut session = self.shared.session.write().await;
            if session.state != SessionState::Connected {
                return Err(LinkError::NotConnected);
            }
            let remote = session
                .remote_addr
                .expect("a connected session has a remote peer");
            (session.compose_data(data, reliable, Instant::now()), remote)
        };
        pipeline.send_packet(remote, &frame).await;
        if reliable {
            self.shared.io_nudge.notify_waiters();
        }
        Ok(())
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send(packet.data(), packet.is_reliable()).await
    }

    /// Pop the next deliverable message.
    ///
    /// Reliable messages come out in the order the peer committed them;
    ///  best-effort messages in arrival order, interleaved. In blocking mode
    ///  this waits until something commits, the session ends
    ///  ([`LinkError::PeerClosed`]), the attempt times out or a `cancel`
    ///  fires. Messages already committed when the session ended can still
    ///  be drained.
    pub async fn receive(&self) -> Result<Packet> {
        self.require_binding().await?;
        let blocking = self.get_blocking();
        let epoch = self.shared.cancel.epoch();
        let deadline = Instant::now() + self.shared.config.timeout_total;

        loop {
            let notified = self.shared.recv_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut session = self.shared.session.write().await;
                if self.shared.cancel.is_cancelled(epoch) {
                    return Err(LinkError::Cancelled);
                }
                if let Some(packet) = session.delivery.pop_committed() {
                    return Ok(packet);
                }
                if session.state == SessionState::Disconnected {
                    return Err(if session.session_ended {
                        LinkError::PeerClosed
                    } else {
                        LinkError::NotConnected
                    });
                }
            }

            if !blocking {
                return Err(LinkError::WouldBlock);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => return Err(LinkError::Timeout),
                _ = self.shared.cancel.cancelled(epoch) => return Err(LinkError::Cancelled),
            }
        }
    }

    // --- internals --------------------------------------------------------

    async fn require_binding(&self) -> Result<(Arc<UdpSocket>, SendPipeline)> {
        let binding = self.shared.binding.read().await;
        match binding.as_ref() {
            Some(b) => Ok((b.socket.clone(), b.pipeline.clone())),
            None => Err(LinkError::NotBound),
        }
    }

    fn start_io_task(&self, socket: Arc<UdpSocket>, pipeline: SendPipeline) {
        let mut guard = self.io_task.lock().unwrap();
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(tokio::spawn(io_loop(self.shared.clone(), socket, pipeline)));
    }

    fn stop_io_task(&self) {
        if let Some(handle) = self.io_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// The single background task driving a connected session: waits for either
///  an incoming datagram or the next scheduler deadline, holding the shared
///  lock only while mutating state - never across socket I/O.
async fn io_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, pipeline: SendPipeline) {
    debug!("I/O loop starting");
    let mut buf = vec![0u8; LinkConfig::MAX_DATAGRAM_LEN];

    loop {
        let (event, deadline, remote) = {
            let session = shared.session.read().await;
            if session.state == SessionState::Disconnected {
                break;
            }
            let (event, deadline) = session.next_event(Instant::now());
            let remote = session
                .remote_addr
                .expect("a live session has a remote peer");
            (event, deadline, remote)
        };

        tokio::select! {
            res = socket.recv_from(&mut buf) => {
                let (len, from) = match res {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                };
                if from != remote {
                    debug!("datagram from foreign origin {:?} - dropping", from);
                    continue;
                }
                let mut payload = &buf[..len];
                let header = match PacketHeader::deser(&mut payload) {
                    Ok(header) => header,
                    Err(_) => {
                        debug!("malformed datagram from {:?} - dropping", from);
                        continue;
                    }
                };
                trace!("received {:?} seq {} batch {} ({} payload bytes)", header.flags, header.seq, header.batch, payload.len());

                let out = {
                    let mut session = shared.session.write().await;
                    session.process_datagram(header, payload, Instant::now())
                };
                flush_dispatch(&shared, &pipeline, remote, out).await;
            }
            _ = sleep_until(deadline) => {
                trace!("timer event: {:?}", event);
                let out = {
                    let mut session = shared.session.write().await;
                    session.on_timer(event, Instant::now())
                };
                flush_dispatch(&shared, &pipeline, remote, out).await;
            }
            _ = shared.io_nudge.notified() => {
                // timer-relevant state changed under us - recompute the deadline
            }
        }
    }

    shared.recv_notify.notify_waiters();
    debug!("I/O loop stopped");
}

/// Transmit a dispatch's frames (outside the lock) and wake waiters.
async fn flush_dispatch(shared: &Shared, pipeline: &SendPipeline, remote: SocketAddr, out: Dispatch) {
    for frame in &out.frames {
        pipeline.send_packet(remote, frame).await;
    }
    if out.delivered || out.closed {
        shared.recv_notify.notify_waiters();
    }
}
