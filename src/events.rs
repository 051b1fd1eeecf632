use tokio::time::Instant;

use crate::config::LinkConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::retransmit::RetransmitTable;

/// What the I/O loop should do when its next deadline fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IoEvent {
    /// re-send the reliable packet with this batch number
    AckResend(u32),
    /// a reliable packet stayed unacknowledged for the total timeout -
    ///  the connection is lost
    AckTimeout,
    /// nothing was sent for a short-timeout interval - emit a keepalive
    Keepalive,
    /// nothing was received for the total timeout - the peer is dead
    RecvTimeout,
    /// a delivery hole stayed unfilled for the total timeout
    ReserveTimeout,
    /// bounded fallback tick, nothing to do
    Reloop,
}

/// Pick the next event and its deadline: the earliest candidate over the
///  retransmission table, keepalive and liveness timers and reservation ages,
///  bounded by a fallback tick of at most one short timeout so the loop never
///  sleeps unbounded.
///
/// Ties go to the candidate listed first, matching the order above.
pub(crate) fn next_event(
    retransmit: &RetransmitTable,
    delivery: &DeliveryQueue,
    time_last_send: Instant,
    time_last_received: Instant,
    config: &LinkConfig,
    now: Instant,
) -> (IoEvent, Instant) {
    let mut candidates: Vec<(IoEvent, Instant)> = Vec::with_capacity(5);

    if let Some((batch, last_resend)) = retransmit.next_resend() {
        candidates.push((IoEvent::AckResend(batch), last_resend + config.timeout_short));
    }
    if let Some(first_send) = retransmit.earliest_first_send() {
        candidates.push((IoEvent::AckTimeout, first_send + config.timeout_total));
    }
    candidates.push((IoEvent::Keepalive, time_last_send + config.timeout_short));
    candidates.push((IoEvent::RecvTimeout, time_last_received + config.timeout_total));
    if let Some((_, created)) = delivery.oldest_reservation() {
        candidates.push((IoEvent::ReserveTimeout, created + config.timeout_total));
    }

    let mut next = (IoEvent::Reloop, now + config.timeout_short);
    for candidate in candidates {
        if candidate.1 < next.1 {
            next = candidate;
        }
    }
    next
}
