use std::time::Duration;
use anyhow::bail;

use crate::packet_header::PacketHeader;

/// Tuning knobs for a link socket. One instance is shared by the API facade
///  and the I/O loop for the lifetime of the socket.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound for everything that can make the session give up: a
    ///  reliable packet staying unacknowledged, silence from the peer, or a
    ///  reserved delivery slot staying unfilled. Also the per-attempt bound
    ///  for blocking `connect` / `accept` / `receive`.
    pub timeout_total: Duration,

    /// Granularity of the protocol's periodic work: unacknowledged reliable
    ///  packets are re-sent after this long, a keepalive goes out after this
    ///  much send-side silence, and the I/O loop never sleeps longer than
    ///  this even with nothing scheduled.
    pub timeout_short: Duration,

    /// Maximum payload accepted by `send`.
    ///
    /// The protocol does not fragment: one message is one UDP datagram, so
    ///  this (plus the 12 byte header) must fit the path MTU. The default
    ///  assumes full Ethernet frames without optional IP headers
    ///  (`1500 - 20 - 8 - 12 = 1460`). Choosing it too big gets datagrams
    ///  dropped by the network; there is no discovery or compensation here.
    pub max_payload_len: usize,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            timeout_total: Duration::from_millis(5000),
            timeout_short: Duration::from_millis(200),
            max_payload_len: 1460,
        }
    }
}

impl LinkConfig {
    /// The maximum UDP payload the protocol can ever hand to the OS.
    pub const MAX_DATAGRAM_LEN: usize = 65507;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_short.is_zero() {
            bail!("short timeout must be positive");
        }
        if self.timeout_total < self.timeout_short {
            bail!("total timeout must not be below the short timeout");
        }
        if self.max_payload_len + PacketHeader::SERIALIZED_LEN > Self::MAX_DATAGRAM_LEN {
            bail!("max payload length exceeds what fits a UDP datagram");
        }
        Ok(())
    }
}
