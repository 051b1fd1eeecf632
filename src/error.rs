use thiserror::Error;

/// All errors surfaced by the public socket API.
///
/// Malformed or foreign-origin datagrams are never surfaced - the I/O loop
/// drops them internally. Protocol failures that invalidate the session
/// (ack timeout, receive timeout, reservation timeout) show up as
/// [`LinkError::PeerClosed`] on blocked and subsequent calls.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("socket is not bound")]
    NotBound,

    #[error("socket is already bound")]
    AlreadyBound,

    #[error("no connected peer")]
    NotConnected,

    #[error("already connected to a peer")]
    AlreadyConnected,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed by peer or declared lost")]
    PeerClosed,

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
