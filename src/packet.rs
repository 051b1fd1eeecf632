use bytes::Bytes;

/// A single application message: an opaque byte payload plus the delivery
///  mode it travels with.
///
/// The payload is reference-counted, so cloning a packet or handing it to
///  `send` does not copy the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    reliable: bool,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, reliable: bool) -> Packet {
        Packet {
            data: data.into(),
            reliable,
        }
    }

    pub fn from_slice(data: &[u8], reliable: bool) -> Packet {
        Packet {
            data: Bytes::copy_from_slice(data),
            reliable,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this packet was (or is to be) sent with retransmission and
    ///  batch ordering.
    pub fn is_reliable(&self) -> bool {
        self.reliable
    }
}
