//! Typed, length-framed binary messages.
//!
//! A frame on the wire is an 8-byte [`Header`] followed by `size` body bytes:
//!
//! ```text
//! +-----------+-----------+------------------+
//! | kind: u32 | size: u32 | body: size bytes |
//! +-----------+-----------+------------------+
//! ```
//!
//! Both header fields are little-endian. The body is packed with stack
//! discipline: [`Message::push`] appends to the end and [`Message::pop`]
//! removes from the end, so fields come back out in the reverse order they
//! went in. Sender and receiver must agree on that order.

use std::fmt;

use crate::connection::ConnectionId;
use crate::error::WireError;

/// Size of the encoded frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Width of the length marker that trails every string or byte field.
pub const LENGTH_MARKER_LEN: usize = 4;

/// The closed set of message kinds an application exchanges.
///
/// Implemented by a small fieldless enum. The tag is what travels in the
/// header; `from_wire` returns `None` for tags the application does not know,
/// which ends the connection that sent it.
pub trait MessageKind: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn to_wire(self) -> u32;
    fn from_wire(tag: u32) -> Option<Self>;
}

/// A fixed-width value that can be pushed onto or popped off a message body.
pub trait WireValue: Sized {
    /// Number of bytes the value occupies in the body.
    const WIDTH: usize;

    fn write_to(&self, out: &mut Vec<u8>);

    /// Decodes from exactly `WIDTH` bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

macro_rules! impl_wire_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireValue for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_from(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl WireValue for bool {
    const WIDTH: usize = 1;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn read_from(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Frame header as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw kind tag, see [`MessageKind::to_wire`].
    pub tag: u32,
    /// Body length in bytes.
    pub size: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.tag.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut tag = [0u8; 4];
        let mut size = [0u8; 4];
        tag.copy_from_slice(&bytes[..4]);
        size.copy_from_slice(&bytes[4..]);
        Self {
            tag: u32::from_le_bytes(tag),
            size: u32::from_le_bytes(size),
        }
    }
}

/// A typed message: a kind tag plus an opaque body.
///
/// The header size is always derived from the body, so the two cannot drift
/// apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    kind: T,
    body: Vec<u8>,
}

impl<T: MessageKind> Message<T> {
    /// Creates an empty message of the given kind.
    pub fn new(kind: T) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }

    /// Rebuilds a message read off the wire.
    pub(crate) fn from_wire(header: Header, body: Vec<u8>) -> Result<Self, WireError> {
        let kind = T::from_wire(header.tag).ok_or(WireError::UnknownKind(header.tag))?;
        Ok(Self { kind, body })
    }

    pub fn kind(&self) -> T {
        self.kind
    }

    /// Current body length in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Builds the header for this message, refusing bodies over `max_body_len`.
    pub fn header(&self, max_body_len: u32) -> Result<Header, WireError> {
        match u32::try_from(self.body.len()) {
            Ok(size) if size <= max_body_len => Ok(Header {
                tag: self.kind.to_wire(),
                size,
            }),
            _ => Err(WireError::BodyTooLarge {
                size: self.body.len(),
                max: max_body_len,
            }),
        }
    }

    /// Appends a fixed-width value to the end of the body.
    pub fn push<V: WireValue>(&mut self, value: V) -> &mut Self {
        value.write_to(&mut self.body);
        self
    }

    /// Removes a fixed-width value from the end of the body.
    pub fn pop<V: WireValue>(&mut self) -> Result<V, WireError> {
        let start = self.tail_start(V::WIDTH)?;
        let value = V::read_from(&self.body[start..]);
        self.body.truncate(start);
        Ok(value)
    }

    /// Appends a string followed by its 4-byte length marker.
    pub fn push_str(&mut self, value: &str) -> Result<&mut Self, WireError> {
        self.push_bytes(value.as_bytes())
    }

    /// Removes a string pushed with [`Message::push_str`].
    ///
    /// The body is left untouched when the bytes are not valid UTF-8.
    pub fn pop_string(&mut self) -> Result<String, WireError> {
        let (start, len) = self.field_bounds()?;
        let text = std::str::from_utf8(&self.body[start..start + len])
            .map_err(|_| WireError::InvalidUtf8)?
            .to_owned();
        self.body.truncate(start);
        Ok(text)
    }

    /// Appends raw bytes followed by their 4-byte length marker.
    pub fn push_bytes(&mut self, value: &[u8]) -> Result<&mut Self, WireError> {
        let len = u32::try_from(value.len()).map_err(|_| WireError::BodyTooLarge {
            size: value.len(),
            max: u32::MAX,
        })?;
        self.body.extend_from_slice(value);
        len.write_to(&mut self.body);
        Ok(self)
    }

    /// Removes a byte field pushed with [`Message::push_bytes`].
    pub fn pop_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let (start, len) = self.field_bounds()?;
        let bytes = self.body[start..start + len].to_vec();
        self.body.truncate(start);
        Ok(bytes)
    }

    fn tail_start(&self, width: usize) -> Result<usize, WireError> {
        self.body
            .len()
            .checked_sub(width)
            .ok_or(WireError::Underflow {
                needed: width,
                available: self.body.len(),
            })
    }

    /// Start offset and length of the length-marked field at the end of the body.
    fn field_bounds(&self) -> Result<(usize, usize), WireError> {
        let marker_start = self.tail_start(LENGTH_MARKER_LEN)?;
        let len = u32::read_from(&self.body[marker_start..]) as usize;
        let start = marker_start
            .checked_sub(len)
            .ok_or(WireError::Underflow {
                needed: len + LENGTH_MARKER_LEN,
                available: self.body.len(),
            })?;
        Ok((start, len))
    }
}

/// A received message tagged with the connection it arrived on.
///
/// The sender is set for messages received by a server and `None` on a
/// client, which only ever has one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMessage<T> {
    sender: Option<ConnectionId>,
    message: Message<T>,
}

impl<T> OwnedMessage<T> {
    pub fn new(sender: Option<ConnectionId>, message: Message<T>) -> Self {
        Self { sender, message }
    }

    pub fn sender(&self) -> Option<ConnectionId> {
        self.sender
    }

    pub fn message(&self) -> &Message<T> {
        &self.message
    }

    pub fn into_parts(self) -> (Option<ConnectionId>, Message<T>) {
        (self.sender, self.message)
    }
}
