//! Packet buffers with reserved headroom for header prepending.

use std::ops::{Index, IndexMut};
use std::slice::SliceIndex;

use crate::header::PacketHeader;

/// Headroom reserved by [`PacketBuffer::from_payload`]; enough for a full
/// packet header plus a payload header with vendor id and ack counter.
pub const HEADER_RESERVE: usize = 40;

/// Growable byte buffer that supports efficient front-extension.
///
/// Outbound messages start as a bare payload; headers are prepended into the
/// reserved headroom as the message moves down the stack. Inbound messages
/// have headers consumed off the front. A buffer may carry a chained
/// continuation, which the session layer refuses to send.
#[derive(Clone, Debug, Default)]
pub struct PacketBuffer {
    buf:  Vec<u8>,
    head: usize,
    next: Option<Box<PacketBuffer>>,
}

impl PacketBuffer {
    /// Create with reserved space for `back` bytes in the back and `front` in the front.
    pub fn with_capacity(back: usize, front: usize) -> Self {
        let mut buf = Vec::with_capacity(front + back);
        buf.resize(front, 0);
        Self { buf, head: front, next: None }
    }

    /// Copy `data` into a new buffer with [`HEADER_RESERVE`] bytes of headroom.
    pub fn from_payload(data: &[u8]) -> Self {
        let mut b = Self::with_capacity(data.len(), HEADER_RESERVE);
        b.buf.extend_from_slice(data);
        b
    }

    /// Prepend `slice` to the front.
    pub fn extend_front(&mut self, slice: &[u8]) {
        if self.head >= slice.len() {
            self.head -= slice.len();
        } else {
            let shift = slice.len() - self.head;
            self.buf.extend(std::iter::repeat_n(0, shift));
            self.buf.rotate_right(shift);
            self.head = 0;
        }
        self.buf[self.head..self.head + slice.len()].copy_from_slice(slice);
    }

    /// Drop `n` bytes from the front. Returns `false` (and changes nothing)
    /// if fewer than `n` bytes are present.
    pub fn consume_front(&mut self, n: usize) -> bool {
        if n > self.len() {
            return false;
        }
        self.head += n;
        true
    }

    /// Remove and return the last `n` bytes, or `None` if the buffer is shorter.
    pub fn split_off_back(&mut self, n: usize) -> Option<Vec<u8>> {
        if n > self.len() {
            return None;
        }
        let at = self.buf.len() - n;
        Some(self.buf.split_off(at))
    }

    /// Attach a continuation buffer.
    pub fn chain(&mut self, next: PacketBuffer) {
        match &mut self.next {
            Some(tail) => tail.chain(next),
            None       => self.next = Some(Box::new(next)),
        }
    }

    /// True if this buffer has a chained continuation.
    pub fn has_chained_buffer(&self) -> bool { self.next.is_some() }

    /// Number of bytes in this buffer (not counting chained buffers).
    pub fn len(&self) -> usize { self.buf.len() - self.head }

    /// True if empty.
    pub fn is_empty(&self) -> bool { self.head == self.buf.len() }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<u8> { self.as_ref().to_vec() }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] { &self.buf[self.head..] }
}
impl AsMut<[u8]> for PacketBuffer {
    fn as_mut(&mut self) -> &mut [u8] { &mut self.buf[self.head..] }
}
impl<I: SliceIndex<[u8]>> Index<I> for PacketBuffer {
    type Output = I::Output;
    fn index(&self, i: I) -> &Self::Output { self.as_ref().index(i) }
}
impl<I: SliceIndex<[u8]>> IndexMut<I> for PacketBuffer {
    fn index_mut(&mut self, i: I) -> &mut Self::Output { self.as_mut().index_mut(i) }
}
impl Extend<u8> for PacketBuffer {
    fn extend<T: IntoIterator<Item = u8>>(&mut self, iter: T) { self.buf.extend(iter); }
}
impl<'a> Extend<&'a u8> for PacketBuffer {
    fn extend<T: IntoIterator<Item = &'a u8>>(&mut self, iter: T) { self.buf.extend(iter); }
}
impl From<Vec<u8>> for PacketBuffer {
    fn from(buf: Vec<u8>) -> Self { Self { buf, head: 0, next: None } }
}

// ─── EncryptedPacketBuffer ────────────────────────────────────────────────────

/// A fully framed message ready for the transport.
///
/// Produced by [`crate::SessionManager::prepare_message`]; the type cannot be
/// fed back into preparation, so a message is never framed or counted twice.
#[derive(Clone, Debug)]
pub struct EncryptedPacketBuffer(PacketBuffer);

impl EncryptedPacketBuffer {
    pub(crate) fn mark_encrypted(buf: PacketBuffer) -> Self { Self(buf) }

    /// Rewrap wire bytes that were prepared earlier (e.g. kept for
    /// retransmission) without touching their headers or counters.
    pub fn from_wire(buf: PacketBuffer) -> Self { Self(buf) }

    /// Read the message counter back out of the packet header.
    pub fn message_counter(&self) -> Option<u32> {
        match PacketHeader::decode(self.0.as_ref()) {
            Ok((header, _)) => Some(header.counter),
            Err(e) => {
                log::error!("[session] Failed to decode prepared message header: {e}");
                None
            }
        }
    }

    /// The wire bytes.
    pub fn as_bytes(&self) -> &[u8] { self.0.as_ref() }

    /// Wire length in bytes.
    pub fn len(&self) -> usize { self.0.len() }

    /// True if there are no wire bytes.
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub(crate) fn has_chained_buffer(&self) -> bool { self.0.has_chained_buffer() }

    /// A copy of the buffer for handing to the transport; the prepared
    /// message stays available for retransmission.
    pub(crate) fn cast_to_writable(&self) -> PacketBuffer { self.0.clone() }
}
