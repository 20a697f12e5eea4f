use bytes::{BufMut, BytesMut};

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

/// A payload that may be sent to or received from a peer.
///
/// `Packet` is a cheap handle; clones share one buffer. The transport takes
/// additional handles while a payload sits on outgoing or incoming queues,
/// so a sender that keeps its own clone can inspect `flags()` after the
/// transport has released all of its references.
#[derive(Clone)]
pub struct Packet {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    data: BytesMut,
    flags: u32,
    // handles held by queued commands, as opposed to user clones
    queued: usize,
}

impl Packet {
    /// Delivery must be acknowledged; the payload is resent until it is.
    pub const RELIABLE: u32 = 1 << 0;
    /// The payload is not sequenced relative to other payloads.
    pub const UNSEQUENCED: u32 = 1 << 1;
    /// Oversized payloads fragment as unreliable sends instead of reliable.
    pub const UNRELIABLE_FRAGMENT: u32 = 1 << 3;
    /// Set once the payload has left every queue it was entered into.
    pub const SENT: u32 = 1 << 8;

    pub fn new(data: &[u8], flags: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(data.len());
        buf.put_slice(data);
        Packet::from_bytes(buf, flags)
    }

    /// Wrap an already-owned buffer without copying.
    pub fn from_bytes(data: BytesMut, flags: u32) -> Packet {
        Packet {
            inner: Rc::new(RefCell::new(Inner {
                data,
                flags,
                queued: 0,
            })),
        }
    }

    /// Reassembly target sized for a whole fragment group.
    pub(crate) fn zeroed(len: usize, flags: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        Packet::from_bytes(buf, flags)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flags(&self) -> u32 {
        self.inner.borrow().flags
    }

    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.borrow(), |inner| &inner.data[..])
    }

    /// Handles alive for this payload, user clones included.
    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub(crate) fn add_flags(&self, flags: u32) {
        self.inner.borrow_mut().flags |= flags;
    }

    pub(crate) fn write_at(&self, offset: usize, src: &[u8]) {
        self.inner.borrow_mut().data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Take a queue-owned handle.
    pub(crate) fn attach(&self) -> Packet {
        self.inner.borrow_mut().queued += 1;
        self.clone()
    }

    /// Release a queue-owned handle after its command was transmitted or
    /// acknowledged; the last such release marks the payload `SENT`.
    pub(crate) fn release_sent(packet: Packet) {
        let queued = {
            let mut inner = packet.inner.borrow_mut();
            inner.queued -= 1;
            inner.queued
        };
        if queued == 0 {
            packet.add_flags(Packet::SENT);
        }
    }

    /// Release a queue-owned handle without marking the payload as sent
    /// (throttle drops, resets, incoming deliveries).
    pub(crate) fn release(packet: Packet) {
        packet.inner.borrow_mut().queued -= 1;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        fmt.debug_struct("Packet")
            .field("len", &inner.data.len())
            .field("flags", &inner.flags)
            .finish()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Packet) -> bool {
        *self.data() == *other.data()
    }
}

impl Eq for Packet {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_buffer() {
        let packet = Packet::new(b"hello", Packet::RELIABLE);
        let other = packet.clone();

        assert_eq!(packet.reference_count(), 2);
        assert_eq!(&*other.data(), b"hello");
        assert_eq!(other.flags(), Packet::RELIABLE);
    }

    #[test]
    fn last_queued_release_marks_sent() {
        let packet = Packet::new(b"abc", Packet::RELIABLE);

        let first = packet.attach();
        let second = packet.attach();

        Packet::release_sent(first);
        assert_eq!(packet.flags() & Packet::SENT, 0);

        Packet::release_sent(second);
        assert_ne!(packet.flags() & Packet::SENT, 0);
    }

    #[test]
    fn plain_release_never_marks_sent() {
        let packet = Packet::new(b"abc", 0);

        let queued = packet.attach();
        Packet::release(queued);

        assert_eq!(packet.flags() & Packet::SENT, 0);
    }

    #[test]
    fn write_at_patches_reassembly_target() {
        let packet = Packet::zeroed(8, Packet::RELIABLE);

        packet.write_at(2, b"abc");

        assert_eq!(&*packet.data(), &[0, 0, b'a', b'b', b'c', 0, 0, 0]);
    }
}
