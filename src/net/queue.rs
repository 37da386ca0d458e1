//! Outbound packet queue
//!
//! The transport layer keeps already-encrypted packets here until the socket
//! accepts them. The connect path borrows the same queue so the first
//! packets can ride in the SYN via TCP fast open.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::IoSlice;
use std::rc::Rc;

use bytes::{Buf, Bytes};

/// Shared handle to a session's write queue.
pub type SharedWriteQueue = Rc<RefCell<PacketQueue>>;

/// FIFO of serialized packets with byte-wise consumption.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Bytes>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedWriteQueue {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Append a packet. Empty packets are dropped.
    pub fn push(&mut self, packet: impl Into<Bytes>) {
        let packet = packet.into();
        if !packet.is_empty() {
            self.packets.push_back(packet);
        }
    }

    /// Number of queued packets (not bytes).
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Total unsent bytes.
    pub fn byte_len(&self) -> usize {
        self.packets.iter().map(Bytes::len).sum()
    }

    /// Slices over the first `max` packets, for a vectored write.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.packets
            .iter()
            .take(max)
            .map(|p| IoSlice::new(p))
            .collect()
    }

    /// Drop `written` bytes from the front, splitting a packet that was only
    /// partially written.
    pub fn consume(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.packets.front_mut() else {
                break;
            };
            if front.len() > written {
                front.advance(written);
                written = 0;
            } else {
                written -= front.len();
                self.packets.pop_front();
            }
        }
    }

    /// Remove and return the next packet.
    pub fn pop(&mut self) -> Option<Bytes> {
        self.packets.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(packets: &[&'static [u8]]) -> PacketQueue {
        let mut q = PacketQueue::new();
        for p in packets {
            q.push(Bytes::from_static(p));
        }
        q
    }

    #[test]
    fn test_consume_whole_and_partial() {
        let mut q = queue_of(&[b"abcd", b"efg", b"hi"]);
        assert_eq!(q.byte_len(), 9);

        q.consume(5);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"fg"));
        assert_eq!(q.pop().unwrap(), Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_consume_exact_boundary() {
        let mut q = queue_of(&[b"abc", b"def"]);
        q.consume(3);
        assert_eq!(q.len(), 1);
        assert_eq!(q.byte_len(), 3);
    }

    #[test]
    fn test_io_slices_bounded() {
        let q = queue_of(&[b"a", b"b", b"c"]);
        let slices = q.io_slices(2);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[1], b"b");
    }

    #[test]
    fn test_empty_packets_ignored() {
        let mut q = PacketQueue::new();
        q.push(Vec::new());
        assert!(q.is_empty());
    }
}
