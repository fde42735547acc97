//! # Packet buffer
//!
//! One allocation with three cursors. `head` marks the start of the
//! protocol header currently being handled, `data` the payload behind
//! it, `tail` the end of valid bytes:
//!
//! ```text
//!   buf[0] ... head ........ data ........ tail ... buf.len()
//!              |header(s)    |payload      |
//! ```
//!
//! Ingress advances `data` past each header (`pull`); egress prepends
//! headers by moving `head` down (`push_head`). Frames are shared as
//! `Arc<RwLock<_>>`; cursor and payload mutation happens under the
//! write lock.

use std::sync::{Arc, RwLock};
use std::time::Instant;

pub type PkBuf = Arc<RwLock<PacketBuffer>>;

#[derive(Debug)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    head: usize,
    data: usize,
    tail: usize,
    /// Monotonic receive timestamp, stamped by the interface worker.
    ts: Instant,
}

impl PacketBuffer {
    /// Empty ingress buffer; the link layer fills it from offset 0.
    pub fn new_rx(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            head: 0,
            data: 0,
            tail: 0,
            ts: Instant::now(),
        }
    }

    /// Egress buffer with `headroom` octets reserved for headers.
    pub fn new_tx(cap: usize, headroom: usize) -> Self {
        debug_assert!(headroom <= cap);
        Self {
            buf: vec![0; cap],
            head: headroom,
            data: headroom,
            tail: headroom,
            ts: Instant::now(),
        }
    }

    pub fn shared(self) -> PkBuf {
        Arc::new(RwLock::new(self))
    }

    pub fn stamp(&mut self) {
        self.ts = Instant::now();
    }

    pub fn timestamp(&self) -> Instant {
        self.ts
    }

    /// Mark `n` octets valid after the link layer filled `buf` from 0.
    pub fn fill(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.head = 0;
        self.data = 0;
        self.tail = n;
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Whole frame as it sits on the wire.
    pub fn frame_bytes(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    /// Octets from the current header start to the tail.
    pub fn pkt_len(&self) -> usize {
        self.tail - self.head
    }

    pub fn data_len(&self) -> usize {
        self.tail - self.data
    }

    pub fn data_slice(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    pub fn data_slice_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data..self.tail]
    }

    /// Enter the next protocol layer on ingress: the header at `data`
    /// becomes the current header and `data` moves `n` octets past it.
    /// Fails when fewer than `n` octets remain.
    pub fn pull(&mut self, n: usize) -> bool {
        if self.data + n > self.tail {
            return false;
        }
        self.head = self.data;
        self.data += n;
        true
    }

    /// Prepend an `n`-octet header on egress, returning its octets.
    /// Panics if the headroom was sized too small, which is a bug in
    /// the caller.
    pub fn push_head(&mut self, n: usize) -> &mut [u8] {
        assert!(self.head >= n, "pkbuf headroom exhausted");
        self.head -= n;
        let head = self.head;
        &mut self.buf[head..head + n]
    }

    /// Append payload octets at the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        assert!(self.tail + bytes.len() <= self.buf.len(), "pkbuf overflow");
        self.buf[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
    }

    /// Extend the tail by `n` zeroed octets and return them for the
    /// caller to fill.
    pub fn append_uninit(&mut self, n: usize) -> &mut [u8] {
        assert!(self.tail + n <= self.buf.len(), "pkbuf overflow");
        let start = self.tail;
        self.tail += n;
        &mut self.buf[start..self.tail]
    }

    /// Drop octets past `n` from the current header start (an IP
    /// total-length trim).
    pub fn trim_to(&mut self, n: usize) {
        let end = self.head + n;
        if end < self.tail {
            self.tail = end;
        }
    }

    /// Cast the current header in place. The caller must have length-
    /// checked the frame against `size_of::<T>()`.
    pub fn hdr<T>(&self) -> &T {
        debug_assert!(self.head + size_of::<T>() <= self.buf.len());
        unsafe { &*(self.buf[self.head..].as_ptr() as *const T) }
    }

    pub fn hdr_mut<T>(&mut self) -> &mut T {
        debug_assert!(self.head + size_of::<T>() <= self.buf.len());
        let head = self.head;
        unsafe { &mut *(self.buf[head..].as_mut_ptr() as *mut T) }
    }

    /// Mutable view from the current header start to the tail.
    pub fn head_slice_mut(&mut self) -> &mut [u8] {
        let (head, tail) = (self.head, self.tail);
        &mut self.buf[head..tail]
    }

    /// Peek the next layer's header at `data` before pulling it.
    pub fn data_hdr<T>(&self) -> &T {
        debug_assert!(self.data + size_of::<T>() <= self.buf.len());
        unsafe { &*(self.buf[self.data..].as_ptr() as *const T) }
    }

    pub fn data_hdr_mut<T>(&mut self) -> &mut T {
        debug_assert!(self.data + size_of::<T>() <= self.buf.len());
        let data = self.data;
        unsafe { &mut *(self.buf[data..].as_mut_ptr() as *mut T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_cursors() {
        let mut pk = PacketBuffer::new_rx(64);
        pk.fill(34);
        assert_eq!(pk.pkt_len(), 34);
        assert!(pk.pull(14));
        assert_eq!(pk.pkt_len(), 34); // head at the ether header
        assert_eq!(pk.data_len(), 20);
        assert!(pk.pull(20));
        assert_eq!(pk.pkt_len(), 20); // head at the ip header
        assert_eq!(pk.data_len(), 0);
        assert!(!pk.pull(1));
    }

    #[test]
    fn egress_prepends() {
        let mut pk = PacketBuffer::new_tx(64, 34);
        pk.append(b"hello");
        pk.push_head(20).copy_from_slice(&[0xaa; 20]);
        pk.push_head(14).copy_from_slice(&[0xbb; 14]);
        assert_eq!(pk.pkt_len(), 39);
        let frame = pk.frame_bytes();
        assert_eq!(&frame[..14], &[0xbb; 14]);
        assert_eq!(&frame[14..34], &[0xaa; 20]);
        assert_eq!(&frame[34..], b"hello");
    }

    #[test]
    #[should_panic(expected = "headroom exhausted")]
    fn headroom_overrun_panics() {
        let mut pk = PacketBuffer::new_tx(64, 10);
        pk.push_head(14);
    }

    #[test]
    fn trims_past_total_len() {
        let mut pk = PacketBuffer::new_rx(64);
        pk.fill(60);
        pk.pull(14);
        pk.trim_to(34); // ether payload is a 34-octet datagram
        assert_eq!(pk.pkt_len(), 34);
        assert_eq!(pk.data_len(), 20);
    }
}
