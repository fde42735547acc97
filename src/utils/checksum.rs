//! Internet checksum (RFC 1071).
//!
//! The accumulator is kept unfolded so partial sums can be chained,
//! which is how the TCP pseudo-header is mixed in before the segment
//! bytes.

use byteorder::{BigEndian, ByteOrder};

use crate::types::Ipv4Addr;

/// Accumulate `buf` into a running one's-complement sum.
pub fn sum(buf: &[u8], init: u32) -> u32 {
    let mut acc = init;
    let mut chunks = buf.chunks_exact(2);
    for chunk in &mut chunks {
        acc += BigEndian::read_u16(chunk) as u32;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
    }
    acc
}

/// Fold a 32-bit accumulator down to 16 bits.
pub fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// Folded sum of `buf`. A buffer carrying a valid checksum folds to
/// `0xffff`.
pub fn data(buf: &[u8]) -> u16 {
    fold(sum(buf, 0))
}

/// Checksum value to store in a header whose checksum field is zero.
pub fn finish(buf: &[u8], init: u32) -> u16 {
    !fold(sum(buf, init))
}

/// Partial sum of the IPv4 pseudo-header for `proto` and `len` payload
/// bytes (TCP header included in `len`).
pub fn pseudo(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) -> u32 {
    let mut acc = 0u32;
    acc = sum(&src.octets(), acc);
    acc = sum(&dst.octets(), acc);
    acc += proto as u32;
    acc += len as u32;
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    // Header example from RFC 1071 discussions: 20-byte IPv4 header,
    // checksum field holding 0xb861.
    const IP_HDR: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn verifies_known_header() {
        assert_eq!(data(&IP_HDR), 0xffff);
    }

    #[test]
    fn computes_known_header() {
        let mut hdr = IP_HDR;
        hdr[10] = 0;
        hdr[11] = 0;
        assert_eq!(finish(&hdr, 0), 0xb861);
    }

    #[test]
    fn odd_length_trailing_byte() {
        let buf = [0x01u8, 0x02, 0x03];
        // 0x0102 + 0x0300
        assert_eq!(fold(sum(&buf, 0)), 0x0402);
    }

    #[test]
    fn fold_carries() {
        assert_eq!(fold(0x1_fffe), 0xffff);
        assert_eq!(fold(0x2_fffd), 0xffff);
    }

    #[test]
    fn pseudo_header_chains() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        let seg = [0u8; 20];
        let acc = pseudo(src, dst, 6, seg.len() as u16);
        let csum = finish(&seg, acc);
        // Re-verifying with the checksum patched in folds to 0xffff.
        let mut patched = seg;
        BigEndian::write_u16(&mut patched[16..18], csum);
        assert_eq!(fold(sum(&patched, pseudo(src, dst, 6, 20))), 0xffff);
    }
}
