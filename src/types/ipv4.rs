//! # IPv4 (RFC 791)
//!
//! Options are accepted on parse (`header_len` covers them) and never
//! emitted.

use crate::utils::checksum;

use super::*;

pub const IP_HRD_SZ: usize = size_of::<Ipv4Header>();
pub const IP_VERSION_4: u8 = 4;
pub const IP_ALEN: u8 = 4;
pub const IP_DEFAULT_TTL: u8 = 64;

pub const IP_FRAG_OFF: u16 = 0x1fff; // fragment offset mask
pub const IP_FRAG_MF: u16 = 0x2000; // more fragments
pub const IP_FRAG_DF: u16 = 0x4000; // don't fragment

#[repr(transparent)]
#[derive(Clone, Copy)]
struct VerHlen(u8);

impl VerHlen {
    fn header_len(self) -> usize {
        ((self.0 & 0x0f) as usize) << 2
    }

    fn version(self) -> u8 {
        (self.0 & 0xf0) >> 4
    }
}

impl Debug for VerHlen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version: {}, hlen: {}", self.version(), self.header_len())
    }
}

#[derive(Debug)]
#[repr(packed)]
pub struct Ipv4Header {
    /// ip_hlen[3:0], ip_ver[7:4]
    ver_hlen: VerHlen,
    tos: u8,
    total_len: be16,
    ident: be16,
    /// flags[15:13], fragment offset in 8-octet units[12:0]
    frag_off: be16,
    ttl: u8,
    protocol: u8,
    checksum: be16,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
}

/// getters
impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        self.ver_hlen.header_len()
    }
    pub fn version(&self) -> u8 {
        self.ver_hlen.version()
    }
    pub fn total_len(&self) -> usize {
        self.total_len.get() as usize
    }
    pub fn ident(&self) -> u16 {
        self.ident.get()
    }
    pub fn frag_off(&self) -> u16 {
        self.frag_off.get()
    }
    pub fn ttl(&self) -> u8 {
        self.ttl
    }
    pub fn protocol(&self) -> u8 {
        self.protocol
    }
    pub fn checksum(&self) -> u16 {
        self.checksum.get()
    }
    pub fn src_addr(&self) -> Ipv4Addr {
        self.src_addr
    }
    pub fn dst_addr(&self) -> Ipv4Addr {
        self.dst_addr
    }
}

/// setters
impl Ipv4Header {
    pub fn set_tos(&mut self, tos: u8) {
        self.tos = tos;
    }
    pub fn set_total_len(&mut self, total_len: u16) {
        self.total_len = be16::set(total_len);
    }
    pub fn set_ident(&mut self, ident: u16) {
        self.ident = be16::set(ident);
    }
    pub fn set_frag_off(&mut self, frag_off: u16) {
        self.frag_off = be16::set(frag_off);
    }
    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }
    pub fn set_protocol(&mut self, protocol: u8) {
        self.protocol = protocol;
    }
    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.src_addr = addr;
    }
    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.dst_addr = addr;
    }
}

impl Ipv4Header {
    /// Initialise an option-less header in place and checksum it.
    pub fn build(
        &mut self,
        total_len: u16,
        ident: u16,
        protocol: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) {
        self.ver_hlen = VerHlen((IP_VERSION_4 << 4) | (IP_HRD_SZ >> 2) as u8);
        self.tos = 0;
        self.total_len = be16::set(total_len);
        self.ident = be16::set(ident);
        self.frag_off = be16::set(0);
        self.ttl = IP_DEFAULT_TTL;
        self.protocol = protocol;
        self.checksum = be16::set(0);
        self.src_addr = src;
        self.dst_addr = dst;
        self.fill_checksum();
    }

    pub fn fill_checksum(&mut self) {
        self.checksum = be16::set(0);
        let csum = checksum::finish(self.as_bytes(), 0);
        self.checksum = be16::set(csum);
    }

    pub fn verify_checksum(&self) -> bool {
        checksum::data(self.as_bytes()) == !0
    }

    fn as_bytes(&self) -> &[u8] {
        let this = self as *const Self as *const u8;
        unsafe { std::slice::from_raw_parts(this, self.header_len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_layout() {
        assert_eq!(IP_HRD_SZ, 20);
    }

    #[test]
    fn build_and_verify() {
        let mut raw = [0u8; IP_HRD_SZ];
        let hdr = unsafe { &mut *(raw.as_mut_ptr() as *mut Ipv4Header) };
        hdr.build(
            40,
            7,
            libc::IPPROTO_TCP as u8,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
        );

        let hdr = unsafe { &*(raw.as_ptr() as *const Ipv4Header) };
        assert_eq!(hdr.version(), IP_VERSION_4);
        assert_eq!(hdr.header_len(), IP_HRD_SZ);
        assert_eq!(hdr.total_len(), 40);
        assert_eq!(hdr.ident(), 7);
        assert_eq!(hdr.frag_off(), 0);
        assert_eq!(hdr.protocol(), 6);
        assert!(hdr.verify_checksum());
    }

    #[test]
    fn corrupt_header_fails_checksum() {
        let mut raw = [0u8; IP_HRD_SZ];
        let hdr = unsafe { &mut *(raw.as_mut_ptr() as *mut Ipv4Header) };
        hdr.build(
            20,
            0,
            libc::IPPROTO_TCP as u8,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
        );
        raw[8] ^= 0xff; // flip the ttl
        let hdr = unsafe { &*(raw.as_ptr() as *const Ipv4Header) };
        assert!(!hdr.verify_checksum());
    }
}
