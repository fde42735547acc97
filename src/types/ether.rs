//! # Ethernet II
//!
//! Header structs are cast in place over frame bytes. Because the
//! struct is packed, fields are read by value and written through
//! `set_*` accessors only.

use super::*;
use super::hwa::HardwareAddr;

pub const ETH_HRD_SZ: usize = size_of::<EtherHeader>();

#[repr(packed)]
#[derive(Debug)]
pub struct EtherHeader {
    dst: HardwareAddr,
    src: HardwareAddr,
    protocol: be16,
}

/// getters
impl EtherHeader {
    pub fn dst(&self) -> HardwareAddr {
        self.dst
    }
    pub fn src(&self) -> HardwareAddr {
        self.src
    }
    pub fn protocol(&self) -> u16 {
        self.protocol.get()
    }
}

/// setters
impl EtherHeader {
    pub fn set_dst(&mut self, dst: HardwareAddr) {
        self.dst = dst;
    }
    pub fn set_src(&mut self, src: HardwareAddr) {
        self.src = src;
    }
    pub fn set_protocol(&mut self, protocol: u16) {
        self.protocol = be16::set(protocol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_layout() {
        assert_eq!(ETH_HRD_SZ, 14);
    }

    #[test]
    fn field_offsets() {
        let mut raw = [0u8; ETH_HRD_SZ];
        raw[..6].copy_from_slice(&[0xff; 6]);
        raw[6..12].copy_from_slice(&[0x02, 0x42, 0, 0, 0, 1]);
        raw[12] = 0x08;
        raw[13] = 0x06;
        let hdr = unsafe { &*(raw.as_ptr() as *const EtherHeader) };
        assert!(hdr.dst().is_broadcast());
        assert_eq!(hdr.src(), HardwareAddr::new([0x02, 0x42, 0, 0, 0, 1]));
        assert_eq!(hdr.protocol(), libc::ETH_P_ARP as u16);
    }
}
