//! Ethernet demultiplex and encapsulation.

use std::sync::Arc;

use log::trace;

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::stack::NetStack;
use crate::types::ether::{EtherHeader, ETH_HRD_SZ};
use crate::types::pkbuf::PkBuf;
use crate::types::HardwareAddr;

use super::{arp, ipv4};

/// Interface input entry point: one call per received frame.
pub fn net_in(stack: &Arc<NetStack>, intf: &Arc<Interface>, pkbuf: PkBuf) -> Result<()> {
    let protocol = {
        let mut pk = pkbuf.write().unwrap();
        if pk.pkt_len() < ETH_HRD_SZ {
            return Err(NetError::Io("runt frame".into()));
        }
        if !pk.pull(ETH_HRD_SZ) {
            return Err(NetError::Io("runt frame".into()));
        }
        let eth_hdr = pk.hdr::<EtherHeader>();
        let dst = eth_hdr.dst();
        if dst != intf.hwaddr() && !dst.is_multicast() {
            // Not for us; a raw link has no hardware filter.
            return Err(NetError::Io("foreign destination".into()));
        }
        eth_hdr.protocol()
    };

    match protocol as i32 {
        libc::ETH_P_ARP => arp::arp_in(intf, pkbuf),
        libc::ETH_P_IP => ipv4::ipv4_in(stack, intf, pkbuf),
        other => {
            trace!("{}: ethertype {:#06x} ignored", intf.name(), other);
            Ok(())
        }
    }
}

/// Prepend the Ethernet header and hand the frame to the interface.
pub(crate) fn net_xmit(
    intf: &Arc<Interface>,
    pkbuf: PkBuf,
    dst: HardwareAddr,
    protocol: u16,
) -> Result<()> {
    {
        let mut pk = pkbuf.write().unwrap();
        pk.push_head(ETH_HRD_SZ);
        let src = intf.hwaddr();
        let eth_hdr = pk.hdr_mut::<EtherHeader>();
        eth_hdr.set_dst(dst);
        eth_hdr.set_src(src);
        eth_hdr.set_protocol(protocol);
    }
    intf.queue_xmit(pkbuf)
}
