//! IPv4 input validation and output encapsulation.
//!
//! No fragment handling: datagrams with fragmentation bits set are
//! dropped, and emitted datagrams never carry options.

use std::sync::Arc;

use log::{debug, trace};

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::stack::NetStack;
use crate::tcp::input::tcp_in;
use crate::types::ipv4::{Ipv4Header, IP_FRAG_MF, IP_FRAG_OFF, IP_HRD_SZ, IP_VERSION_4};
use crate::types::pkbuf::PkBuf;
use crate::types::{HardwareAddr, Ipv4Addr};

use super::link::net_xmit;

pub fn ipv4_in(stack: &Arc<NetStack>, intf: &Arc<Interface>, pkbuf: PkBuf) -> Result<()> {
    let (saddr, daddr, protocol) = {
        let mut pk = pkbuf.write().unwrap();
        if pk.data_len() < IP_HRD_SZ {
            return Err(NetError::Io("datagram too short".into()));
        }
        let ip_hdr = pk.data_hdr::<Ipv4Header>();
        if ip_hdr.version() != IP_VERSION_4 {
            return Err(NetError::Io("not an ipv4 datagram".into()));
        }
        let header_len = ip_hdr.header_len();
        let total_len = ip_hdr.total_len();
        if header_len < IP_HRD_SZ || total_len < header_len || pk.data_len() < total_len {
            return Err(NetError::Io("bad ipv4 lengths".into()));
        }
        if !ip_hdr.verify_checksum() {
            stack.stats.count_csum_error();
            return Err(NetError::Io("ipv4 checksum mismatch".into()));
        }
        if ip_hdr.frag_off() & (IP_FRAG_OFF | IP_FRAG_MF) != 0 {
            // Reassembly is out of scope for this stack.
            debug!("{}: fragmented datagram dropped", intf.name());
            return Err(NetError::Io("fragmented datagram".into()));
        }
        let saddr = ip_hdr.src_addr();
        let daddr = ip_hdr.dst_addr();
        let protocol = ip_hdr.protocol();
        if daddr != intf.ipv4_addr() && !daddr.is_broadcast() {
            // No forwarding path; quietly ignore transit traffic.
            return Err(NetError::Io("not addressed to us".into()));
        }
        pk.pull(header_len);
        pk.trim_to(total_len);
        pk.pull(0); // head now names the L4 header for the next layer
        (saddr, daddr, protocol)
    };

    match protocol as i32 {
        libc::IPPROTO_TCP => tcp_in(stack, intf, pkbuf, saddr, daddr),
        other => {
            trace!("{}: ip protocol {} ignored", intf.name(), other);
            Ok(())
        }
    }
}

/// Wrap the L4 segment sitting in `pkbuf` in an IPv4 header and emit
/// it toward `dst_hw`.
pub(crate) fn ipv4_xmit(
    stack: &Arc<NetStack>,
    intf: &Arc<Interface>,
    pkbuf: PkBuf,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    dst_hw: HardwareAddr,
) -> Result<()> {
    {
        let mut pk = pkbuf.write().unwrap();
        let total_len = (IP_HRD_SZ + pk.pkt_len()) as u16;
        let ident = stack.next_ident();
        pk.push_head(IP_HRD_SZ);
        let ip_hdr = pk.hdr_mut::<Ipv4Header>();
        ip_hdr.build(total_len, ident, protocol, src, dst);
    }
    net_xmit(intf, pkbuf, dst_hw, libc::ETH_P_IP as u16)
}
