//! TCP output: segment construction and the send driver.
//!
//! The socket lock is never held across neighbor resolution or the
//! link-layer hand-off. Each send resolves the route first, then takes
//! the lock once to snapshot the header fields and copy the payload
//! out of the send buffer, and emits the finished frame after
//! releasing it.

use std::sync::Arc;
use std::time::Instant;

use log::trace;

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::net::arp;
use crate::net::ipv4::ipv4_xmit;
use crate::stack::NetStack;
use crate::types::ether::ETH_HRD_SZ;
use crate::types::ipv4::IP_HRD_SZ;
use crate::types::pkbuf::PacketBuffer;
use crate::types::tcp::{
    put_mss_option, TcpHeader, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_SYN, TCP_HDR_MAX,
    TCP_HRD_SZ,
};
use crate::types::{HardwareAddr, Ipv4Addr};
use crate::utils::checksum;

use super::timer::{tcp_clear_delack, tcp_start_rto};
use super::{SeqData, TcpSock, TcpState, TCP_DEF_MSS};

/// Headroom reserved in every outgoing segment buffer.
pub(crate) const TCP_HEADROOM: usize = ETH_HRD_SZ + IP_HRD_SZ + TCP_HDR_MAX;

/// Largest payload an interface can carry per segment.
pub(crate) fn tcp_mss_for(intf: &Interface) -> u16 {
    (intf.mtu() - IP_HRD_SZ - TCP_HRD_SZ) as u16
}

/// Option octets for this segment. MSS travels only on SYN, and only
/// when it differs from the protocol default.
fn tcp_options(offer_mss: u16, flags: u8, opt: &mut [u8; 40]) -> usize {
    let mut len = 0;
    if flags & TCP_FLAG_SYN != 0 && offer_mss != TCP_DEF_MSS {
        len += put_mss_option(&mut opt[len..], offer_mss);
    }
    len
}

/// Resolve the next hop for this socket's peer. Blocks in the neighbor
/// layer; must not be called with the socket lock held.
fn tcp_route(sock: &Arc<TcpSock>) -> Result<(Arc<NetStack>, Arc<Interface>, HardwareAddr)> {
    let stack = sock
        .stack
        .upgrade()
        .ok_or(NetError::InvalidArgument("stack gone"))?;
    let (daddr, bound) = {
        let inner = sock.inner.lock().unwrap();
        (inner.remote.addr, inner.intf.clone())
    };
    let route = stack.routes.lookup(daddr)?;
    // The connection sticks to the interface it was opened on.
    let intf = bound.unwrap_or_else(|| route.intf.clone());
    let hwaddr = arp::resolve(&intf, route.next_hop)?;
    Ok((stack, intf, hwaddr))
}

fn tcp_fill_csum(pk: &mut PacketBuffer, src: Ipv4Addr, dst: Ipv4Addr) {
    let acc = checksum::pseudo(src, dst, libc::IPPROTO_TCP as u8, pk.pkt_len() as u16);
    let csum = checksum::finish(pk.frame_bytes(), acc);
    pk.hdr_mut::<TcpHeader>().set_csum(csum);
}

/// Emit a payload-less segment: SYN, FIN, pure ACK, RST.
pub(crate) fn tcp_send_empty(sock: &Arc<TcpSock>, seqn: u32, ackn: u32, flags: u8) -> Result<()> {
    let (stack, intf, hwaddr) = tcp_route(sock)?;

    let (sport, dport, src, dst, wnd) = {
        let mut inner = sock.inner.lock().unwrap();
        inner.sync_rcv_wnd();
        if flags & TCP_FLAG_ACK != 0 {
            tcp_clear_delack(&stack, &mut inner);
        }
        (
            inner.local.port,
            inner.remote.port,
            inner.local.addr,
            inner.remote.addr,
            inner.tcb.rcv.wnd,
        )
    };

    let mut optdat = [0u8; 40];
    let optlen = tcp_options(tcp_mss_for(&intf), flags, &mut optdat);
    let optlen = (optlen + 3) & !3;
    let hdrlen = TCP_HRD_SZ + optlen;

    let mut pk = PacketBuffer::new_tx(TCP_HEADROOM, TCP_HEADROOM);
    pk.push_head(hdrlen);
    {
        let hdr = pk.hdr_mut::<TcpHeader>();
        hdr.set_sport(sport);
        hdr.set_dport(dport);
        hdr.set_seqn(seqn);
        hdr.set_ackn(ackn);
        hdr.set_header_len(hdrlen);
        hdr.set_flags(flags);
        hdr.set_wind(wnd);
        hdr.set_csum(0);
        hdr.set_urg_ptr(0);
    }
    pk.head_slice_mut()[TCP_HRD_SZ..hdrlen].copy_from_slice(&optdat[..optlen]);
    tcp_fill_csum(&mut pk, src, dst);

    ipv4_xmit(
        &stack,
        &intf,
        pk.shared(),
        src,
        dst,
        libc::IPPROTO_TCP as u8,
        hwaddr,
    )
}

/// Socket-less segment emit, used for resets answering segments that
/// reached no connection. Best effort: when the neighbor is not
/// already known the reset is simply not sent.
#[allow(clippy::too_many_arguments)]
pub(crate) fn tcp_raw_xmit(
    stack: &Arc<NetStack>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seqn: u32,
    ackn: u32,
    flags: u8,
) -> Result<()> {
    let route = stack.routes.lookup(dst)?;
    let hwaddr = route
        .intf
        .arptbl
        .cached(route.next_hop)
        .ok_or(NetError::Unreachable)?;

    let mut pk = PacketBuffer::new_tx(TCP_HEADROOM, TCP_HEADROOM);
    pk.push_head(TCP_HRD_SZ);
    {
        let hdr = pk.hdr_mut::<TcpHeader>();
        hdr.set_sport(sport);
        hdr.set_dport(dport);
        hdr.set_seqn(seqn);
        hdr.set_ackn(ackn);
        hdr.set_header_len(TCP_HRD_SZ);
        hdr.set_flags(flags);
        hdr.set_wind(0);
        hdr.set_csum(0);
        hdr.set_urg_ptr(0);
    }
    tcp_fill_csum(&mut pk, src, dst);
    ipv4_xmit(
        stack,
        &route.intf,
        pk.shared(),
        src,
        dst,
        libc::IPPROTO_TCP as u8,
        hwaddr,
    )
}

/// Emit one data segment from the send buffer at `seqn`.
///
/// Transmission and retransmission share this path; only a send at
/// exactly SND.NXT registers on the unacked list and advances SND.NXT,
/// so a retransmitted sequence changes neither.
pub(crate) fn tcp_send_data(sock: &Arc<TcpSock>, seqn: u32, len: usize) -> Result<usize> {
    {
        let inner = sock.inner.lock().unwrap();
        if !inner.state.writable() {
            return Err(inner.reason.clone().unwrap_or(NetError::ConnReset));
        }
    }
    let (stack, intf, hwaddr) = tcp_route(sock)?;

    let (mut pk, src, dst, count) = {
        let mut inner = sock.inner.lock().unwrap();
        if !inner.state.writable() {
            return Err(inner.reason.clone().unwrap_or(NetError::ConnReset));
        }

        let mut tosend = inner.sndbuf.available(seqn);
        if len > 0 {
            tosend = tosend.min(len);
        }
        let count = tosend.min(inner.mss as usize);
        if count == 0 {
            return Ok(0);
        }
        inner.sync_rcv_wnd();

        let mut pk = PacketBuffer::new_tx(TCP_HEADROOM + count, TCP_HEADROOM);
        let copied = inner.sndbuf.read(seqn, pk.append_uninit(count));
        debug_assert_eq!(copied, count);

        // PSH when this segment drains the buffered tail.
        let mut flags = TCP_FLAG_ACK;
        if count == inner.sndbuf.available(seqn) {
            flags |= TCP_FLAG_PSH;
        }

        pk.push_head(TCP_HRD_SZ);
        {
            let hdr = pk.hdr_mut::<TcpHeader>();
            hdr.set_sport(inner.local.port);
            hdr.set_dport(inner.remote.port);
            hdr.set_seqn(seqn);
            hdr.set_ackn(inner.tcb.rcv.nxt);
            hdr.set_header_len(TCP_HRD_SZ);
            hdr.set_flags(flags);
            hdr.set_wind(inner.tcb.rcv.wnd);
            hdr.set_csum(0);
            hdr.set_urg_ptr(0);
        }

        if seqn == inner.tcb.snd.nxt {
            if inner.unacked.is_empty() {
                tcp_start_rto(&stack, sock, &mut inner, seqn, count);
            }
            trace!("unacked += {{seq {}, len {}}}", seqn, count);
            inner.unacked.push_back(SeqData {
                seq: seqn,
                len: count as u16,
            });
            inner.tcb.snd.nxt = seqn.wrapping_add(count as u32);
            if inner.rtt_ts.is_none() {
                inner.rtt_ts = Some((inner.tcb.snd.nxt, Instant::now()));
            }
        }
        tcp_clear_delack(&stack, &mut inner);

        (pk, inner.local.addr, inner.remote.addr, count)
    };

    tcp_fill_csum(&mut pk, src, dst);
    ipv4_xmit(
        &stack,
        &intf,
        pk.shared(),
        src,
        dst,
        libc::IPPROTO_TCP as u8,
        hwaddr,
    )?;
    Ok(count)
}

/// Send driver: push buffered data while sequence space and the peer's
/// window allow, then a FIN if one is owed.
pub(crate) fn tcp_output(sock: &Arc<TcpSock>) {
    loop {
        let (seqn, quota) = {
            let inner = sock.inner.lock().unwrap();
            if !inner.state.writable() {
                break;
            }
            let avail = inner.sndbuf.available(inner.tcb.snd.nxt);
            let inflight = inner.tcb.bytes_in_flight() as usize;
            let wnd = inner.tcb.snd.wnd as usize;
            let quota = if inflight >= wnd {
                0
            } else {
                avail.min(wnd - inflight)
            };
            (inner.tcb.snd.nxt, quota)
        };
        if quota == 0 {
            break;
        }
        match tcp_send_data(sock, seqn, quota) {
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }
    tcp_try_fin(sock);
}

/// Emit our FIN once the send buffer has fully drained into segments.
pub(crate) fn tcp_try_fin(sock: &Arc<TcpSock>) {
    let Some(stack) = sock.stack.upgrade() else {
        return;
    };
    let pending = {
        let mut inner = sock.inner.lock().unwrap();
        if !inner.wr_shut || inner.fin_seq.is_some() || !inner.state.writable() {
            None
        } else if inner.sndbuf.available(inner.tcb.snd.nxt) > 0 {
            None // data still owed first
        } else {
            let fin_seq = inner.tcb.snd.nxt;
            inner.fin_seq = Some(fin_seq);
            inner.tcb.snd.nxt = fin_seq.wrapping_add(1);
            inner.state = match inner.state {
                TcpState::Established => TcpState::FinWait1,
                TcpState::CloseWait => TcpState::LastAck,
                state => state,
            };
            if inner.rto_event.is_none() {
                tcp_start_rto(&stack, sock, &mut inner, fin_seq, 0);
            }
            Some((fin_seq, inner.tcb.rcv.nxt))
        }
    };
    if let Some((seqn, ackn)) = pending {
        trace!("fin at seq {}", seqn);
        let _ = tcp_send_empty(sock, seqn, ackn, TCP_FLAG_FIN | TCP_FLAG_ACK);
    }
}
