//! TCP input: checksum gate, demultiplex and the per-state handlers.
//!
//! Per RFC 793 the synchronized states share one processing order:
//! sequence acceptance, RST, SYN, ACK accounting, segment text, FIN.
//! ACK accounting runs before payload delivery so acknowledged send
//! buffer space frees before new readers can block behind it.
//!
//! Malformed or checksum-failing segments are dropped silently and
//! counted; they never surface to the application.

use std::sync::Arc;

use log::{info, trace};

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::stack::NetStack;
use crate::storage::seqbuf::{seq_gt, seq_gte, seq_lt, seq_lte, seq_sub};
use crate::types::pkbuf::PkBuf;
use crate::types::tcp::{
    mss_option, TcpHeader, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_HRD_SZ,
};
use crate::types::Ipv4Addr;
use crate::utils::checksum;

use super::output::{tcp_mss_for, tcp_output, tcp_raw_xmit, tcp_send_empty};
use super::timer::{tcp_cancel_rto, tcp_sched_ack, tcp_set_timewait, tcp_start_rto};
use super::{tcp_done, tcp_hash, Endpoint, Quad, TcpInner, TcpSock, TcpState, TCP_DEF_MSS};

/// A validated segment, every field already in host order.
#[derive(Debug)]
pub(crate) struct TcpSegment {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub wnd: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }
    pub fn ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }
    pub fn rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }
    pub fn fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    /// Octets of sequence space the segment occupies.
    pub fn seg_len(&self) -> u32 {
        self.payload.len() as u32 + self.syn() as u32 + self.fin() as u32
    }
}

/// Deferred work collected under the socket lock, performed after it
/// is released: the lock is never held across a send.
#[derive(Default)]
struct Actions {
    /// Empty segments to emit on this socket: (seq, ack, flags).
    replies: Vec<(u32, u32, u8)>,
    /// Run the send driver (window opened or state became writable).
    kick: bool,
    /// Answer as if no connection existed.
    reset: bool,
    /// Freshly allocated SYN-RECEIVED child: emit its SYN|ACK.
    child: Option<(Arc<TcpSock>, u32, u32)>,
    /// Listener to hand this now-established socket to.
    deliver: Option<Arc<TcpSock>>,
}

/// Segment entry point from the IPv4 layer.
pub fn tcp_in(
    stack: &Arc<NetStack>,
    intf: &Arc<Interface>,
    pkbuf: PkBuf,
    saddr: Ipv4Addr,
    daddr: Ipv4Addr,
) -> Result<()> {
    let seg = {
        let pk = pkbuf.read().unwrap();
        let pkt_len = pk.pkt_len();
        if pkt_len < TCP_HRD_SZ {
            stack.stats.count_drop();
            return Ok(());
        }
        // Full sum over pseudo-header, header and payload must fold to
        // all-ones; anything else is dropped without a word.
        let acc = checksum::pseudo(saddr, daddr, libc::IPPROTO_TCP as u8, pkt_len as u16);
        if checksum::fold(checksum::sum(pk.frame_bytes(), acc)) != !0 {
            stack.stats.count_csum_error();
            trace!("tcp checksum mismatch, segment dropped");
            return Ok(());
        }
        let hdr = pk.hdr::<TcpHeader>();
        let hlen = hdr.header_len();
        if hlen < TCP_HRD_SZ || hlen > pkt_len {
            stack.stats.count_drop();
            return Ok(());
        }
        let frame = pk.frame_bytes();
        TcpSegment {
            saddr,
            daddr,
            sport: hdr.sport(),
            dport: hdr.dport(),
            seq: hdr.seqn(),
            ack: hdr.ackn(),
            flags: hdr.flags(),
            wnd: hdr.wind(),
            mss: hdr.syn().then(|| mss_option(&frame[TCP_HRD_SZ..hlen])).flatten(),
            payload: frame[hlen..].to_vec(),
        }
    };
    trace!(
        "tcp {} -> {} seq {} ack {} flags {:#04x} len {}",
        seg.sport,
        seg.dport,
        seg.seq,
        seg.ack,
        seg.flags,
        seg.payload.len()
    );

    let quad = Quad {
        local: Endpoint::new(daddr, seg.dport),
        remote: Endpoint::new(saddr, seg.sport),
    };
    let sock = {
        let socks = stack.socks.lock().unwrap();
        socks
            .lookup(&quad)
            .or_else(|| socks.lookup_listen(quad.local))
    };
    match sock {
        Some(sock) => tcp_sock_in(stack, intf, &sock, seg),
        None => {
            // RFC 793 3.4: a closed endpoint answers everything but a
            // reset with a reset.
            if !seg.rst() {
                tcp_send_reset(stack, &seg);
            }
            Ok(())
        }
    }
}

/// Reset in reply to `seg`, addressed from whoever it was sent to.
fn tcp_send_reset(stack: &Arc<NetStack>, seg: &TcpSegment) {
    let (seqn, ackn, flags) = if seg.ack() {
        (seg.ack, 0, TCP_FLAG_RST)
    } else {
        (
            0,
            seg.seq.wrapping_add(seg.seg_len()),
            TCP_FLAG_RST | TCP_FLAG_ACK,
        )
    };
    if let Err(err) = tcp_raw_xmit(
        stack, seg.daddr, seg.saddr, seg.dport, seg.sport, seqn, ackn, flags,
    ) {
        trace!("reset not sent: {}", err);
    }
}

fn tcp_sock_in(
    stack: &Arc<NetStack>,
    intf: &Arc<Interface>,
    sock: &Arc<TcpSock>,
    seg: TcpSegment,
) -> Result<()> {
    let mut acts = Actions::default();
    {
        let mut inner = sock.inner.lock().unwrap();
        match inner.state {
            // Lost a race with close; answer like the closed endpoint.
            TcpState::Closed => acts.reset = !seg.rst(),
            TcpState::Listen => tcp_listen_in(stack, intf, sock, &mut inner, &seg, &mut acts),
            TcpState::SynSent => tcp_synsent_in(stack, sock, &mut inner, &seg, &mut acts),
            _ => tcp_states_in(stack, sock, &mut inner, &seg, &mut acts),
        }
    }

    if acts.reset {
        tcp_send_reset(stack, &seg);
    }
    if let Some((child, seqn, ackn)) = acts.child {
        let _ = tcp_send_empty(&child, seqn, ackn, TCP_FLAG_SYN | TCP_FLAG_ACK);
    }
    for (seqn, ackn, flags) in acts.replies {
        let _ = tcp_send_empty(sock, seqn, ackn, flags);
    }
    if let Some(listener) = acts.deliver {
        let delivered = {
            let mut li = listener.inner.lock().unwrap();
            match li.backlog.as_mut() {
                Some(backlog) if backlog.queue.len() < backlog.max => {
                    backlog.queue.push_back(sock.clone());
                    true
                }
                _ => false,
            }
        };
        if delivered {
            listener.wait.notify_all();
        } else {
            let mut inner = sock.inner.lock().unwrap();
            tcp_done(stack, sock, &mut inner, Some(NetError::ConnAborted));
        }
    }
    if acts.kick {
        tcp_output(sock);
    }
    Ok(())
}

/// LISTEN: a SYN conceives a SYN-RECEIVED child; everything else is
/// dropped.
fn tcp_listen_in(
    stack: &Arc<NetStack>,
    intf: &Arc<Interface>,
    listener: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seg: &TcpSegment,
    acts: &mut Actions,
) {
    if seg.rst() || seg.ack() || !seg.syn() {
        return;
    }
    if let Some(backlog) = &inner.backlog {
        if backlog.queue.len() >= backlog.max {
            trace!("listen backlog full, syn dropped");
            return;
        }
    }

    let child = TcpSock::alloc(stack);
    let (iss, rcv_nxt) = {
        let mut ci = child.inner.lock().unwrap();
        ci.intf = Some(intf.clone());
        ci.local = Endpoint::new(seg.daddr, seg.dport);
        ci.remote = Endpoint::new(seg.saddr, seg.sport);
        let iss = rand::random::<u32>();
        ci.tcb.init_iss(iss);
        ci.tcb.init_irs(seg.seq);
        ci.tcb.snd.wnd = seg.wnd as u32;
        ci.tcb.snd.wl1 = seg.seq;
        ci.tcb.snd.wl2 = iss;
        ci.sndbuf.reset(iss.wrapping_add(1));
        ci.rcvbuf.reset(seg.seq.wrapping_add(1));
        ci.sync_rcv_wnd();
        ci.mss = tcp_mss_for(intf).min(seg.mss.unwrap_or(TCP_DEF_MSS));
        ci.state = TcpState::SynReceived;
        ci.parent = Some(Arc::downgrade(listener));
        tcp_hash(stack, ci.quad(), &child);
        tcp_start_rto(stack, &child, &mut ci, iss, 0);
        (iss, ci.tcb.rcv.nxt)
    };
    info!(
        "listen {}: syn from {}:{}",
        inner.local.port, seg.saddr, seg.sport
    );
    acts.child = Some((child, iss, rcv_nxt));
}

/// SYN-SENT: waiting for the peer's half of the handshake.
fn tcp_synsent_in(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seg: &TcpSegment,
    acts: &mut Actions,
) {
    // First, the ACK field.
    let ack_ok = if seg.ack() {
        if seq_lte(seg.ack, inner.tcb.snd.iss) || seq_gt(seg.ack, inner.tcb.snd.nxt) {
            if !seg.rst() {
                acts.replies.push((seg.ack, 0, TCP_FLAG_RST));
            }
            return;
        }
        true
    } else {
        false
    };

    // Second, an RST with an acceptable ACK refuses the connection.
    if seg.rst() {
        if ack_ok {
            tcp_done(stack, sock, inner, Some(NetError::Refused));
        }
        return;
    }

    // Fourth, the SYN.
    if !seg.syn() {
        return;
    }
    inner.tcb.init_irs(seg.seq);
    inner.rcvbuf.reset(seg.seq.wrapping_add(1));
    inner.sync_rcv_wnd();
    inner.mss = inner.mss.min(seg.mss.unwrap_or(TCP_DEF_MSS));
    inner.tcb.snd.wnd = seg.wnd as u32;
    inner.tcb.snd.wl1 = seg.seq;
    inner.tcb.snd.wl2 = seg.ack;

    if ack_ok {
        // Our SYN is acknowledged: the handshake completes here.
        inner.tcb.snd.una = seg.ack;
        inner.retries = 0;
        tcp_cancel_rto(stack, inner);
        inner.state = TcpState::Established;
        info!(
            "{}:{} -> {}:{} established",
            inner.local.addr, inner.local.port, inner.remote.addr, inner.remote.port
        );
        acts.replies
            .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
        acts.kick = true;
        sock.wait.notify_all();
    } else {
        // Simultaneous open.
        inner.state = TcpState::SynReceived;
        acts.replies.push((
            inner.tcb.snd.iss,
            inner.tcb.rcv.nxt,
            TCP_FLAG_SYN | TCP_FLAG_ACK,
        ));
    }
}

/// The synchronized states: SYN-RECEIVED through TIME-WAIT.
fn tcp_states_in(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seg: &TcpSegment,
    acts: &mut Actions,
) {
    // First, sequence acceptance. Unacceptable segments are answered
    // with the current ACK (unless they are resets) and dropped.
    if !inner.tcb.in_rcv_window(seg.seq, seg.seg_len() as usize) {
        if seg.rst() {
            return;
        }
        if inner.state == TcpState::TimeWait && seg.fin() {
            // A retransmitted FIN restarts the 2MSL clock.
            tcp_set_timewait(stack, sock, inner);
        }
        acts.replies
            .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
        return;
    }

    // Second, RST.
    if seg.rst() {
        match inner.state {
            TcpState::SynReceived => {
                if inner.parent.is_some() {
                    // Passive open: the child vanishes, the listener
                    // stays put.
                    tcp_done(stack, sock, inner, None);
                } else {
                    tcp_done(stack, sock, inner, Some(NetError::Refused));
                }
            }
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => {
                tcp_done(stack, sock, inner, Some(NetError::ConnReset));
            }
            _ => tcp_done(stack, sock, inner, None),
        }
        return;
    }

    // Fourth, a SYN inside the window is a peer protocol violation.
    if seg.syn() {
        acts.replies.push((inner.tcb.snd.nxt, 0, TCP_FLAG_RST));
        tcp_done(stack, sock, inner, Some(NetError::ConnReset));
        return;
    }

    // Fifth, the ACK field; segments without one are dropped.
    if !seg.ack() {
        return;
    }
    if inner.state == TcpState::SynReceived {
        if inner.tcb.acceptable_ack(seg.ack) {
            inner.state = TcpState::Established;
            inner.tcb.snd.wnd = seg.wnd as u32;
            inner.tcb.snd.wl1 = seg.seq;
            inner.tcb.snd.wl2 = seg.ack;
            info!(
                "{}:{} accepted from {}:{}",
                inner.local.addr, inner.local.port, inner.remote.addr, inner.remote.port
            );
            if let Some(parent) = inner.parent.as_ref().and_then(|weak| weak.upgrade()) {
                acts.deliver = Some(parent);
            }
            acts.kick = true;
            sock.wait.notify_all();
        } else {
            acts.replies.push((seg.ack, 0, TCP_FLAG_RST));
            return;
        }
    }
    if !tcp_ack_in(stack, sock, inner, seg, acts) {
        return;
    }
    if inner.state == TcpState::Closed {
        return; // LAST-ACK completed inside ack processing
    }

    // Seventh, segment text.
    tcp_text_in(stack, sock, inner, seg, acts);

    // Eighth, FIN.
    if seg.fin() {
        tcp_fin_in(stack, sock, inner, seg, acts);
    }
}

/// ACK accounting shared by every synchronized state. Returns false
/// when the segment must be dropped (it acknowledged unsent data).
fn tcp_ack_in(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seg: &TcpSegment,
    acts: &mut Actions,
) -> bool {
    if inner.tcb.acceptable_ack(seg.ack) {
        let acked = seq_sub(seg.ack, inner.tcb.snd.una) as usize;
        inner.tcb.snd.una = seg.ack;

        // One RTT sample per flight, never from retransmissions.
        if let Some((sampled_seq, sent_at)) = inner.rtt_ts {
            if seq_gte(seg.ack, sampled_seq) {
                inner.rto = inner.rtte.update(sent_at.elapsed());
                inner.rtt_ts = None;
            }
        }

        // Free acknowledged send-buffer octets; SYN/FIN occupy
        // sequence space but no buffer, so the ring clamps for us.
        inner.sndbuf.consume(acked);
        while matches!(inner.unacked.front(), Some(head) if seq_lte(head.end(), inner.tcb.snd.una))
        {
            let popped = inner.unacked.pop_front();
            trace!("unacked -= {:?}", popped);
        }
        inner.retries = 0;

        // Restart the RTO behind the new left edge, or disarm it.
        tcp_cancel_rto(stack, inner);
        if let Some(head) = inner.unacked.front().copied() {
            let from = if seq_lt(head.seq, inner.tcb.snd.una) {
                inner.tcb.snd.una
            } else {
                head.seq
            };
            let len = seq_sub(head.end(), from) as usize;
            tcp_start_rto(stack, sock, inner, from, len);
        } else if let Some(fin_seq) = inner.fin_seq {
            if !inner.fin_acked() {
                tcp_start_rto(stack, sock, inner, fin_seq, 0);
            }
        }

        // Space freed: senders may continue, window may have opened.
        sock.wait.notify_all();
        acts.kick = true;
    } else if seq_gt(seg.ack, inner.tcb.snd.nxt) {
        // Acknowledges the future; tell the peer where we stand.
        acts.replies
            .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
        return false;
    }

    if seq_lte(inner.tcb.snd.una, seg.ack) {
        inner.tcb.update_snd_wnd(seg.seq, seg.ack, seg.wnd);
    }

    // Transitions driven by our FIN becoming acknowledged.
    if inner.fin_acked() {
        match inner.state {
            TcpState::FinWait1 => {
                inner.state = TcpState::FinWait2;
                sock.wait.notify_all();
            }
            TcpState::Closing => {
                tcp_set_timewait(stack, sock, inner);
                sock.wait.notify_all();
            }
            TcpState::LastAck => {
                tcp_done(stack, sock, inner, None);
            }
            _ => {}
        }
    }
    true
}

/// Deliver in-window payload, buffering out-of-order stretches in the
/// OOO set and draining it when the gap closes.
fn tcp_text_in(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seg: &TcpSegment,
    acts: &mut Actions,
) {
    if seg.payload.is_empty() {
        return;
    }
    match inner.state {
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
        // The peer already sent FIN; there is no more text to take.
        _ => return,
    }

    // Trim to [RCV.NXT, RCV.NXT + RCV.WND).
    let mut seq = seg.seq;
    let mut data = &seg.payload[..];
    if seq_lt(seq, inner.tcb.rcv.nxt) {
        let skip = seq_sub(inner.tcb.rcv.nxt, seq) as usize;
        if skip >= data.len() {
            // Entirely old; just remind the peer of our position.
            acts.replies
                .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
            return;
        }
        data = &data[skip..];
        seq = inner.tcb.rcv.nxt;
    }
    let right = inner.tcb.rcv.nxt.wrapping_add(inner.tcb.rcv.wnd as u32);
    let space = seq_sub(right, seq);
    if space <= 0 {
        acts.replies
            .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
        return;
    }
    let data = &data[..data.len().min(space as usize)];

    if seq == inner.tcb.rcv.nxt {
        let wrote = inner.rcvbuf.write(seq, data).is_ok();
        debug_assert!(wrote, "receive window exceeded buffer space");
        if wrote {
            inner.tcb.rcv.nxt = seq.wrapping_add(data.len() as u32);
        }

        // Close the gap with anything the OOO set now continues.
        while let Some((&ooo_seq, _)) = inner.ooo.iter().next() {
            if seq_gt(ooo_seq, inner.tcb.rcv.nxt) {
                break;
            }
            let (ooo_seq, ooo_data) = inner.ooo.pop_first().unwrap();
            let skip = seq_sub(inner.tcb.rcv.nxt, ooo_seq) as usize;
            if skip < ooo_data.len() {
                let rest = &ooo_data[skip..];
                if inner.rcvbuf.write(inner.tcb.rcv.nxt, rest).is_ok() {
                    inner.tcb.rcv.nxt = inner.tcb.rcv.nxt.wrapping_add(rest.len() as u32);
                }
            }
        }

        if inner.rd_shut {
            // Read side closed: take the sequence space, discard the
            // octets.
            let drop_len = inner.rcvbuf.len();
            inner.rcvbuf.consume(drop_len);
        }
        inner.sync_rcv_wnd();
        sock.wait.notify_all();

        // Coalesce the ACK unless coalescing is off.
        if !tcp_sched_ack(stack, sock, inner) {
            acts.replies
                .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
        }
    } else {
        // A hole precedes this data: stash it and duplicate-ACK so the
        // peer learns what we are missing.
        trace!("ooo segment at {} ({} octets)", seq, data.len());
        inner.ooo.insert(seq, data.to_vec());
        acts.replies
            .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
    }
}

/// Peer's FIN: take its sequence slot, wake readers, acknowledge, and
/// move the state machine.
fn tcp_fin_in(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seg: &TcpSegment,
    acts: &mut Actions,
) {
    match inner.state {
        TcpState::TimeWait => {
            acts.replies
                .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
            tcp_set_timewait(stack, sock, inner);
            return;
        }
        TcpState::CloseWait | TcpState::Closing | TcpState::LastAck => {
            // Duplicate FIN; our ACK must have been lost.
            acts.replies
                .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));
            return;
        }
        _ => {}
    }

    let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
    if fin_seq != inner.tcb.rcv.nxt {
        // Data is still missing in front of the FIN; the peer will
        // retransmit both.
        return;
    }
    inner.tcb.rcv.nxt = fin_seq.wrapping_add(1);
    inner.fin_rcvd = true;
    acts.replies
        .push((inner.tcb.snd.nxt, inner.tcb.rcv.nxt, TCP_FLAG_ACK));

    match inner.state {
        TcpState::SynReceived | TcpState::Established => inner.state = TcpState::CloseWait,
        TcpState::FinWait1 => {
            if inner.fin_acked() {
                tcp_set_timewait(stack, sock, inner);
            } else {
                // Simultaneous close: both FINs crossed.
                inner.state = TcpState::Closing;
            }
        }
        TcpState::FinWait2 => tcp_set_timewait(stack, sock, inner),
        _ => {}
    }
    trace!("fin taken, state now {:?}", inner.state);
    sock.wait.notify_all();
}
