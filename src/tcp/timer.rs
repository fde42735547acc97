//! Connection timers: retransmission with exponential backoff,
//! TIME-WAIT, delayed ACK and the optional keep-alive probe.
//!
//! Every timer callback captures a strong socket reference plus the
//! socket's timer generation at arm time; a fired callback whose
//! generation no longer matches was superseded and returns without
//! touching the socket. Cancellation therefore never has to win a race
//! against the dispatch thread.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};

use crate::error::NetError;
use crate::stack::NetStack;
use crate::storage::seqbuf::seq_gte;

use super::output::{tcp_send_data, tcp_send_empty};
use super::{
    tcp_done, TcpInner, TcpSock, TcpState, TCP_DELACK, TCP_MAX_RETRIES, TCP_RTO_INIT, TCP_RTO_MAX,
    TCP_TIMEWAIT,
};
use crate::types::tcp::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN};

/// Lower bound on the variance term, in lieu of a clock granularity.
const RTT_GRANULARITY: Duration = Duration::from_millis(10);

/// Smoothed RTT per RFC 6298 (alpha 1/8, beta 1/4).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }

    /// Fold in one measurement and return the next RTO.
    pub fn update(&mut self, r: Duration) -> Duration {
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                let err = if srtt > r { srtt - r } else { r - srtt };
                self.rttvar = self.rttvar * 3 / 4 + err / 4;
                self.srtt = Some(srtt * 7 / 8 + r / 8);
            }
        }
        let rto = self.srtt.unwrap() + cmp::max(RTT_GRANULARITY, self.rttvar * 4);
        rto.clamp(TCP_RTO_INIT, TCP_RTO_MAX)
    }
}

/// Arm the retransmission timer for `{seq, len}` at the socket's
/// current RTO. Caller holds the socket lock.
pub(crate) fn tcp_start_rto(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    seq: u32,
    len: usize,
) {
    inner.rto_gen += 1;
    let gen = inner.rto_gen;
    let sock = sock.clone();
    trace!("rto armed: seq {} len {} in {:?}", seq, len, inner.rto);
    inner.rto_event = Some(
        stack
            .timer
            .queue_rel(inner.rto, move || tcp_rto_fire(sock, gen, seq, len)),
    );
}

/// Disarm without blocking on the dispatch thread.
pub(crate) fn tcp_cancel_rto(stack: &NetStack, inner: &mut TcpInner) {
    inner.rto_gen += 1;
    if let Some(ev) = inner.rto_event.take() {
        stack.timer.cancel(ev);
    }
}

pub(crate) fn tcp_cancel_timers(stack: &NetStack, inner: &mut TcpInner) {
    tcp_cancel_rto(stack, inner);
    inner.keepalive_gen += 1;
    inner.ack_pending = false;
    if let Some(ev) = inner.ack_event.take() {
        stack.timer.cancel(ev);
    }
}

fn tcp_rto_fire(sock: Arc<TcpSock>, gen: u64, seq: u32, len: usize) {
    let Some(stack) = sock.stack.upgrade() else {
        return;
    };

    // What to re-emit, decided under the lock, sent outside it.
    let resend = {
        let mut inner = sock.inner.lock().unwrap();
        if gen != inner.rto_gen {
            return; // superseded by a restart or cancel
        }
        inner.rto_event = None;

        if inner.state == TcpState::TimeWait {
            // The slot doubles as the 2MSL clock once retransmission
            // is over.
            tcp_done(&stack, &sock, &mut inner, None);
            return;
        }
        if !seq_gte(seq, inner.tcb.snd.una) && len > 0 {
            return; // already acknowledged
        }

        let resend = match inner.state {
            TcpState::Closed | TcpState::Listen => return,
            TcpState::SynSent => (inner.tcb.snd.iss, 0, TCP_FLAG_SYN),
            TcpState::SynReceived => (inner.tcb.snd.iss, inner.tcb.rcv.nxt, TCP_FLAG_SYN | TCP_FLAG_ACK),
            _ if len > 0 => (seq, 0, 0), // data path, flags unused
            _ => match inner.fin_seq {
                Some(fin_seq) if !inner.fin_acked() => {
                    (fin_seq, inner.tcb.rcv.nxt, TCP_FLAG_FIN | TCP_FLAG_ACK)
                }
                _ => return, // nothing outstanding; leave disarmed
            },
        };

        inner.retries += 1;
        if inner.retries > TCP_MAX_RETRIES {
            warn!(
                "{:?} -> Closed: retransmission budget exhausted",
                inner.state
            );
            let reason = if inner.state == TcpState::SynSent {
                NetError::Timeout
            } else {
                NetError::ConnReset
            };
            tcp_done(&stack, &sock, &mut inner, Some(reason));
            return;
        }

        // Back off and re-arm with the same segment identity. A
        // retransmitted stretch is never RTT-sampled (Karn's rule).
        inner.rto = cmp::min(inner.rto * 2, TCP_RTO_MAX);
        inner.rtt_ts = None;
        tcp_start_rto(&stack, &sock, &mut inner, seq, len);
        resend
    };

    let (seqn, ackn, flags) = resend;
    let result = if len > 0 {
        trace!("retransmit seq {} len {}", seqn, len);
        tcp_send_data(&sock, seqn, len).map(|_| ())
    } else {
        trace!("retransmit control seq {} flags {:#04x}", seqn, flags);
        tcp_send_empty(&sock, seqn, ackn, flags)
    };
    if let Err(err) = result {
        trace!("retransmit failed: {}", err);
    }
}

/// Enter TIME-WAIT (or restart its clock on a re-received FIN).
pub(crate) fn tcp_set_timewait(stack: &Arc<NetStack>, sock: &Arc<TcpSock>, inner: &mut TcpInner) {
    tcp_cancel_rto(stack, inner);
    inner.state = TcpState::TimeWait;
    let gen = inner.rto_gen;
    let sock = sock.clone();
    inner.rto_event = Some(stack.timer.queue_rel(TCP_TIMEWAIT, move || {
        tcp_rto_fire(sock, gen, 0, 0)
    }));
}

/// Start (or note the already-running) delayed-ACK window. Returns
/// false when coalescing is disabled and the caller must ACK now.
pub(crate) fn tcp_sched_ack(stack: &Arc<NetStack>, sock: &Arc<TcpSock>, inner: &mut TcpInner) -> bool {
    if inner.nodelay {
        return false;
    }
    if inner.ack_pending {
        return true;
    }
    inner.ack_pending = true;
    let sock = sock.clone();
    inner.ack_event = Some(
        stack
            .timer
            .queue_rel(TCP_DELACK, move || tcp_delack_fire(sock)),
    );
    true
}

/// An outgoing segment carries the ACK; drop any pending pure ACK.
pub(crate) fn tcp_clear_delack(stack: &NetStack, inner: &mut TcpInner) {
    inner.ack_pending = false;
    if let Some(ev) = inner.ack_event.take() {
        stack.timer.cancel(ev);
    }
}

fn tcp_delack_fire(sock: Arc<TcpSock>) {
    let snapshot = {
        let mut inner = sock.inner.lock().unwrap();
        if !inner.ack_pending {
            return;
        }
        inner.ack_pending = false;
        inner.ack_event = None;
        if !inner.state.synchronized() {
            return;
        }
        (inner.tcb.snd.nxt, inner.tcb.rcv.nxt)
    };
    let (seqn, ackn) = snapshot;
    if let Err(err) = tcp_send_empty(&sock, seqn, ackn, TCP_FLAG_ACK) {
        trace!("delayed ack failed: {}", err);
    }
}

/// Re-arm or disable the keep-alive probe clock.
pub(crate) fn tcp_set_keepalive(
    stack: &Arc<NetStack>,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    interval: Option<Duration>,
) {
    inner.keepalive_gen += 1;
    inner.keepalive = interval;
    if let Some(interval) = interval {
        let gen = inner.keepalive_gen;
        let sock = sock.clone();
        stack
            .timer
            .queue_rel(interval, move || tcp_keepalive_fire(sock, gen));
    }
}

fn tcp_keepalive_fire(sock: Arc<TcpSock>, gen: u64) {
    let Some(stack) = sock.stack.upgrade() else {
        return;
    };
    let snapshot = {
        let inner = sock.inner.lock().unwrap();
        if gen != inner.keepalive_gen || inner.state != TcpState::Established {
            return;
        }
        let Some(interval) = inner.keepalive else {
            return;
        };
        let again = sock.clone();
        stack
            .timer
            .queue_rel(interval, move || tcp_keepalive_fire(again, gen));
        // A bare ACK at SND.NXT elicits the peer's current state.
        (inner.tcb.snd.nxt, inner.tcb.rcv.nxt)
    };
    let (seqn, ackn) = snapshot;
    let _ = tcp_send_empty(&sock, seqn, ackn, TCP_FLAG_ACK);
}

#[cfg(test)]
pub(crate) fn tcp_timewait_expire(sock: &Arc<TcpSock>) {
    let stack = sock.stack.upgrade().unwrap();
    let mut inner = sock.inner.lock().unwrap();
    assert_eq!(inner.state, TcpState::TimeWait);
    tcp_done(&stack, sock, &mut inner, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_srtt() {
        let mut est = RttEstimator::new();
        let rto = est.update(Duration::from_millis(100));
        // srtt 100ms, rttvar 50ms -> 100 + 4*50
        assert_eq!(rto, Duration::from_millis(300));
    }

    #[test]
    fn rto_stays_clamped() {
        let mut est = RttEstimator::new();
        let fast = est.update(Duration::from_micros(100));
        assert!(fast >= TCP_RTO_INIT);
        let mut est = RttEstimator::new();
        let slow = est.update(Duration::from_secs(600));
        assert!(slow <= TCP_RTO_MAX);
    }

    #[test]
    fn steady_rtt_converges() {
        let mut est = RttEstimator::new();
        let mut rto = Duration::ZERO;
        for _ in 0..20 {
            rto = est.update(Duration::from_millis(80));
        }
        // Variance decays until the clamp floor takes over.
        assert_eq!(rto, TCP_RTO_INIT);
    }
}
