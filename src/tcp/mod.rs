//! TCP connection engine.
//!
//! A socket is shared as `Arc<TcpSock>`: the socket table holds one
//! reference, every queued retransmission event holds one, and each
//! blocked API caller holds one. All connection state sits behind one
//! per-socket mutex with a condvar for the blocking API.
//!
//! Locking: the demultiplexer clones the socket out of the table and
//! releases the table lock before taking the socket lock; paths that
//! hold a socket lock may take the table lock (removal, child insert)
//! but never another socket's lock, except child -> parent-listener
//! which is the only nesting direction.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::NetError;
use crate::iface::Interface;
use crate::stack::NetStack;
use crate::storage::SeqBuf;
use crate::time::EventHandle;
use crate::types::Ipv4Addr;

pub mod input;
pub mod output;
pub mod tcb;
pub mod timer;

use self::tcb::Tcb;
use self::timer::RttEstimator;

pub const TCP_DEF_MSS: u16 = 536;
pub const TCP_RTO_INIT: Duration = Duration::from_millis(200);
pub const TCP_RTO_MAX: Duration = Duration::from_secs(60);
pub const TCP_MAX_RETRIES: u32 = 5;
/// 2 * MSL, the TIME-WAIT residency.
pub const TCP_TIMEWAIT: Duration = Duration::from_secs(30);
pub const TCP_DELACK: Duration = Duration::from_millis(200);
pub const TCP_SNDBUF_SZ: usize = 65535;
pub const TCP_RCVBUF_SZ: usize = 65535;
pub const TCP_EPHEMERAL_BASE: u16 = 40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which the application may still queue data.
    pub(crate) fn writable(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Past the three-way handshake.
    pub(crate) fn synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

/// Connection four-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// One emitted-but-unacknowledged stretch of sequence space.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeqData {
    pub seq: u32,
    pub len: u16,
}

impl SeqData {
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len as u32)
    }
}

/// Established children parked on a listener until `accept`.
pub(crate) struct Backlog {
    pub queue: VecDeque<Arc<TcpSock>>,
    pub max: usize,
}

pub struct TcpSock {
    pub(crate) stack: Weak<NetStack>,
    pub(crate) inner: Mutex<TcpInner>,
    /// State-wait condition: connection progress, buffer occupancy and
    /// close reasons all land here.
    pub(crate) wait: Condvar,
}

pub(crate) struct TcpInner {
    pub state: TcpState,
    pub intf: Option<Arc<Interface>>,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub tcb: Tcb,

    /// Send buffer; base sequence tracks SND.UNA's data portion.
    pub sndbuf: SeqBuf,
    /// Receive buffer; base sequence is the next octet `recv` returns.
    pub rcvbuf: SeqBuf,
    /// Out-of-order segments keyed by sequence.
    pub ooo: BTreeMap<u32, Vec<u8>>,
    /// Emitted segments awaiting acknowledgement, oldest first.
    pub unacked: VecDeque<SeqData>,

    pub rto_event: Option<EventHandle>,
    /// Stale-fire guard: a callback only acts when its captured
    /// generation still matches.
    pub rto_gen: u64,
    pub rto: Duration,
    pub retries: u32,
    pub rtte: RttEstimator,
    /// One in-flight RTT sample: (sequence that must be acked, sent-at).
    pub rtt_ts: Option<(u32, Instant)>,

    pub mss: u16,
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
    pub keepalive_gen: u64,
    pub rcv_timeout: Option<Duration>,
    pub snd_timeout: Option<Duration>,

    pub ack_pending: bool,
    pub ack_event: Option<EventHandle>,

    /// Sequence our FIN occupies, once sent.
    pub fin_seq: Option<u32>,
    pub rd_shut: bool,
    pub wr_shut: bool,
    /// Peer's FIN has been taken into RCV.NXT.
    pub fin_rcvd: bool,

    /// Why the connection died, surfaced to every blocked caller.
    pub reason: Option<NetError>,

    /// Listener-only accept queue.
    pub backlog: Option<Backlog>,
    /// Child -> listener backref for accept hand-off.
    pub parent: Option<Weak<TcpSock>>,
}

impl TcpInner {
    fn new() -> Self {
        Self {
            state: TcpState::Closed,
            intf: None,
            local: Endpoint::new(Ipv4Addr::ANY, 0),
            remote: Endpoint::new(Ipv4Addr::ANY, 0),
            tcb: Tcb::new(),
            sndbuf: SeqBuf::new(TCP_SNDBUF_SZ),
            rcvbuf: SeqBuf::new(TCP_RCVBUF_SZ),
            ooo: BTreeMap::new(),
            unacked: VecDeque::new(),
            rto_event: None,
            rto_gen: 0,
            rto: TCP_RTO_INIT,
            retries: 0,
            rtte: RttEstimator::new(),
            rtt_ts: None,
            mss: TCP_DEF_MSS,
            nodelay: false,
            keepalive: None,
            keepalive_gen: 0,
            rcv_timeout: None,
            snd_timeout: None,
            ack_pending: false,
            ack_event: None,
            fin_seq: None,
            rd_shut: false,
            wr_shut: false,
            fin_rcvd: false,
            reason: None,
            backlog: None,
            parent: None,
        }
    }

    pub fn quad(&self) -> Quad {
        Quad {
            local: self.local,
            remote: self.remote,
        }
    }

    /// Keep the advertised window in step with receive-buffer space.
    pub fn sync_rcv_wnd(&mut self) {
        self.tcb.rcv.wnd = self.rcvbuf.free().min(u16::MAX as usize) as u16;
    }

    /// Our FIN has been wholly acknowledged.
    pub fn fin_acked(&self) -> bool {
        match self.fin_seq {
            Some(fin_seq) => crate::storage::seqbuf::seq_gt(self.tcb.snd.una, fin_seq),
            None => false,
        }
    }
}

impl TcpSock {
    pub(crate) fn alloc(stack: &Arc<NetStack>) -> Arc<TcpSock> {
        Arc::new(TcpSock {
            stack: Arc::downgrade(stack),
            inner: Mutex::new(TcpInner::new()),
            wait: Condvar::new(),
        })
    }

    pub fn state(&self) -> TcpState {
        self.inner.lock().unwrap().state
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        let inner = self.inner.lock().unwrap();
        (inner.local.port != 0).then_some(inner.local)
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        let inner = self.inner.lock().unwrap();
        (inner.remote.port != 0).then_some(inner.remote)
    }
}

#[cfg(test)]
impl TcpSock {
    pub(crate) fn unacked_len(&self) -> usize {
        self.inner.lock().unwrap().unacked.len()
    }

    pub(crate) fn snd_una(&self) -> u32 {
        self.inner.lock().unwrap().tcb.snd.una
    }

    pub(crate) fn rcv_nxt(&self) -> u32 {
        self.inner.lock().unwrap().tcb.rcv.nxt
    }

    pub(crate) fn iss(&self) -> u32 {
        self.inner.lock().unwrap().tcb.snd.iss
    }
}

/// Socket table: exact four-tuple owners plus wildcard listeners.
pub(crate) struct SockTable {
    pub estab: HashMap<Quad, Arc<TcpSock>>,
    pub listen: HashMap<Endpoint, Arc<TcpSock>>,
}

impl SockTable {
    pub fn new() -> Self {
        Self {
            estab: HashMap::new(),
            listen: HashMap::new(),
        }
    }

    pub fn lookup(&self, quad: &Quad) -> Option<Arc<TcpSock>> {
        self.estab.get(quad).cloned()
    }

    /// Exact-address listener first, then the wildcard.
    pub fn lookup_listen(&self, local: Endpoint) -> Option<Arc<TcpSock>> {
        self.listen
            .get(&local)
            .or_else(|| self.listen.get(&Endpoint::new(Ipv4Addr::ANY, local.port)))
            .cloned()
    }
}

/// Put a connected socket into the demux table.
pub(crate) fn tcp_hash(stack: &NetStack, quad: Quad, sock: &Arc<TcpSock>) {
    stack.socks.lock().unwrap().estab.insert(quad, sock.clone());
}

/// Remove a socket from whichever table half holds it. Callers hold
/// the socket lock; the table is a leaf from there.
pub(crate) fn tcp_unhash(stack: &NetStack, inner: &TcpInner, sock: &Arc<TcpSock>) {
    let mut socks = stack.socks.lock().unwrap();
    if inner.backlog.is_some() {
        socks.listen.remove(&inner.local);
    } else if let Some(existing) = socks.estab.get(&inner.quad()) {
        if Arc::ptr_eq(existing, sock) {
            socks.estab.remove(&inner.quad());
        }
    }
}

/// Terminal transition: cancel every timer, record the close reason,
/// leave the table and wake all blocked callers.
pub(crate) fn tcp_done(
    stack: &NetStack,
    sock: &Arc<TcpSock>,
    inner: &mut TcpInner,
    reason: Option<NetError>,
) {
    timer::tcp_cancel_timers(stack, inner);
    tcp_unhash(stack, inner, sock);
    inner.state = TcpState::Closed;
    if inner.reason.is_none() {
        inner.reason = reason;
    }
    sock.wait.notify_all();
}
