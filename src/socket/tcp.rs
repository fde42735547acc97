//! Blocking TCP socket surface.
//!
//! Every call suspends on the socket's condvar and is woken by state
//! transitions from the input path or the timers. A caller wanting a
//! bound on the wait installs `set_send_timeout` / `set_recv_timeout`
//! and receives `Timeout` when the deadline passes.

use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use log::info;

use crate::error::{NetError, Result};
use crate::stack::NetStack;
use crate::tcp::output::{tcp_mss_for, tcp_output, tcp_raw_xmit, tcp_send_empty};
use crate::tcp::timer::{tcp_set_keepalive, tcp_start_rto};
use crate::tcp::{tcp_done, tcp_hash, Backlog, Endpoint, TcpInner, TcpSock, TcpState};
use crate::types::tcp::{TCP_FLAG_RST, TCP_FLAG_SYN};
use crate::types::Ipv4Addr;

pub use libc::{MSG_DONTWAIT, MSG_WAITALL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Rd,
    Wr,
    RdWr,
}

impl Shutdown {
    fn reads(self) -> bool {
        matches!(self, Shutdown::Rd | Shutdown::RdWr)
    }

    fn writes(self) -> bool {
        matches!(self, Shutdown::Wr | Shutdown::RdWr)
    }
}

impl NetStack {
    /// A fresh CLOSED socket.
    pub fn tcp_socket(self: &Arc<Self>) -> Arc<TcpSock> {
        TcpSock::alloc(self)
    }
}

/// Wait once on the socket condvar, bounded by `deadline`. Returns the
/// reacquired guard and whether the deadline has passed.
fn wait_on<'a>(
    sock: &'a TcpSock,
    guard: MutexGuard<'a, TcpInner>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, TcpInner>, bool) {
    match deadline {
        None => (sock.wait.wait(guard).unwrap(), false),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (guard, _) = sock.wait.wait_timeout(guard, deadline - now).unwrap();
            (guard, Instant::now() >= deadline)
        }
    }
}

impl TcpSock {
    fn stack(&self) -> Result<Arc<NetStack>> {
        self.stack
            .upgrade()
            .ok_or(NetError::InvalidArgument("stack is gone"))
    }

    /// Active open. Blocks until ESTABLISHED, or fails with `Timeout`
    /// (handshake retries exhausted), `Refused` (peer reset) or
    /// `Unreachable`/`NoRoute` (neighbor or route failure).
    pub fn connect(self: &Arc<Self>, addr: Ipv4Addr, port: u16) -> Result<()> {
        if port == 0 || addr.is_any() || addr.is_multicast() {
            return Err(NetError::InvalidArgument("bad remote endpoint"));
        }
        let stack = self.stack()?;
        let route = stack.routes.lookup(addr)?;

        let iss = rand::random::<u32>();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != TcpState::Closed {
                return Err(NetError::InvalidArgument("socket already in use"));
            }
            inner.intf = Some(route.intf.clone());
            inner.local = Endpoint::new(route.src, stack.alloc_port());
            inner.remote = Endpoint::new(addr, port);
            inner.tcb.init_iss(iss);
            inner.sndbuf.reset(iss.wrapping_add(1));
            inner.sync_rcv_wnd();
            inner.mss = tcp_mss_for(&route.intf);
            inner.state = TcpState::SynSent;
            tcp_hash(&stack, inner.quad(), self);
            tcp_start_rto(&stack, self, &mut inner, iss, 0);
        }

        // The SYN leaves without the socket lock held; neighbor
        // resolution may park us here for a while.
        if let Err(err) = tcp_send_empty(self, iss, 0, TCP_FLAG_SYN) {
            let mut inner = self.inner.lock().unwrap();
            tcp_done(&stack, self, &mut inner, Some(err.clone()));
            return Err(err);
        }

        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.snd_timeout.map(|t| Instant::now() + t);
        loop {
            match inner.state {
                TcpState::Established => return Ok(()),
                TcpState::Closed => {
                    return Err(inner.reason.clone().unwrap_or(NetError::ConnReset))
                }
                _ => {}
            }
            let (guard, timed_out) = wait_on(self, inner, deadline);
            inner = guard;
            if timed_out && inner.state != TcpState::Established {
                tcp_done(&stack, self, &mut inner, Some(NetError::Timeout));
                return Err(NetError::Timeout);
            }
        }
    }

    /// Passive open on `(addr, port)`; `Ipv4Addr::ANY` binds every
    /// interface address.
    pub fn listen(self: &Arc<Self>, addr: Ipv4Addr, port: u16, backlog: usize) -> Result<()> {
        if port == 0 {
            return Err(NetError::InvalidArgument("bad local port"));
        }
        let stack = self.stack()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TcpState::Closed {
            return Err(NetError::InvalidArgument("socket already in use"));
        }
        let local = Endpoint::new(addr, port);
        {
            let mut socks = stack.socks.lock().unwrap();
            if socks.listen.contains_key(&local) {
                return Err(NetError::InvalidArgument("port already bound"));
            }
            socks.listen.insert(local, self.clone());
        }
        inner.local = local;
        inner.state = TcpState::Listen;
        inner.backlog = Some(Backlog {
            queue: Default::default(),
            max: backlog.max(1),
        });
        info!("listening on {}:{}", addr, port);
        Ok(())
    }

    /// Take the next established connection off the accept queue.
    pub fn accept(self: &Arc<Self>) -> Result<Arc<TcpSock>> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            if inner.state != TcpState::Listen {
                return Err(NetError::InvalidArgument("socket is not listening"));
            }
            if let Some(child) = inner.backlog.as_mut().and_then(|b| b.queue.pop_front()) {
                return Ok(child);
            }
            let (guard, timed_out) = wait_on(self, inner, deadline);
            inner = guard;
            if timed_out {
                return Err(NetError::Timeout);
            }
        }
    }

    /// Queue octets for transmission. Blocks until at least one octet
    /// fits (all of them under `MSG_WAITALL`), then kicks the send
    /// driver. Returns the octet count enqueued.
    pub fn send(self: &Arc<Self>, buf: &[u8], flags: i32) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut sent = 0;
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.snd_timeout.map(|t| Instant::now() + t);
        loop {
            if inner.wr_shut {
                return Err(NetError::InvalidArgument("send after shutdown"));
            }
            // Pre-connection states wait for the handshake; dead
            // states surface the close reason.
            if !inner.state.writable() {
                match inner.state {
                    TcpState::SynSent | TcpState::SynReceived => {}
                    _ => {
                        return Err(inner.reason.clone().unwrap_or(NetError::ConnReset));
                    }
                }
                let (guard, timed_out) = wait_on(self, inner, deadline);
                inner = guard;
                if timed_out {
                    return Err(NetError::Timeout);
                }
                continue;
            }

            let free = inner.sndbuf.free();
            if free == 0 {
                if flags & MSG_DONTWAIT != 0 {
                    return if sent > 0 {
                        Ok(sent)
                    } else {
                        Err(NetError::NoSpace)
                    };
                }
                let (guard, timed_out) = wait_on(self, inner, deadline);
                inner = guard;
                if timed_out {
                    return if sent > 0 { Ok(sent) } else { Err(NetError::Timeout) };
                }
                continue;
            }

            let chunk = free.min(buf.len() - sent);
            let seq = inner.sndbuf.end();
            inner
                .sndbuf
                .write(seq, &buf[sent..sent + chunk])
                .expect("free space vanished under the lock");
            sent += chunk;

            drop(inner);
            tcp_output(self);

            if sent == buf.len() || flags & MSG_WAITALL == 0 {
                return Ok(sent);
            }
            inner = self.inner.lock().unwrap();
        }
    }

    /// Read in-order octets. Blocks until data or the peer's FIN is
    /// at the delivery point; returns 0 on a clean FIN and `ConnReset`
    /// when the connection was reset.
    pub fn recv(self: &Arc<Self>, buf: &mut [u8], flags: i32) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut read = 0;
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(reason) = inner.reason.clone() {
                return Err(reason);
            }
            if inner.rd_shut {
                return Ok(read);
            }

            let base = inner.rcvbuf.base();
            if inner.rcvbuf.available(base) > 0 {
                let n = inner.rcvbuf.read(base, &mut buf[read..]);
                inner.rcvbuf.consume(n);
                inner.sync_rcv_wnd();
                read += n;
                if read == buf.len() || flags & MSG_WAITALL == 0 {
                    return Ok(read);
                }
                continue;
            }

            // Clean FIN: whatever is read so far, then EOF.
            if inner.fin_rcvd || inner.state == TcpState::Closed {
                return Ok(read);
            }
            if read > 0 && flags & MSG_WAITALL == 0 {
                return Ok(read);
            }
            if flags & MSG_DONTWAIT != 0 {
                return if read > 0 { Ok(read) } else { Err(NetError::Timeout) };
            }
            let (guard, timed_out) = wait_on(self, inner, deadline);
            inner = guard;
            if timed_out {
                return if read > 0 { Ok(read) } else { Err(NetError::Timeout) };
            }
        }
    }

    /// Half-close. `Wr` sends our FIN after any queued data; `Rd`
    /// discards further inbound data and makes subsequent `recv`s
    /// return 0.
    pub fn shutdown(self: &Arc<Self>, how: Shutdown) -> Result<()> {
        let stack = self.stack()?;
        let mut kick = false;
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                TcpState::Closed => return Err(NetError::InvalidArgument("not connected")),
                TcpState::Listen | TcpState::SynSent => {
                    // Nothing on the wire worth closing gracefully.
                    tcp_done(&stack, self, &mut inner, None);
                    return Ok(());
                }
                _ => {}
            }
            if how.reads() && !inner.rd_shut {
                inner.rd_shut = true;
                let drop_len = inner.rcvbuf.len();
                inner.rcvbuf.consume(drop_len);
                inner.sync_rcv_wnd();
                self.wait.notify_all();
            }
            if how.writes() && !inner.wr_shut {
                inner.wr_shut = true;
                kick = true;
            }
        }
        if kick {
            // Drives remaining data out, then the FIN.
            tcp_output(self);
        }
        Ok(())
    }

    /// Full close. Unread inbound data aborts with a reset; otherwise
    /// equivalent to `shutdown(RdWr)` plus dropping this reference.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let stack = self.stack()?;
        let abort = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                TcpState::Closed => return Ok(()),
                TcpState::Listen | TcpState::SynSent => {
                    tcp_done(&stack, self, &mut inner, None);
                    return Ok(());
                }
                _ => {}
            }
            if inner.rcvbuf.len() > 0 || !inner.ooo.is_empty() {
                let snapshot = (inner.local, inner.remote, inner.tcb.snd.nxt);
                tcp_done(&stack, self, &mut inner, Some(NetError::ConnAborted));
                Some(snapshot)
            } else {
                None
            }
        };
        match abort {
            Some((local, remote, seqn)) => {
                let _ = tcp_raw_xmit(
                    &stack,
                    local.addr,
                    remote.addr,
                    local.port,
                    remote.port,
                    seqn,
                    0,
                    TCP_FLAG_RST,
                );
                Ok(())
            }
            None => self.shutdown(Shutdown::RdWr),
        }
    }

    /// `TCP_NODELAY`: disable delayed-ACK coalescing.
    pub fn set_nodelay(&self, on: bool) {
        self.inner.lock().unwrap().nodelay = on;
    }

    pub fn nodelay(&self) -> bool {
        self.inner.lock().unwrap().nodelay
    }

    /// `TCP_MAXSEG`: the effective maximum segment size.
    pub fn max_seg(&self) -> u16 {
        self.inner.lock().unwrap().mss
    }

    /// `SO_RCVTIMEO`.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().unwrap().rcv_timeout = timeout;
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().rcv_timeout
    }

    /// `SO_SNDTIMEO`; also bounds `connect`.
    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().unwrap().snd_timeout = timeout;
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().snd_timeout
    }

    /// Keep-alive probing; disabled by default.
    pub fn set_keepalive(self: &Arc<Self>, interval: Option<Duration>) -> Result<()> {
        let stack = self.stack()?;
        let mut inner = self.inner.lock().unwrap();
        tcp_set_keepalive(&stack, self, &mut inner, interval);
        Ok(())
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.inner.lock().unwrap().keepalive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{establish, parse_arp_request, rig, PEER_IP};
    use crate::types::tcp::{
        TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn three_way_handshake() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        let connector = {
            let sock = sock.clone();
            thread::spawn(move || sock.connect(PEER_IP, 80))
        };

        let syn = peer.expect_tcp();
        assert_eq!(syn.flags, TCP_FLAG_SYN);
        assert_eq!(syn.sport, 40000); // first ephemeral port
        assert_eq!(syn.dport, 80);
        assert_eq!(syn.wnd, 65535);
        // MTU 1500 supports far more than the 536 default.
        assert_eq!(syn.mss, Some(1460));
        let x = syn.seq;

        let y = 90_000u32;
        peer.send_tcp(80, 40000, y, x.wrapping_add(1), TCP_FLAG_SYN | TCP_FLAG_ACK, 65535, &[]);

        let ack = peer.expect_tcp();
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.seq, x.wrapping_add(1));
        assert_eq!(ack.ack, y.wrapping_add(1));

        connector.join().unwrap().unwrap();
        assert_eq!(sock.state(), TcpState::Established);
        assert_eq!(sock.snd_una(), x.wrapping_add(1));
        assert_eq!(sock.rcv_nxt(), y.wrapping_add(1));
        stack.stop();
    }

    #[test]
    fn echo_one_hundred_bytes() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        sock.set_nodelay(true);
        let mut conn = establish(&peer, &sock, 80, 7000);
        let first_data = sock.iss().wrapping_add(1);

        assert_eq!(sock.send(&[b'A'; 100], 0).unwrap(), 100);
        let data = peer.expect_tcp();
        assert_eq!(data.seq, first_data);
        assert_eq!(data.payload, vec![b'A'; 100]);
        assert!(data.has(TCP_FLAG_PSH));

        // Acknowledge and echo in one segment.
        conn.ack = first_data.wrapping_add(100);
        peer.send_seg(&mut conn, 0, &[b'A'; 100]);

        let mut buf = [0u8; 100];
        assert_eq!(sock.recv(&mut buf, 0).unwrap(), 100);
        assert_eq!(buf, [b'A'; 100]);

        // The echo is acknowledged on the wire (nodelay, so at once).
        let ack = peer.expect_tcp();
        assert_eq!(ack.ack, conn.seq);

        assert_eq!(sock.snd_una(), first_data.wrapping_add(100));
        assert_eq!(sock.rcv_nxt(), 7001 + 100);
        wait_for("unacked list to drain", || sock.unacked_len() == 0);
        stack.stop();
    }

    #[test]
    fn lost_segment_retransmits_identically() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        let mut conn = establish(&peer, &sock, 80, 3000);

        assert_eq!(sock.send(&[b'x'; 50], 0).unwrap(), 50);
        let original = peer.expect_tcp();
        assert_eq!(original.payload.len(), 50);

        // Withhold the ACK; the initial 200ms RTO re-emits the same
        // segment.
        let armed_at = Instant::now();
        let retrans = peer.expect_tcp();
        let waited = armed_at.elapsed();
        assert!(
            waited >= Duration::from_millis(100) && waited <= Duration::from_millis(1200),
            "retransmission after {:?}",
            waited
        );
        assert_eq!(retrans.seq, original.seq);
        assert_eq!(retrans.payload, original.payload);

        conn.ack = original.seq.wrapping_add(50);
        peer.send_seg(&mut conn, 0, &[]);
        wait_for("unacked list to drain", || sock.unacked_len() == 0);
        // Acknowledged data is never re-emitted.
        peer.expect_quiet(Duration::from_millis(600));
        stack.stop();
    }

    #[test]
    fn simultaneous_close_reaches_time_wait() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        let conn = establish(&peer, &sock, 80, 5000);

        sock.shutdown(Shutdown::Wr).unwrap();
        let fin = peer.expect_tcp();
        assert!(fin.has(TCP_FLAG_FIN));
        let fin_seq = fin.seq;
        assert_eq!(sock.state(), TcpState::FinWait1);

        // Our FIN crosses the peer's: theirs acknowledges nothing.
        peer.send_tcp(
            conn.port,
            conn.stack_port,
            conn.seq,
            fin_seq,
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            65535,
            &[],
        );
        let ack = peer.expect_tcp();
        assert_eq!(ack.ack, conn.seq.wrapping_add(1));
        wait_for("CLOSING", || sock.state() == TcpState::Closing);

        // Now the peer acknowledges our FIN.
        peer.send_tcp(
            conn.port,
            conn.stack_port,
            conn.seq.wrapping_add(1),
            fin_seq.wrapping_add(1),
            TCP_FLAG_ACK,
            65535,
            &[],
        );
        wait_for("TIME-WAIT", || sock.state() == TcpState::TimeWait);

        // 2MSL later the socket is gone.
        crate::tcp::timer::tcp_timewait_expire(&sock);
        assert_eq!(sock.state(), TcpState::Closed);
        stack.stop();
    }

    #[test]
    fn concurrent_connects_share_one_arp_request() {
        let (stack, _intf, peer) = rig();
        let s1 = stack.tcp_socket();
        let s2 = stack.tcp_socket();
        let t1 = {
            let s1 = s1.clone();
            thread::spawn(move || s1.connect(PEER_IP, 80))
        };
        let t2 = {
            let s2 = s2.clone();
            thread::spawn(move || s2.connect(PEER_IP, 81))
        };

        // Exactly one who-has goes out for both pending connects.
        let frame = peer.dev.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(parse_arp_request(&frame), Some(PEER_IP));
        assert!(
            peer.dev.recv_timeout(Duration::from_millis(400)).is_none(),
            "second resolver must join the pending entry"
        );
        peer.send_arp(crate::types::arp::ARP_OP_REPLY, peer.stack_hw);

        // Both gated SYNs proceed.
        let syn_a = peer.expect_tcp();
        let syn_b = peer.expect_tcp();
        let mut ports = [syn_a.dport, syn_b.dport];
        ports.sort_unstable();
        assert_eq!(ports, [80, 81]);

        for syn in [syn_a, syn_b] {
            peer.send_tcp(
                syn.dport,
                syn.sport,
                1000,
                syn.seq.wrapping_add(1),
                TCP_FLAG_SYN | TCP_FLAG_ACK,
                65535,
                &[],
            );
        }
        peer.expect_tcp();
        peer.expect_tcp();
        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();
        stack.stop();
    }

    #[test]
    fn out_of_order_segments_reassemble() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        sock.set_nodelay(true);
        // Peer ISS 99 puts its first data octet at sequence 100.
        let conn = establish(&peer, &sock, 80, 99);

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let sock = sock.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 30];
                let n = sock.recv(&mut buf, MSG_WAITALL).unwrap();
                done.store(true, Ordering::SeqCst);
                (n, buf)
            })
        };

        peer.send_tcp(conn.port, conn.stack_port, 100, conn.ack, TCP_FLAG_ACK, 65535, b"aaaaaaaaaa");
        peer.send_tcp(conn.port, conn.stack_port, 120, conn.ack, TCP_FLAG_ACK, 65535, b"cccccccccc");
        thread::sleep(Duration::from_millis(200));
        assert!(
            !done.load(Ordering::SeqCst),
            "recv returned with the middle segment missing"
        );

        peer.send_tcp(conn.port, conn.stack_port, 110, conn.ack, TCP_FLAG_ACK, 65535, b"bbbbbbbbbb");
        let (n, buf) = reader.join().unwrap();
        assert_eq!(n, 30);
        assert_eq!(&buf[..], b"aaaaaaaaaabbbbbbbbbbcccccccccc");
        assert_eq!(sock.rcv_nxt(), 130);
        stack.stop();
    }

    #[test]
    fn rst_during_handshake_is_refused() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        let connector = {
            let sock = sock.clone();
            thread::spawn(move || sock.connect(PEER_IP, 80))
        };
        let syn = peer.expect_tcp();
        peer.send_tcp(
            80,
            syn.sport,
            0,
            syn.seq.wrapping_add(1),
            TCP_FLAG_RST | TCP_FLAG_ACK,
            0,
            &[],
        );
        assert_eq!(connector.join().unwrap(), Err(NetError::Refused));
        assert_eq!(sock.state(), TcpState::Closed);
        stack.stop();
    }

    #[test]
    fn connect_deadline_times_out() {
        let (stack, _intf, peer) = rig();
        peer.announce();
        let sock = stack.tcp_socket();
        sock.set_send_timeout(Some(Duration::from_millis(300)));
        let started = Instant::now();
        let err = sock.connect(PEER_IP, 80).unwrap_err();
        assert_eq!(err, NetError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sock.state(), TcpState::Closed);
        stack.stop();
    }

    #[test]
    fn listen_accept_exchange_and_close() {
        let (stack, _intf, peer) = rig();
        let listener = stack.tcp_socket();
        listener
            .listen(crate::types::Ipv4Addr::ANY, 80, 4)
            .unwrap();
        assert_eq!(listener.state(), TcpState::Listen);

        peer.announce();
        peer.send_tcp(4321, 80, 500, 0, TCP_FLAG_SYN, 65535, &[]);
        let synack = peer.expect_tcp();
        assert!(synack.syn() && synack.has(TCP_FLAG_ACK));
        assert_eq!(synack.ack, 501);
        assert_eq!(synack.mss, Some(1460));
        let child_iss = synack.seq;
        peer.send_tcp(4321, 80, 501, child_iss.wrapping_add(1), TCP_FLAG_ACK, 65535, &[]);

        let child = listener.accept().unwrap();
        assert_eq!(child.state(), TcpState::Established);
        assert_eq!(
            child.remote_endpoint().unwrap(),
            Endpoint::new(PEER_IP, 4321)
        );
        child.set_nodelay(true);

        peer.send_tcp(4321, 80, 501, child_iss.wrapping_add(1), TCP_FLAG_ACK, 65535, b"hello");
        let mut buf = [0u8; 16];
        assert_eq!(child.recv(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        assert_eq!(child.send(b"world", 0).unwrap(), 5);
        let reply = loop {
            let seg = peer.expect_tcp();
            if !seg.payload.is_empty() {
                break seg;
            }
        };
        assert_eq!(reply.payload, b"world");
        assert_eq!(reply.seq, child_iss.wrapping_add(1));

        // Peer closes its half.
        peer.send_tcp(
            4321,
            80,
            506,
            reply.seq.wrapping_add(5),
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            65535,
            &[],
        );
        assert_eq!(child.recv(&mut buf, 0).unwrap(), 0);
        wait_for("CLOSE-WAIT", || child.state() == TcpState::CloseWait);

        // Our close finishes the other half.
        child.close().unwrap();
        let fin = loop {
            let seg = peer.expect_tcp();
            if seg.has(TCP_FLAG_FIN) {
                break seg;
            }
        };
        peer.send_tcp(4321, 80, 507, fin.seq.wrapping_add(1), TCP_FLAG_ACK, 65535, &[]);
        wait_for("CLOSED", || child.state() == TcpState::Closed);
        stack.stop();
    }

    #[test]
    fn segment_to_closed_port_draws_reset() {
        let (stack, _intf, peer) = rig();
        peer.announce();
        peer.send_tcp(5555, 9999, 42, 0, TCP_FLAG_SYN, 65535, &[]);
        let rst = peer.expect_tcp();
        assert!(rst.has(TCP_FLAG_RST) && rst.has(TCP_FLAG_ACK));
        assert_eq!(rst.seq, 0);
        // SYN occupies one sequence number.
        assert_eq!(rst.ack, 43);
        stack.stop();
    }

    #[test]
    fn reset_mid_connection_surfaces_conn_reset() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        let conn = establish(&peer, &sock, 80, 2000);
        peer.send_tcp(
            conn.port,
            conn.stack_port,
            conn.seq,
            conn.ack,
            TCP_FLAG_RST | TCP_FLAG_ACK,
            0,
            &[],
        );
        wait_for("CLOSED", || sock.state() == TcpState::Closed);
        let mut buf = [0u8; 4];
        assert_eq!(sock.recv(&mut buf, 0), Err(NetError::ConnReset));
        assert_eq!(sock.send(b"zz", 0), Err(NetError::ConnReset));
        stack.stop();
    }

    #[test]
    fn shutdown_semantics() {
        let (stack, _intf, peer) = rig();
        let sock = stack.tcp_socket();
        let _conn = establish(&peer, &sock, 80, 1000);

        sock.shutdown(Shutdown::Rd).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(sock.recv(&mut buf, 0).unwrap(), 0);

        sock.shutdown(Shutdown::Wr).unwrap();
        let fin = peer.expect_tcp();
        assert!(fin.has(TCP_FLAG_FIN));
        assert_eq!(sock.state(), TcpState::FinWait1);
        assert_eq!(
            sock.send(b"late", 0),
            Err(NetError::InvalidArgument("send after shutdown"))
        );
        stack.stop();
    }

    #[test]
    fn connect_without_route_fails() {
        let (stack, _intf, _peer) = rig();
        let sock = stack.tcp_socket();
        let err = sock
            .connect(crate::types::Ipv4Addr::new(192, 168, 7, 7), 80)
            .unwrap_err();
        assert_eq!(err, NetError::NoRoute);
        assert_eq!(sock.state(), TcpState::Closed);
        stack.stop();
    }
}
