//! Scripted-peer harness: a stack on one end of a [`PipeDev`] pair and
//! a hand-driven peer on the other, so tests can exercise exact wire
//! exchanges without a real interface.

use std::sync::Arc;
use std::time::Duration;

use crate::iface::Interface;
use crate::netdev::pipe::PipeDev;
use crate::netdev::NetDev;
use crate::stack::NetStack;
use crate::types::arp::{Arp, ARP_HRD_ETHER, ARP_HRD_SZ, ARP_OP_REPLY, ARP_OP_REQUEST};
use crate::types::ether::{EtherHeader, ETH_HRD_SZ};
use crate::types::ipv4::{Ipv4Header, IP_ALEN, IP_HRD_SZ};
use crate::types::pkbuf::PacketBuffer;
use crate::types::tcp::{TcpHeader, TCP_FLAG_ACK, TCP_FLAG_SYN, TCP_HRD_SZ};
use crate::types::{HardwareAddr, Ipv4Addr, Ipv4Mask};
use crate::utils::checksum;

pub(crate) const STACK_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub(crate) const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(crate) const PEER_HW: HardwareAddr = HardwareAddr::new([0x02, 0x42, 0, 0, 0, 0x01]);

const WAIT: Duration = Duration::from_secs(3);

/// The scripted far end of the link.
pub(crate) struct Peer {
    pub dev: Arc<PipeDev>,
    pub hw: HardwareAddr,
    pub ip: Ipv4Addr,
    pub stack_hw: HardwareAddr,
    pub stack_ip: Ipv4Addr,
}

/// One scripted TCP connection, tracking the peer-side sequence state.
pub(crate) struct PeerConn {
    /// Peer's port.
    pub port: u16,
    /// Stack's port.
    pub stack_port: u16,
    /// Peer's next send sequence.
    pub seq: u32,
    /// Next stack octet the peer acknowledges.
    pub ack: u32,
}

/// A parsed-and-verified emitted segment.
#[derive(Debug)]
pub(crate) struct SegView {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub wnd: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl SegView {
    pub fn syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

pub(crate) fn rig() -> (Arc<NetStack>, Arc<Interface>, Peer) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (stack_dev, peer_dev) = PipeDev::pair(1500);
    let stack = NetStack::new();
    let intf = stack.add_interface("pipe0", stack_dev.clone(), STACK_IP, Ipv4Mask::prefix_new(24));
    let peer = Peer {
        dev: peer_dev,
        hw: PEER_HW,
        ip: PEER_IP,
        stack_hw: stack_dev.hwaddr(),
        stack_ip: STACK_IP,
    };
    (stack, intf, peer)
}

impl Peer {
    /// Announce ourselves: an ARP request for the stack's address,
    /// which both seeds the stack's cache with our binding and gets a
    /// reply. Real peers do this before their first TCP segment.
    pub fn announce(&self) {
        self.send_arp(ARP_OP_REQUEST, HardwareAddr::new([0; 6]));
        let frame = self
            .dev
            .recv_timeout(WAIT)
            .expect("no arp reply from the stack");
        assert!(parse_arp(&frame).is_some(), "expected an arp reply");
    }

    pub fn send_arp(&self, op: u16, target_hw: HardwareAddr) {
        let mut pk = PacketBuffer::new_tx(ETH_HRD_SZ + ARP_HRD_SZ, ETH_HRD_SZ);
        pk.append_uninit(ARP_HRD_SZ);
        {
            let arp = pk.data_hdr_mut::<Arp>();
            arp.set_hardware_type(ARP_HRD_ETHER);
            arp.set_protocol_type(libc::ETH_P_IP as u16);
            arp.set_hardware_len(libc::ETH_ALEN as u8);
            arp.set_protocol_len(IP_ALEN);
            arp.set_operation(op);
            arp.set_source_hardware_addr(self.hw);
            arp.set_source_ipv4_addr(self.ip);
            arp.set_target_hardware_addr(target_hw);
            arp.set_target_ipv4_addr(self.stack_ip);
        }
        pk.push_head(ETH_HRD_SZ);
        {
            let eth = pk.hdr_mut::<EtherHeader>();
            eth.set_dst(if op == ARP_OP_REQUEST {
                HardwareAddr::BROADCAST
            } else {
                self.stack_hw
            });
            eth.set_src(self.hw);
            eth.set_protocol(libc::ETH_P_ARP as u16);
        }
        self.dev.xmit(pk.frame_bytes()).unwrap();
    }

    /// Next TCP segment from the stack, answering any ARP requests
    /// that arrive in between. Panics after the timeout.
    pub fn expect_tcp(&self) -> SegView {
        self.expect_tcp_within(WAIT).expect("no tcp segment emitted")
    }

    pub fn expect_tcp_within(&self, timeout: Duration) -> Option<SegView> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let frame = self.dev.recv_timeout(deadline - now)?;
            if let Some(target) = parse_arp_request(&frame) {
                if target == self.ip {
                    self.send_arp(ARP_OP_REPLY, self.stack_hw);
                }
                continue;
            }
            if let Some(seg) = parse_tcp_frame(&frame) {
                return Some(seg);
            }
        }
    }

    /// Assert nothing TCP is emitted for `dur`.
    pub fn expect_quiet(&self, dur: Duration) {
        if let Some(seg) = self.expect_tcp_within(dur) {
            panic!("unexpected segment: {:?}", seg);
        }
    }

    /// Build and transmit one segment from the peer.
    pub fn send_tcp(
        &self,
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        wnd: u16,
        payload: &[u8],
    ) {
        let headroom = ETH_HRD_SZ + IP_HRD_SZ + TCP_HRD_SZ;
        let mut pk = PacketBuffer::new_tx(headroom + payload.len(), headroom);
        pk.append(payload);
        pk.push_head(TCP_HRD_SZ);
        {
            let hdr = pk.hdr_mut::<TcpHeader>();
            hdr.set_sport(sport);
            hdr.set_dport(dport);
            hdr.set_seqn(seq);
            hdr.set_ackn(ack);
            hdr.set_header_len(TCP_HRD_SZ);
            hdr.set_flags(flags);
            hdr.set_wind(wnd);
            hdr.set_csum(0);
            hdr.set_urg_ptr(0);
        }
        let acc = checksum::pseudo(
            self.ip,
            self.stack_ip,
            libc::IPPROTO_TCP as u8,
            pk.pkt_len() as u16,
        );
        let csum = checksum::finish(pk.frame_bytes(), acc);
        pk.hdr_mut::<TcpHeader>().set_csum(csum);

        let total_len = (IP_HRD_SZ + pk.pkt_len()) as u16;
        pk.push_head(IP_HRD_SZ);
        pk.hdr_mut::<Ipv4Header>().build(
            total_len,
            1,
            libc::IPPROTO_TCP as u8,
            self.ip,
            self.stack_ip,
        );

        pk.push_head(ETH_HRD_SZ);
        {
            let eth = pk.hdr_mut::<EtherHeader>();
            eth.set_dst(self.stack_hw);
            eth.set_src(self.hw);
            eth.set_protocol(libc::ETH_P_IP as u16);
        }
        self.dev.xmit(pk.frame_bytes()).unwrap();
    }

    /// Segment on an established scripted connection; advances the
    /// peer-side sequence bookkeeping.
    pub fn send_seg(&self, conn: &mut PeerConn, flags: u8, payload: &[u8]) {
        self.send_tcp(
            conn.port,
            conn.stack_port,
            conn.seq,
            conn.ack,
            flags | TCP_FLAG_ACK,
            65535,
            payload,
        );
        conn.seq = conn.seq.wrapping_add(payload.len() as u32);
        if flags & crate::types::tcp::TCP_FLAG_FIN != 0 {
            conn.seq = conn.seq.wrapping_add(1);
        }
    }
}

/// Complete an active open from the stack side: `sock.connect` runs in
/// a spawned thread while the peer scripts ARP and the handshake.
/// Returns the established connection with `peer_iss + 1` as the
/// peer's next sequence.
pub(crate) fn establish(
    peer: &Peer,
    sock: &Arc<crate::tcp::TcpSock>,
    peer_port: u16,
    peer_iss: u32,
) -> PeerConn {
    let connector = {
        let sock = sock.clone();
        std::thread::spawn(move || sock.connect(PEER_IP, peer_port))
    };

    let syn = peer.expect_tcp();
    assert!(syn.syn() && !syn.has(TCP_FLAG_ACK), "expected a bare syn");
    assert_eq!(syn.dport, peer_port);
    let iss = syn.seq;

    peer.send_tcp(
        peer_port,
        syn.sport,
        peer_iss,
        iss.wrapping_add(1),
        TCP_FLAG_SYN | TCP_FLAG_ACK,
        65535,
        &[],
    );

    let ack = peer.expect_tcp();
    assert!(ack.has(TCP_FLAG_ACK) && !ack.syn());
    assert_eq!(ack.seq, iss.wrapping_add(1));
    assert_eq!(ack.ack, peer_iss.wrapping_add(1));

    connector.join().unwrap().unwrap();
    assert_eq!(sock.state(), crate::tcp::TcpState::Established);

    PeerConn {
        port: peer_port,
        stack_port: syn.sport,
        seq: peer_iss.wrapping_add(1),
        ack: iss.wrapping_add(1),
    }
}

/// Parse an emitted frame as TCP, verifying both checksums on the way.
pub(crate) fn parse_tcp_frame(frame: &[u8]) -> Option<SegView> {
    if frame.len() < ETH_HRD_SZ + IP_HRD_SZ {
        return None;
    }
    let eth = unsafe { &*(frame.as_ptr() as *const EtherHeader) };
    if eth.protocol() as i32 != libc::ETH_P_IP {
        return None;
    }
    let ip = unsafe { &*(frame[ETH_HRD_SZ..].as_ptr() as *const Ipv4Header) };
    if ip.protocol() as i32 != libc::IPPROTO_TCP {
        return None;
    }
    assert!(ip.verify_checksum(), "emitted ip header fails checksum");
    let tcp_off = ETH_HRD_SZ + ip.header_len();
    let tcp_len = ip.total_len() - ip.header_len();
    let tcp_bytes = &frame[tcp_off..tcp_off + tcp_len];

    let acc = checksum::pseudo(
        ip.src_addr(),
        ip.dst_addr(),
        libc::IPPROTO_TCP as u8,
        tcp_len as u16,
    );
    assert_eq!(
        checksum::fold(checksum::sum(tcp_bytes, acc)),
        !0,
        "emitted tcp segment fails checksum"
    );

    let hdr = unsafe { &*(tcp_bytes.as_ptr() as *const TcpHeader) };
    let hlen = hdr.header_len();
    Some(SegView {
        sport: hdr.sport(),
        dport: hdr.dport(),
        seq: hdr.seqn(),
        ack: hdr.ackn(),
        flags: hdr.flags(),
        wnd: hdr.wind(),
        mss: crate::types::tcp::mss_option(&tcp_bytes[TCP_HRD_SZ..hlen]),
        payload: tcp_bytes[hlen..].to_vec(),
    })
}

fn parse_arp(frame: &[u8]) -> Option<&Arp> {
    if frame.len() < ETH_HRD_SZ + ARP_HRD_SZ {
        return None;
    }
    let eth = unsafe { &*(frame.as_ptr() as *const EtherHeader) };
    if eth.protocol() as i32 != libc::ETH_P_ARP {
        return None;
    }
    Some(unsafe { &*(frame[ETH_HRD_SZ..].as_ptr() as *const Arp) })
}

/// Target address of an ARP request frame, if that is what this is.
pub(crate) fn parse_arp_request(frame: &[u8]) -> Option<Ipv4Addr> {
    let arp = parse_arp(frame)?;
    (arp.operation() == ARP_OP_REQUEST).then(|| arp.target_ipv4_addr())
}
