//! ARP cache and neighbor resolution.
//!
//! Each interface owns a table of `Ipv4Addr -> ArpEntry`. Senders call
//! `resolve`, which either returns a cached binding or parks the
//! caller on the entry's condvar while one request is on the wire.
//! Concurrent resolvers for the same target share the entry: the
//! thread that flips it Unknown -> Pending emits the request, everyone
//! else joins the wait.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, trace};

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::types::arp::{
    Arp, ARP_HRD_ETHER, ARP_HRD_SZ, ARP_OP_REPLY, ARP_OP_REQUEST,
};
use crate::types::ether::{EtherHeader, ETH_HRD_SZ};
use crate::types::ipv4::IP_ALEN;
use crate::types::pkbuf::{PacketBuffer, PkBuf};
use crate::types::{HardwareAddr, Ipv4Addr};

use super::link::net_xmit;

pub const ARP_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Unknown,
    Pending { since: Instant },
    Resolved { hwaddr: HardwareAddr },
    Permanent { hwaddr: HardwareAddr },
}

#[derive(Debug)]
pub struct ArpEntry {
    state: Mutex<ArpState>,
    cond: Condvar,
}

impl ArpEntry {
    fn new(state: ArpState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }

    /// Install a binding and wake queued senders.
    fn resolve_to(&self, hwaddr: HardwareAddr) {
        let mut st = self.state.lock().unwrap();
        if matches!(*st, ArpState::Permanent { .. }) {
            return;
        }
        let was_pending = matches!(*st, ArpState::Pending { .. });
        *st = ArpState::Resolved { hwaddr };
        if was_pending {
            info!("arp pending entry resolved, draining queued senders");
        }
        self.cond.notify_all();
    }
}

#[derive(Debug)]
pub struct ArpTable {
    entries: Mutex<HashMap<Ipv4Addr, Arc<ArpEntry>>>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, ipaddr: Ipv4Addr) -> Arc<ArpEntry> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(ipaddr)
            .or_insert_with(|| ArpEntry::new(ArpState::Unknown))
            .clone()
    }

    fn get(&self, ipaddr: Ipv4Addr) -> Option<Arc<ArpEntry>> {
        self.entries.lock().unwrap().get(&ipaddr).cloned()
    }

    /// Non-blocking lookup of an already-known binding.
    pub fn cached(&self, ipaddr: Ipv4Addr) -> Option<HardwareAddr> {
        let entry = self.get(ipaddr)?;
        let st = entry.state.lock().unwrap();
        match *st {
            ArpState::Resolved { hwaddr } | ArpState::Permanent { hwaddr } => Some(hwaddr),
            _ => None,
        }
    }

    pub fn insert_permanent(&self, ipaddr: Ipv4Addr, hwaddr: HardwareAddr) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(ipaddr)
            .or_insert_with(|| ArpEntry::new(ArpState::Unknown));
        *entry.state.lock().unwrap() = ArpState::Permanent { hwaddr };
        entry.cond.notify_all();
    }

    /// Forget every learned binding. Pending waiters fail over to a
    /// fresh request on their next wakeup.
    pub fn flush(&self) {
        let entries = self.entries.lock().unwrap();
        for entry in entries.values() {
            let mut st = entry.state.lock().unwrap();
            if matches!(*st, ArpState::Resolved { .. }) {
                *st = ArpState::Unknown;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(Ipv4Addr, ArpState)> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(ip, entry)| (*ip, *entry.state.lock().unwrap()))
            .collect()
    }
}

/// Map `target` to a hardware address, blocking up to
/// `ARP_WAIT_TIMEOUT` while a request is outstanding.
pub fn resolve(intf: &Arc<Interface>, target: Ipv4Addr) -> Result<HardwareAddr> {
    resolve_timeout(intf, target, ARP_WAIT_TIMEOUT)
}

pub(crate) fn resolve_timeout(
    intf: &Arc<Interface>,
    target: Ipv4Addr,
    timeout: Duration,
) -> Result<HardwareAddr> {
    let entry = intf.arptbl.entry(target);
    let deadline = Instant::now() + timeout;
    let mut st = entry.state.lock().unwrap();
    loop {
        match *st {
            ArpState::Resolved { hwaddr } | ArpState::Permanent { hwaddr } => return Ok(hwaddr),
            ArpState::Unknown => {
                *st = ArpState::Pending {
                    since: Instant::now(),
                };
                drop(st);
                if let Err(err) = arp_send_req(intf, target) {
                    let mut st = entry.state.lock().unwrap();
                    *st = ArpState::Unknown;
                    entry.cond.notify_all();
                    return Err(err);
                }
                st = entry.state.lock().unwrap();
            }
            ArpState::Pending { .. } => {
                let now = Instant::now();
                if now >= deadline {
                    *st = ArpState::Unknown;
                    entry.cond.notify_all();
                    return Err(NetError::Unreachable);
                }
                let (guard, _) = entry.cond.wait_timeout(st, deadline - now).unwrap();
                st = guard;
            }
        }
    }
}

/// Process one received ARP message.
pub fn arp_in(intf: &Arc<Interface>, pkbuf: PkBuf) -> Result<()> {
    let (sender_hw, sender_ip, target_ip, opcode) = {
        let pk = pkbuf.read().unwrap();
        if pk.data_len() < ARP_HRD_SZ {
            return Err(NetError::Io("arp message too short".into()));
        }
        let eth_hdr = pk.hdr::<EtherHeader>();
        let arp_hdr = pk.data_hdr::<Arp>();
        if arp_hdr.source_hardware_addr() != eth_hdr.src() {
            return Err(NetError::Io("arp sender address mismatch".into()));
        }
        if arp_hdr.hardware_type() != ARP_HRD_ETHER
            || arp_hdr.protocol_type() as i32 != libc::ETH_P_IP
            || arp_hdr.hardware_len() as i32 != libc::ETH_ALEN
            || arp_hdr.protocol_len() != IP_ALEN
        {
            return Err(NetError::Io("unsupported arp binding".into()));
        }
        if arp_hdr.operation() != ARP_OP_REQUEST && arp_hdr.operation() != ARP_OP_REPLY {
            return Err(NetError::Io("unsupported arp opcode".into()));
        }
        if arp_hdr.target_ipv4_addr().is_multicast() {
            return Err(NetError::Io("arp target multicast".into()));
        }
        (
            arp_hdr.source_hardware_addr(),
            arp_hdr.source_ipv4_addr(),
            arp_hdr.target_ipv4_addr(),
            arp_hdr.operation(),
        )
    };

    // Learn the sender's binding even when we are not the target; a
    // request additionally seeds a fresh entry.
    if let Some(entry) = intf.arptbl.get(sender_ip) {
        entry.resolve_to(sender_hw);
    } else if opcode == ARP_OP_REQUEST && !sender_ip.is_any() {
        intf.arptbl
            .entry(sender_ip)
            .resolve_to(sender_hw);
    }
    trace!("{}: arp table {:?}", intf.name(), intf.arptbl.snapshot());

    if opcode == ARP_OP_REQUEST && target_ip == intf.ipv4_addr() {
        arp_reply(intf, pkbuf)?;
    }
    Ok(())
}

/// Turn a request around in place and send it back.
fn arp_reply(intf: &Arc<Interface>, pkbuf: PkBuf) -> Result<()> {
    let requester = {
        let mut pk = pkbuf.write().unwrap();
        let our_hw = intf.hwaddr();
        let our_ip = intf.ipv4_addr();

        let arp_hdr = pk.data_hdr_mut::<Arp>();
        arp_hdr.set_operation(ARP_OP_REPLY);
        let requester_hw = arp_hdr.source_hardware_addr();
        let requester_ip = arp_hdr.source_ipv4_addr();
        arp_hdr.set_target_hardware_addr(requester_hw);
        arp_hdr.set_target_ipv4_addr(requester_ip);
        arp_hdr.set_source_hardware_addr(our_hw);
        arp_hdr.set_source_ipv4_addr(our_ip);

        // The ether header is still in front of `data`; re-address it.
        let eth_hdr = pk.hdr_mut::<EtherHeader>();
        eth_hdr.set_dst(requester_hw);
        eth_hdr.set_src(our_hw);
        requester_hw
    };

    info!("{}: arp reply to {}", intf.name(), requester);
    intf.queue_xmit(pkbuf)
}

/// Broadcast one request for `target`.
fn arp_send_req(intf: &Arc<Interface>, target: Ipv4Addr) -> Result<()> {
    let mut pk = PacketBuffer::new_tx(ETH_HRD_SZ + ARP_HRD_SZ, ETH_HRD_SZ);
    pk.append_uninit(ARP_HRD_SZ);
    {
        let arp_hdr = pk.data_hdr_mut::<Arp>();
        arp_hdr.set_hardware_type(ARP_HRD_ETHER);
        arp_hdr.set_protocol_type(libc::ETH_P_IP as u16);
        arp_hdr.set_hardware_len(libc::ETH_ALEN as u8);
        arp_hdr.set_protocol_len(IP_ALEN);
        arp_hdr.set_operation(ARP_OP_REQUEST);
        arp_hdr.set_source_hardware_addr(intf.hwaddr());
        arp_hdr.set_source_ipv4_addr(intf.ipv4_addr());
        arp_hdr.set_target_hardware_addr(HardwareAddr::new([0; 6]));
        arp_hdr.set_target_ipv4_addr(target);
    }
    info!("{}: arp who-has {}", intf.name(), target);
    net_xmit(
        intf,
        pk.shared(),
        HardwareAddr::BROADCAST,
        libc::ETH_P_ARP as u16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{parse_arp_request, rig, PEER_HW, PEER_IP, STACK_IP};
    use std::thread;

    fn parse_arp(frame: &[u8]) -> &Arp {
        let eth = unsafe { &*(frame.as_ptr() as *const EtherHeader) };
        assert_eq!(eth.protocol() as i32, libc::ETH_P_ARP);
        unsafe { &*(frame[ETH_HRD_SZ..].as_ptr() as *const Arp) }
    }

    #[test]
    fn replies_to_requests_for_our_address() {
        let (stack, intf, peer) = rig();
        peer.send_arp(ARP_OP_REQUEST, HardwareAddr::new([0; 6]));

        let frame = peer
            .dev
            .recv_timeout(Duration::from_secs(3))
            .expect("no reply emitted");
        let reply = parse_arp(&frame);
        assert_eq!(reply.operation(), ARP_OP_REPLY);
        assert_eq!(reply.source_ipv4_addr(), STACK_IP);
        assert_eq!(reply.source_hardware_addr(), intf.hwaddr());
        assert_eq!(reply.target_ipv4_addr(), PEER_IP);
        assert_eq!(reply.target_hardware_addr(), PEER_HW);

        // The requester's binding was learned on the way through.
        assert_eq!(intf.arptbl.cached(PEER_IP), Some(PEER_HW));
        stack.stop();
    }

    #[test]
    fn resolve_returns_cached_binding_without_traffic() {
        let (stack, intf, peer) = rig();
        peer.announce();
        let hw = resolve(&intf, PEER_IP).unwrap();
        assert_eq!(hw, PEER_HW);
        assert!(peer.dev.recv_timeout(Duration::from_millis(200)).is_none());
        stack.stop();
    }

    #[test]
    fn resolve_emits_one_request_and_wakes_waiters() {
        let (stack, intf, peer) = rig();
        let waiter = {
            let intf = intf.clone();
            thread::spawn(move || resolve(&intf, PEER_IP))
        };
        let frame = peer
            .dev
            .recv_timeout(Duration::from_secs(3))
            .expect("no request emitted");
        assert_eq!(parse_arp_request(&frame), Some(PEER_IP));
        peer.send_arp(ARP_OP_REPLY, peer.stack_hw);
        assert_eq!(waiter.join().unwrap().unwrap(), PEER_HW);
        stack.stop();
    }

    #[test]
    fn resolve_times_out_unreachable() {
        let (stack, intf, peer) = rig();
        let target = Ipv4Addr::new(10, 0, 0, 77);
        let err = resolve_timeout(&intf, target, Duration::from_millis(150)).unwrap_err();
        assert_eq!(err, NetError::Unreachable);
        // One request went out; the entry fell back to Unknown.
        let frame = peer.dev.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(parse_arp_request(&frame), Some(target));
        assert_eq!(intf.arptbl.cached(target), None);
        stack.stop();
    }

    #[test]
    fn reply_updates_existing_binding() {
        let (stack, intf, peer) = rig();
        peer.announce();
        assert_eq!(intf.arptbl.cached(PEER_IP), Some(PEER_HW));

        // The peer shows up with new hardware.
        let moved = crate::testutil::Peer {
            dev: peer.dev.clone(),
            hw: HardwareAddr::new([0x02, 0x42, 0, 0, 0, 0x99]),
            ip: PEER_IP,
            stack_hw: peer.stack_hw,
            stack_ip: peer.stack_ip,
        };
        moved.send_arp(ARP_OP_REPLY, moved.stack_hw);
        let deadline = Instant::now() + Duration::from_secs(3);
        while intf.arptbl.cached(PEER_IP) != Some(moved.hw) {
            assert!(Instant::now() < deadline, "binding never updated");
            thread::sleep(Duration::from_millis(10));
        }
        stack.stop();
    }

    #[test]
    fn flush_forgets_learned_entries() {
        let (stack, intf, peer) = rig();
        peer.announce();
        assert!(intf.arptbl.cached(PEER_IP).is_some());
        intf.arptbl.flush();
        assert_eq!(intf.arptbl.cached(PEER_IP), None);
        stack.stop();
    }
}
