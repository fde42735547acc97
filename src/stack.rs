//! The owning aggregate: interfaces, route table, socket table and the
//! process-wide timer thread.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::iface::Interface;
use crate::net::route::RouteTable;
use crate::netdev::NetDev;
use crate::tcp::{SockTable, TCP_EPHEMERAL_BASE};
use crate::time::ConTimer;
use crate::types::{Ipv4Addr, Ipv4Mask};

/// Counters for traffic that is dropped without surfacing anywhere.
#[derive(Debug, Default)]
pub struct Stats {
    csum_errors: AtomicU64,
    dropped_segments: AtomicU64,
}

impl Stats {
    pub(crate) fn count_csum_error(&self) {
        self.csum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_drop(&self) {
        self.dropped_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn csum_errors(&self) -> u64 {
        self.csum_errors.load(Ordering::Relaxed)
    }

    pub fn dropped_segments(&self) -> u64 {
        self.dropped_segments.load(Ordering::Relaxed)
    }
}

pub struct NetStack {
    pub(crate) routes: RouteTable,
    pub(crate) socks: Mutex<SockTable>,
    pub(crate) timer: ConTimer,
    pub(crate) stats: Stats,
    intfs: Mutex<Vec<Arc<Interface>>>,
    ip_ident: AtomicU16,
    next_port: AtomicU16,
}

impl NetStack {
    pub fn new() -> Arc<NetStack> {
        Arc::new(NetStack {
            routes: RouteTable::new(),
            socks: Mutex::new(SockTable::new()),
            timer: ConTimer::new(),
            stats: Stats::default(),
            intfs: Mutex::new(Vec::new()),
            ip_ident: AtomicU16::new(0),
            next_port: AtomicU16::new(TCP_EPHEMERAL_BASE),
        })
    }

    /// Attach a link device, spawn its worker pair and install the
    /// connected route.
    pub fn add_interface(
        self: &Arc<Self>,
        name: &str,
        dev: Arc<dyn NetDev>,
        ipv4: Ipv4Addr,
        netmask: Ipv4Mask,
    ) -> Arc<Interface> {
        let intf = Interface::new(name, dev, ipv4, netmask);
        intf.start(self);
        self.routes.add_connected(&intf);
        self.intfs.lock().unwrap().push(intf.clone());
        info!(
            "{} up: {} {:?} mtu {} ({})",
            name,
            ipv4,
            intf.netmask(),
            intf.mtu(),
            intf.hwaddr()
        );
        intf
    }

    pub fn add_default_route(&self, gateway: Ipv4Addr, intf: &Arc<Interface>) {
        self.routes.add_default(gateway, intf);
    }

    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.intfs.lock().unwrap().clone()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Retire every interface worker. Sockets already closed keep
    /// their final state; the timer thread dies with the stack.
    pub fn stop(&self) {
        for intf in self.intfs.lock().unwrap().iter() {
            intf.stop();
        }
    }

    pub(crate) fn next_ident(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Ephemeral local port, counting up from the base and skipping
    /// back on wrap.
    pub(crate) fn alloc_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port >= TCP_EPHEMERAL_BASE {
            port
        } else {
            self.next_port.store(TCP_EPHEMERAL_BASE + 1, Ordering::Relaxed);
            TCP_EPHEMERAL_BASE
        }
    }
}
