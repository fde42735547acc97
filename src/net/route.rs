//! Longest-prefix route table.

use std::sync::{Arc, Mutex};

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::types::{Ipv4Addr, Ipv4Mask};

#[derive(Clone)]
pub struct RouteEntry {
    net: Ipv4Addr,
    netmask: Ipv4Mask,
    gateway: Option<Ipv4Addr>,
    intf: Arc<Interface>,
}

impl RouteEntry {
    pub fn new(
        net: Ipv4Addr,
        netmask: Ipv4Mask,
        gateway: Option<Ipv4Addr>,
        intf: Arc<Interface>,
    ) -> Self {
        Self {
            net: net.mask(netmask),
            netmask,
            gateway,
            intf,
        }
    }
}

/// A resolved output route: where the packet leaves and which address
/// ARP must answer for.
#[derive(Clone)]
pub struct Route {
    pub intf: Arc<Interface>,
    pub src: Ipv4Addr,
    pub next_hop: Ipv4Addr,
}

pub struct RouteTable {
    entries: Mutex<Vec<RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Insert keeping longest prefixes first so `lookup` returns the
    /// most specific match.
    pub fn add(&self, entry: RouteEntry) {
        let mut entries = self.entries.lock().unwrap();
        let at = entries
            .iter()
            .position(|existing| entry.netmask > existing.netmask)
            .unwrap_or(entries.len());
        entries.insert(at, entry);
    }

    /// The connected subnet of an interface: on-link, no gateway.
    pub fn add_connected(&self, intf: &Arc<Interface>) {
        self.add(RouteEntry::new(
            intf.ipv4_addr(),
            intf.netmask(),
            None,
            intf.clone(),
        ));
    }

    pub fn add_default(&self, gateway: Ipv4Addr, intf: &Arc<Interface>) {
        self.add(RouteEntry::new(
            Ipv4Addr::ANY,
            Ipv4Mask::prefix_new(0),
            Some(gateway),
            intf.clone(),
        ));
    }

    pub fn lookup(&self, dst: Ipv4Addr) -> Result<Route> {
        let entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if dst.mask(entry.netmask) == entry.net {
                return Ok(Route {
                    intf: entry.intf.clone(),
                    src: entry.intf.ipv4_addr(),
                    next_hop: entry.gateway.unwrap_or(dst),
                });
            }
        }
        Err(NetError::NoRoute)
    }
}
