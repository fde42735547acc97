//! Network interface: a link device plus its L3 identity, ARP table
//! and worker pair.
//!
//! Each interface owns two threads, started by the stack: a recv
//! worker that blocks in the device and pushes frames into `net_in`,
//! and an xmit worker that drains the transmit queue into the device.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{debug, warn};

use crate::error::{NetError, Result};
use crate::net::arp::ArpTable;
use crate::net::link::net_in;
use crate::netdev::{NetDev, NetStats};
use crate::stack::NetStack;
use crate::types::ether::ETH_HRD_SZ;
use crate::types::pkbuf::{PacketBuffer, PkBuf};
use crate::types::{HardwareAddr, Ipv4Addr, Ipv4Mask};

pub struct Interface {
    name: String,
    dev: Arc<dyn NetDev>,
    mtu: usize,
    hwaddr: HardwareAddr,
    ipv4: Ipv4Addr,
    netmask: Ipv4Mask,
    pub(crate) arptbl: ArpTable,
    pub(crate) stats: NetStats,
    txq: Mutex<Option<Sender<PkBuf>>>,
    rxq: Mutex<Option<Receiver<PkBuf>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Interface {
    pub fn new(name: &str, dev: Arc<dyn NetDev>, ipv4: Ipv4Addr, netmask: Ipv4Mask) -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        Arc::new(Self {
            name: name.to_string(),
            mtu: dev.mtu(),
            hwaddr: dev.hwaddr(),
            dev,
            ipv4,
            netmask,
            arptbl: ArpTable::new(),
            stats: NetStats::default(),
            txq: Mutex::new(Some(tx)),
            rxq: Mutex::new(Some(rx)),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn hwaddr(&self) -> HardwareAddr {
        self.hwaddr
    }

    pub fn ipv4_addr(&self) -> Ipv4Addr {
        self.ipv4
    }

    pub fn netmask(&self) -> Ipv4Mask {
        self.netmask
    }

    /// Largest L3 datagram this interface can carry.
    pub fn max_dgram_size(&self) -> usize {
        self.mtu
    }

    /// Hand a fully-encapsulated frame to the xmit worker.
    pub fn queue_xmit(&self, pkbuf: PkBuf) -> Result<()> {
        let txq = self.txq.lock().unwrap();
        match txq.as_ref() {
            Some(tx) => tx
                .send(pkbuf)
                .map_err(|_| NetError::Io("xmit worker gone".into())),
            None => Err(NetError::Io("interface stopped".into())),
        }
    }

    /// Spawn the recv/xmit worker pair. Called once by the stack when
    /// the interface is added.
    pub(crate) fn start(self: &Arc<Self>, stack: &Arc<NetStack>) {
        let mut threads = self.threads.lock().unwrap();

        let rx_intf = self.clone();
        let rx_stack = Arc::downgrade(stack);
        let recv = thread::Builder::new()
            .name(format!("{}-recv", self.name))
            .spawn(move || recv_worker(rx_intf, rx_stack))
            .expect("spawn recv worker");
        threads.push(recv);

        let tx_intf = self.clone();
        let rxq = self.rxq.lock().unwrap().take().expect("started twice");
        let xmit = thread::Builder::new()
            .name(format!("{}-xmit", self.name))
            .spawn(move || xmit_worker(tx_intf, rxq))
            .expect("spawn xmit worker");
        threads.push(xmit);
    }

    /// Close the device and retire both workers.
    pub fn stop(&self) {
        self.dev.close();
        self.txq.lock().unwrap().take();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for th in threads {
            let _ = th.join();
        }
    }
}

fn recv_worker(intf: Arc<Interface>, stack: Weak<NetStack>) {
    loop {
        let mut pkbuf = PacketBuffer::new_rx(intf.mtu + ETH_HRD_SZ);
        let count = match intf.dev.recv(pkbuf.raw_mut()) {
            Ok(count) => count,
            Err(err) => {
                debug!("{}: recv worker exits: {}", intf.name, err);
                return;
            }
        };
        pkbuf.fill(count);
        pkbuf.stamp();
        intf.stats.count_rx(count);

        let Some(stack) = stack.upgrade() else {
            return;
        };
        if let Err(err) = net_in(&stack, &intf, pkbuf.shared()) {
            intf.stats.drop_rx();
            debug!("{}: dropped frame: {}", intf.name, err);
        }
    }
}

fn xmit_worker(intf: Arc<Interface>, rxq: Receiver<PkBuf>) {
    while let Ok(pkbuf) = rxq.recv() {
        let frame = pkbuf.read().unwrap();
        match intf.dev.xmit(frame.frame_bytes()) {
            Ok(count) => intf.stats.count_tx(count),
            Err(err) => {
                warn!("{}: xmit failed: {}", intf.name, err);
                intf.stats.tx_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }
}
