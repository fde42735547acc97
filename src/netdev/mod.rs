use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::types::HardwareAddr;

pub mod pipe;
pub mod tap;

/// A link-level device. `recv` blocks until a frame arrives or the
/// device is closed; `xmit` writes one whole frame.
pub trait NetDev: Send + Sync {
    fn xmit(&self, buf: &[u8]) -> Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    fn hwaddr(&self) -> HardwareAddr;
    fn mtu(&self) -> usize;
    /// Unblock pending `recv` calls; subsequent calls fail.
    fn close(&self);
}

#[derive(Debug, Default)]
pub struct NetStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
}

impl NetStats {
    pub fn count_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn drop_rx(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }
}
