//! In-memory link: two devices joined by crossed frame queues.
//!
//! Stands in for a physical link in tests and demos; either end can be
//! driven by a stack or scripted directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::types::HardwareAddr;

use super::NetDev;

const POLL_TICK: Duration = Duration::from_millis(20);

pub struct PipeDev {
    hwaddr: HardwareAddr,
    mtu: usize,
    tx: Mutex<Sender<Vec<u8>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl PipeDev {
    /// A crossed pair: frames transmitted on one end arrive on the
    /// other.
    pub fn pair(mtu: usize) -> (Arc<PipeDev>, Arc<PipeDev>) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let a = Arc::new(PipeDev {
            hwaddr: HardwareAddr::new([0x02, 0x42, 0, 0, 0, 0x0a]),
            mtu,
            tx: Mutex::new(a_tx),
            rx: Mutex::new(a_rx),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(PipeDev {
            hwaddr: HardwareAddr::new([0x02, 0x42, 0, 0, 0, 0x0b]),
            mtu,
            tx: Mutex::new(b_tx),
            rx: Mutex::new(b_rx),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }

    /// Convenience for scripted peers: wait up to `timeout` for one
    /// frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }
}

impl NetDev for PipeDev {
    fn xmit(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Io("pipe closed".into()));
        }
        self.tx
            .lock()
            .unwrap()
            .send(buf.to_vec())
            .map_err(|_| NetError::Io("peer gone".into()))?;
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let rx = self.rx.lock().unwrap();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(NetError::Io("pipe closed".into()));
            }
            match rx.recv_timeout(POLL_TICK) {
                Ok(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    return Ok(n);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(NetError::Io("peer gone".into()));
                }
            }
        }
    }

    fn hwaddr(&self) -> HardwareAddr {
        self.hwaddr
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_the_pair() {
        let (a, b) = PipeDev::pair(1500);
        a.xmit(b"ping").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_ne!(a.hwaddr(), b.hwaddr());
    }

    #[test]
    fn close_unblocks_recv() {
        let (a, _b) = PipeDev::pair(1500);
        let a2 = a.clone();
        let waiter = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            a2.recv(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(30));
        a.close();
        assert!(waiter.join().unwrap().is_err());
    }
}
