//! Linux TAP device.
//!
//! Same effect as:
//!
//! ```bash
//! ip tuntap add tap0 mode tap
//! ip addr add 10.0.0.2/24 dev tap0
//! ip link set up dev tap0
//! ```

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_short, c_ulong, ifreq, sockaddr, sockaddr_in};

use crate::error::{NetError, Result};
use crate::types::{HardwareAddr, Ipv4Addr, Ipv4Mask};
use crate::utils::ifrname::build_terminated_if_name;

use super::NetDev;

const TUN_PATH: &[u8] = b"/dev/net/tun\0";
const TUNSETIFF: c_ulong = 0x4004_54ca;

/// run an ioctl-style call, mapping -1 to the current errno
macro_rules! call_c_func {
    ($func:expr) => {
        if unsafe { $func } < 0 {
            let err = io::Error::last_os_error();
            return Err(NetError::Io(format!("{} failed: {}", stringify!($func), err)));
        }
    };
}

pub struct TapDev {
    fd: c_int,
    mtu: usize,
    hwaddr: HardwareAddr,
    closed: AtomicBool,
}

impl TapDev {
    /// Open the clone device, attach to `name` in TAP mode and read
    /// back the interface metadata.
    pub fn open(name: &str) -> Result<TapDev> {
        let fd = unsafe { libc::open(TUN_PATH.as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(NetError::Io(io::Error::last_os_error().to_string()));
        }

        let mut ifr: ifreq = unsafe { mem::zeroed() };
        ifr.ifr_name = build_terminated_if_name(name);
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as c_short;
        call_c_func!(libc::ioctl(fd, TUNSETIFF, &ifr));

        // Metadata comes from a throwaway AF_INET control socket.
        let skfd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if skfd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetError::Io(err.to_string()));
        }

        let mut mtu_req: ifreq = unsafe { mem::zeroed() };
        mtu_req.ifr_name = ifr.ifr_name;
        call_c_func!(libc::ioctl(skfd, libc::SIOCGIFMTU, &mut mtu_req));
        let mtu = unsafe { mtu_req.ifr_ifru.ifru_mtu } as usize;

        let mut hw_req: ifreq = unsafe { mem::zeroed() };
        hw_req.ifr_name = ifr.ifr_name;
        call_c_func!(libc::ioctl(skfd, libc::SIOCGIFHWADDR, &mut hw_req));
        let mut octets = [0u8; 6];
        let sa_data = unsafe { hw_req.ifr_ifru.ifru_hwaddr.sa_data };
        for (dst, src) in octets.iter_mut().zip(sa_data.iter()) {
            *dst = *src as u8;
        }
        unsafe { libc::close(skfd) };

        Ok(TapDev {
            fd,
            mtu,
            hwaddr: HardwareAddr::from(octets),
            closed: AtomicBool::new(false),
        })
    }

    /// Assign `addr`/`mask` and bring the link up.
    pub fn bring_up(&self, name: &str, addr: Ipv4Addr, mask: Ipv4Mask) -> Result<()> {
        let skfd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if skfd < 0 {
            return Err(NetError::Io(io::Error::last_os_error().to_string()));
        }
        let result = self.bring_up_on(skfd, name, addr, mask);
        unsafe { libc::close(skfd) };
        result
    }

    fn bring_up_on(&self, skfd: c_int, name: &str, addr: Ipv4Addr, mask: Ipv4Mask) -> Result<()> {
        let if_name = build_terminated_if_name(name);

        let mut addr_req: ifreq = unsafe { mem::zeroed() };
        addr_req.ifr_name = if_name;
        addr_req.ifr_ifru.ifru_addr = inet_sockaddr(addr.to_host());
        call_c_func!(libc::ioctl(skfd, libc::SIOCSIFADDR, &addr_req));

        let mut mask_req: ifreq = unsafe { mem::zeroed() };
        mask_req.ifr_name = if_name;
        mask_req.ifr_ifru.ifru_netmask = inet_sockaddr(mask.to_host());
        call_c_func!(libc::ioctl(skfd, libc::SIOCSIFNETMASK, &mask_req));

        let mut flag_req: ifreq = unsafe { mem::zeroed() };
        flag_req.ifr_name = if_name;
        call_c_func!(libc::ioctl(skfd, libc::SIOCGIFFLAGS, &mut flag_req));
        unsafe {
            flag_req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as c_short;
        }
        call_c_func!(libc::ioctl(skfd, libc::SIOCSIFFLAGS, &flag_req));
        Ok(())
    }
}

fn inet_sockaddr(host_addr: u32) -> sockaddr {
    let mut sin: sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = host_addr.to_be();
    unsafe { mem::transmute(sin) }
}

impl NetDev for TapDev {
    fn xmit(&self, buf: &[u8]) -> Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const _, buf.len()) };
        if n < 0 {
            return Err(NetError::Io(io::Error::last_os_error().to_string()));
        }
        Ok(n as usize)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Io("tap closed".into()));
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(NetError::Io(io::Error::last_os_error().to_string()));
        }
        Ok(n as usize)
    }

    fn hwaddr(&self) -> HardwareAddr {
        self.hwaddr
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    /// Closing the descriptor makes the worker's blocked `read` fail,
    /// ending its loop.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe { libc::close(self.fd) };
        }
    }
}

impl Drop for TapDev {
    fn drop(&mut self) {
        self.close();
    }
}
