//! TCP echo daemon on a TAP device.
//!
//! ```bash
//! sudo ./echod tap0 10.0.0.2/24 7
//! # then, from the host side of the tap:
//! nc 10.0.0.2 7
//! ```

use std::env;
use std::process;
use std::sync::Arc;
use std::thread;

use netstack::netdev::tap::TapDev;
use netstack::types::{Ipv4Addr, Ipv4Mask};
use netstack::NetStack;

fn usage() -> ! {
    eprintln!("usage: echod <tap-name> <addr>/<prefix> [port]");
    process::exit(2);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let (name, cidr) = match &args[..] {
        [_, name, cidr] | [_, name, cidr, _] => (name.as_str(), cidr.as_str()),
        _ => usage(),
    };
    let port: u16 = args.get(3).map_or(7, |p| p.parse().unwrap_or_else(|_| usage()));

    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, prefix),
        None => (cidr, "24"),
    };
    let addr: Ipv4Addr = addr.parse().unwrap_or_else(|_| usage());
    let netmask = Ipv4Mask::prefix_new(prefix.parse().unwrap_or_else(|_| usage()));

    let dev = match TapDev::open(name) {
        Ok(dev) => Arc::new(dev),
        Err(err) => {
            eprintln!("echod: {}: {}", name, err);
            process::exit(1);
        }
    };
    if let Err(err) = dev.bring_up(name, addr, netmask) {
        eprintln!("echod: bring up {}: {}", name, err);
        process::exit(1);
    }

    let stack = NetStack::new();
    stack.add_interface(name, dev, addr, netmask);

    let listener = stack.tcp_socket();
    if let Err(err) = listener.listen(Ipv4Addr::ANY, port, 16) {
        eprintln!("echod: listen on {}: {}", port, err);
        process::exit(1);
    }
    println!("echoing on {}:{}", addr, port);

    loop {
        let sock = match listener.accept() {
            Ok(sock) => sock,
            Err(err) => {
                eprintln!("echod: accept: {}", err);
                continue;
            }
        };
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match sock.recv(&mut buf, 0) {
                    Ok(0) => break,
                    Ok(n) => {
                        if sock.send(&buf[..n], 0).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = sock.close();
        });
    }
}
