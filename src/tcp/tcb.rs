//! Transmission control block: the per-connection sequence variables
//! and the window predicates shared by every state handler.

use crate::storage::seqbuf::{seq_between, seq_lt, seq_lte};

/*
               1         2          3          4
          ----------|----------|----------|----------
                 SND.UNA    SND.NXT    SND.UNA
                                      +SND.WND
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct SndSeq {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u32,
    /// Segment sequence of the last window update.
    pub wl1: u32,
    /// Segment acknowledgment of the last window update.
    pub wl2: u32,
    pub iss: u32,
}

/*
                   1          2          3
               ----------|----------|----------
                      RCV.NXT    RCV.NXT
                                +RCV.WND
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct RcvSeq {
    pub nxt: u32,
    pub wnd: u16,
    pub irs: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tcb {
    pub snd: SndSeq,
    pub rcv: RcvSeq,
}

impl Tcb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the send half for an active or passive open.
    pub fn init_iss(&mut self, iss: u32) {
        self.snd.iss = iss;
        self.snd.una = iss;
        self.snd.nxt = iss.wrapping_add(1); // the SYN occupies iss
    }

    /// Seed the receive half from the peer's SYN.
    pub fn init_irs(&mut self, irs: u32) {
        self.rcv.irs = irs;
        self.rcv.nxt = irs.wrapping_add(1);
    }

    /// SND.UNA < ack <= SND.NXT.
    pub fn acceptable_ack(&self, ack: u32) -> bool {
        seq_between(self.snd.una, ack, self.snd.nxt.wrapping_add(1))
    }

    /// Octets (plus SYN/FIN phantoms) sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u32 {
        self.snd.nxt.wrapping_sub(self.snd.una)
    }

    /// RFC 793 3.3 acceptance test, four cases by segment length and
    /// window width.
    pub fn in_rcv_window(&self, seq: u32, len: usize) -> bool {
        let nxt = self.rcv.nxt;
        let wnd = self.rcv.wnd as u32;
        let right = nxt.wrapping_add(wnd);
        if len == 0 {
            if wnd == 0 {
                seq == nxt
            } else {
                seq_between(nxt.wrapping_sub(1), seq, right)
            }
        } else if wnd == 0 {
            false
        } else {
            let last = seq.wrapping_add(len as u32).wrapping_sub(1);
            seq_between(nxt.wrapping_sub(1), seq, right)
                || seq_between(nxt.wrapping_sub(1), last, right)
        }
    }

    /// Window update guard: only segments newer than the last update
    /// (by sequence, then ack) may change SND.WND.
    pub fn update_snd_wnd(&mut self, seg_seq: u32, seg_ack: u32, seg_wnd: u16) {
        if seq_lt(self.snd.wl1, seg_seq)
            || (self.snd.wl1 == seg_seq && seq_lte(self.snd.wl2, seg_ack))
        {
            self.snd.wnd = seg_wnd as u32;
            self.snd.wl1 = seg_seq;
            self.snd.wl2 = seg_ack;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcb(una: u32, nxt: u32) -> Tcb {
        let mut tcb = Tcb::new();
        tcb.snd.una = una;
        tcb.snd.nxt = nxt;
        tcb
    }

    #[test]
    fn ack_acceptance() {
        let t = tcb(100, 200);
        assert!(!t.acceptable_ack(100)); // duplicate
        assert!(t.acceptable_ack(101));
        assert!(t.acceptable_ack(200));
        assert!(!t.acceptable_ack(201)); // acks unsent data
    }

    #[test]
    fn ack_acceptance_wraps() {
        let t = tcb(0xffff_fff0, 0x10);
        assert!(t.acceptable_ack(0xffff_fffa));
        assert!(t.acceptable_ack(0x10));
        assert!(!t.acceptable_ack(0x11));
        assert_eq!(t.bytes_in_flight(), 0x20);
    }

    #[test]
    fn window_acceptance_four_cases() {
        let mut t = Tcb::new();
        t.rcv.nxt = 100;

        // len 0, wnd 0: only exactly RCV.NXT
        t.rcv.wnd = 0;
        assert!(t.in_rcv_window(100, 0));
        assert!(!t.in_rcv_window(101, 0));

        // len 0, wnd > 0
        t.rcv.wnd = 10;
        assert!(t.in_rcv_window(100, 0));
        assert!(t.in_rcv_window(109, 0));
        assert!(!t.in_rcv_window(110, 0));
        assert!(!t.in_rcv_window(99, 0));

        // len > 0, wnd 0: never acceptable
        t.rcv.wnd = 0;
        assert!(!t.in_rcv_window(100, 5));

        // len > 0, wnd > 0: either edge inside
        t.rcv.wnd = 10;
        assert!(t.in_rcv_window(100, 5));
        assert!(t.in_rcv_window(95, 6)); // tail reaches the window
        assert!(!t.in_rcv_window(94, 5));
        assert!(t.in_rcv_window(109, 50)); // head still inside
        assert!(!t.in_rcv_window(110, 5));
    }

    #[test]
    fn window_update_guard() {
        let mut t = Tcb::new();
        t.snd.wl1 = 50;
        t.snd.wl2 = 10;
        t.update_snd_wnd(60, 11, 4096);
        assert_eq!(t.snd.wnd, 4096);
        // An older segment must not shrink the window back.
        t.update_snd_wnd(55, 12, 1024);
        assert_eq!(t.snd.wnd, 4096);
        assert_eq!(t.snd.wl1, 60);
    }
}
