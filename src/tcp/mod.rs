//! The TCP connection engine: transmission control block, sequence
//! arithmetic and the per-state machinery in the submodules.

pub mod api;
pub mod rx;
pub mod tx;

pub const TCP_HDR_LEN: usize = 20;

/// Receive window advertised on a fresh connection.
pub const TCP_START_WINDOW: u16 = 64240;
/// Largest payload placed in a single segment.
pub const TCP_SAFE_MTU: usize = 1400;

/// Initial retransmission timeout, in timer ticks. No RTT estimation
/// is performed; backoff alone adapts the timeout.
pub const TCP_START_RTO: u64 = 10_000;
/// Pause between SYN emission attempts while the device is cold.
pub const TCP_CONN_WAIT: u64 = 200_000;
/// Retry ceiling while in SYN-SENT.
pub const TCP_CONN_RETRIES: u32 = 4;
/// Retry ceiling on an established connection.
pub const TCP_MAX_RETRIES: u32 = 15;

// Control bits, in header layout order.
pub const F_FIN: u8 = 0x01;
pub const F_SYN: u8 = 0x02;
pub const F_RST: u8 = 0x04;
pub const F_PSH: u8 = 0x08;
pub const F_ACK: u8 = 0x10;

/// RFC 9293 S3.3.2 connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    /// States with a synchronised sequence space (past the handshake).
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            State::Closed | State::Listen | State::SynSent | State::SynRcvd
        )
    }
}

/*
                RFC 9293 - S3.3.1 - Fig 3

           1         2          3          4
      ----------|----------|----------|----------
             SND.UNA    SND.NXT    SND.UNA
                                  +SND.WND

1 - old sequence numbers that have been acknowledged
2 - sequence numbers of unacknowledged data
3 - sequence numbers allowed for new data transmission
4 - future sequence numbers that are not yet allowed
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendSpace {
    pub una: u32, // send unacknowledged
    pub nxt: u32, // send next
    pub wnd: u16, // send window
    pub up: u16,  // send urgent pointer
    pub wl1: u32, // segment sequence number used for last window update
    pub wl2: u32, // segment acknowledgment number used for last window update
}

/*
                RFC 9293 - S3.3.1 - Fig 4

                       1          2          3
                   ----------|----------|----------
                          RCV.NXT    RCV.NXT
                                    +RCV.WND

        1 - old sequence numbers that have been acknowledged
        2 - sequence numbers allowed for new reception
        3 - future sequence numbers that are not yet allowed
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvSpace {
    pub nxt: u32, // receive next
    pub wnd: u16, // receive window
    pub up: u16,  // receive urgent pointer
}

/// RFC 9293 S3.3.1 transmission control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tcb {
    pub iss: u32,
    pub snd: SendSpace,
    pub irs: u32,
    pub rcv: RecvSpace,
}

impl Tcb {
    /// TCB of an active open about to emit its SYN.
    pub fn open(iss: u32) -> Tcb {
        Tcb {
            iss,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                up: 0,
                wl1: 0,
                wl2: 0,
            },
            irs: 0,
            rcv: RecvSpace {
                nxt: 0,
                wnd: TCP_START_WINDOW,
                up: 0,
            },
        }
    }

    /// Bytes we may still send without exceeding the peer's advertised
    /// window: `(SND.UNA + SND.WND) - SND.NXT`.
    pub fn usable_window(&self) -> u32 {
        let edge = self.snd.una.wrapping_add(u32::from(self.snd.wnd));
        if wrapping_lt(edge, self.snd.nxt) {
            0
        } else {
            edge.wrapping_sub(self.snd.nxt)
        }
    }

    /*
    There are four cases for the acceptability test for an
    incoming segment:

    Segment Length  Receive Window  Test
    0               0               SEG.SEQ = RCV.NXT

    0               >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND

    >0              0               not acceptable

                                    RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND

    >0              >0              and

                                    RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    */
    pub fn segment_legal(&self, seg_seq: u32, seg_len: u32) -> bool {
        let rcv_nxt = self.rcv.nxt;
        let rcv_wnd = u32::from(self.rcv.wnd);

        if seg_len == 0 && rcv_wnd == 0 {
            seg_seq == rcv_nxt
        } else if seg_len == 0 {
            is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq,
                rcv_nxt.wrapping_add(rcv_wnd),
            )
        } else if rcv_wnd == 0 {
            false
        } else {
            is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq,
                rcv_nxt.wrapping_add(rcv_wnd),
            ) && is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq.wrapping_add(seg_len).wrapping_sub(1),
                rcv_nxt.wrapping_add(rcv_wnd),
            )
        }
    }
}

pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323:
    //     TCP determines if a data segment is "old" or "new" by testing
    //     whether its sequence number is within 2**31 bytes of the left edge
    //     of the window, and if it is not, discarding the data as "old".  To
    //     insure that new data is never mistakenly considered old and vice-
    //     versa, the left edge of the sender's window has to be at most
    //     2**31 away from the right edge of the receiver's window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

pub fn seq_le(lhs: u32, rhs: u32) -> bool {
    lhs == rhs || wrapping_lt(lhs, rhs)
}

pub fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_comparisons_cross_the_seam() {
        assert!(wrapping_lt(10, 20));
        assert!(!wrapping_lt(20, 10));
        assert!(wrapping_lt(u32::MAX - 5, 5));
        assert!(!wrapping_lt(5, u32::MAX - 5));
        assert!(!wrapping_lt(7, 7));

        assert!(is_between_wrapped(u32::MAX - 1, 1, 10));
        assert!(!is_between_wrapped(5, 5, 10));
        assert!(seq_le(5, 5));
        assert!(seq_le(u32::MAX, 3));
    }

    #[test]
    fn fresh_active_open_tcb() {
        let tcb = Tcb::open(4242);
        assert_eq!(tcb.iss, 4242);
        assert_eq!(tcb.snd.una, 4242);
        assert_eq!(tcb.snd.nxt, 4242);
        assert_eq!(tcb.snd.wnd, 0);
        assert_eq!(tcb.rcv.wnd, TCP_START_WINDOW);
        assert_eq!(tcb.usable_window(), 0);
    }

    #[test]
    fn usable_window_tracks_acks_and_sends() {
        let mut tcb = Tcb::open(1000);
        tcb.snd.wnd = 500;
        assert_eq!(tcb.usable_window(), 500);

        tcb.snd.nxt = 1300;
        assert_eq!(tcb.usable_window(), 200);

        tcb.snd.una = 1300;
        assert_eq!(tcb.usable_window(), 500);

        // A shrunken window never yields a huge "negative" value.
        tcb.snd.wnd = 0;
        assert_eq!(tcb.usable_window(), 0);
    }

    #[test]
    fn usable_window_wraps_with_the_sequence_space() {
        let mut tcb = Tcb::open(u32::MAX - 10);
        tcb.snd.wnd = 100;
        tcb.snd.nxt = u32::MAX - 10;
        assert_eq!(tcb.usable_window(), 100);

        tcb.snd.nxt = 20; // 31 bytes past una, across the seam
        assert_eq!(tcb.usable_window(), 69);
    }

    #[test]
    fn acceptability_four_cases() {
        let mut tcb = Tcb::default();
        tcb.rcv.nxt = 1000;

        // len 0, wnd 0: only the exact next sequence.
        tcb.rcv.wnd = 0;
        assert!(tcb.segment_legal(1000, 0));
        assert!(!tcb.segment_legal(1001, 0));

        // len 0, wnd > 0: within the window.
        tcb.rcv.wnd = 100;
        assert!(tcb.segment_legal(1000, 0));
        assert!(tcb.segment_legal(1099, 0));
        assert!(!tcb.segment_legal(1100, 0));
        assert!(!tcb.segment_legal(999, 0));

        // len > 0, wnd 0: never acceptable.
        tcb.rcv.wnd = 0;
        assert!(!tcb.segment_legal(1000, 10));

        // len > 0, wnd > 0: both edges inside.
        tcb.rcv.wnd = 100;
        assert!(tcb.segment_legal(1000, 10));
        assert!(tcb.segment_legal(1090, 10));
        assert!(!tcb.segment_legal(1091, 10));
        assert!(!tcb.segment_legal(999, 10));
        assert!(!tcb.segment_legal(11000, 10));
    }
}
