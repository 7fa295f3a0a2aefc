//! Inbound segment processing.
//!
//! Validates the segment, finds the owning connection, and drives the
//! state machine under the connection lock, waking whichever API
//! waiters the transition concerns. Processing follows RFC 9293
//! S3.10.7: sequence check, RST, SYN, ACK, text, FIN.

use std::sync::Arc;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use log::{debug, trace, warn};

use crate::pktbuf::PktBuf;
use crate::sock::{Inner, Sock, Tuple};
use crate::tcp::tx;
use crate::tcp::{is_between_wrapped, seq_le, wrapping_lt, State, TCP_START_RTO};
use crate::Stack;

pub fn tcp_rx(stack: &Arc<Stack>, ip4h: &Ipv4HeaderSlice, segment: &[u8]) {
    let tcph = match TcpHeaderSlice::from_slice(segment) {
        Ok(slice) => slice,
        Err(e) => {
            debug!("tcp rx: unparsable header, dropping: {e}");
            return;
        }
    };

    let data_off = usize::from(tcph.data_offset()) * 4;
    if data_off > segment.len() {
        debug!("tcp rx: data offset past segment end, dropping");
        return;
    }
    let payload = &segment[data_off..];

    match tcph
        .to_header()
        .calc_checksum_ipv4(&ip4h.to_header(), payload)
    {
        Ok(expected) if expected == tcph.checksum() => {}
        Ok(_) => {
            debug!("tcp rx: checksum mismatch, dropping");
            return;
        }
        Err(e) => {
            debug!("tcp rx: cannot checksum segment, dropping: {e}");
            return;
        }
    }

    trace!(
        "tcp in: {}:{} -> {}:{} seq {} ack {} wnd {} len {}",
        ip4h.source_addr(),
        tcph.source_port(),
        ip4h.destination_addr(),
        tcph.destination_port(),
        tcph.sequence_number(),
        tcph.acknowledgment_number(),
        tcph.window_size(),
        payload.len()
    );

    // Flip the packet's orientation to find the local connection.
    let Some(sock) = stack.socks().get_by_tuple(
        tcph.destination_port(),
        tcph.source_port(),
        ip4h.destination_addr(),
        ip4h.source_addr(),
    ) else {
        debug!("tcp rx: no connection for segment, dropping");
        return;
    };

    let tuple = *sock.tuple.lock().unwrap();
    let mut inner = sock.lock();

    match inner.state {
        State::SynSent => on_syn_sent(stack, &sock, &mut inner, &tuple, &tcph),
        state if state.is_synchronized() => {
            on_synchronized(stack, &sock, &mut inner, &tuple, &tcph, payload)
        }
        state => debug!("tcp rx: segment in state {state:?}, dropping"),
    }
}

/// SYN-SENT: only an acceptable SYN+ACK completes the handshake.
/// RST handling and simultaneous open are not implemented; everything
/// else is dropped.
fn on_syn_sent(
    stack: &Arc<Stack>,
    sock: &Sock,
    inner: &mut Inner,
    tuple: &Tuple,
    tcph: &TcpHeaderSlice,
) {
    if !tcph.ack() {
        return;
    }

    let ackno = tcph.acknowledgment_number();
    // SEG.ACK must acknowledge our SYN: ISS < SEG.ACK <= SND.NXT.
    if !is_between_wrapped(inner.tcb.iss, ackno, inner.tcb.snd.nxt.wrapping_add(1)) {
        debug!("tcp rx: unacceptable ack in syn-sent, dropping");
        return;
    }

    if tcph.rst() || !tcph.syn() {
        return;
    }

    // The SYN is acknowledged; take it off the retransmit queue.
    inner.snd_queue.pop_front();
    tx::cancel_rto(stack, inner);
    inner.rto = TCP_START_RTO;
    inner.retries = 0;

    inner.tcb.snd.una = ackno;
    inner.tcb.snd.wnd = tcph.window_size();
    inner.tcb.snd.wl1 = tcph.sequence_number();
    inner.tcb.snd.wl2 = ackno;
    inner.tcb.irs = tcph.sequence_number();
    inner.tcb.rcv.nxt = tcph.sequence_number().wrapping_add(1);

    inner.state = State::Estab;
    debug!("fd {}: established", sock.fd);
    sock.state_cv.notify_all();

    tx::send_ack(stack, inner, tuple);
}

fn on_synchronized(
    stack: &Arc<Stack>,
    sock: &Sock,
    inner: &mut Inner,
    tuple: &Tuple,
    tcph: &TcpHeaderSlice,
    payload: &[u8],
) {
    let seg_seq = tcph.sequence_number();
    let seg_len =
        payload.len() as u32 + u32::from(tcph.syn()) + u32::from(tcph.fin());

    // An unacceptable segment earns a corrective ACK and is dropped.
    if !inner.tcb.segment_legal(seg_seq, seg_len) {
        if !tcph.rst() {
            debug!(
                "fd {}: illegal segment seq {seg_seq} len {seg_len}, acking rcv.nxt {}",
                sock.fd, inner.tcb.rcv.nxt
            );
            tx::send_ack(stack, inner, tuple);
        }
        return;
    }

    // RST generation and handling are out of scope.
    if tcph.rst() {
        debug!("fd {}: rst received, ignoring (unimplemented)", sock.fd);
        return;
    }

    // A SYN in a synchronised state would warrant a reset; drop it.
    if tcph.syn() {
        debug!("fd {}: in-window syn in state {:?}, dropping", sock.fd, inner.state);
        return;
    }

    if !tcph.ack() {
        return;
    }

    let ackno = tcph.acknowledgment_number();

    if is_between_wrapped(inner.tcb.snd.una, ackno, inner.tcb.snd.nxt.wrapping_add(1)) {
        process_ack(stack, sock, inner, ackno);
    } else if wrapping_lt(inner.tcb.snd.nxt, ackno) {
        // Acknowledges something not yet sent.
        tx::send_ack(stack, inner, tuple);
        return;
    }

    /*
    If SND.UNA =< SEG.ACK =< SND.NXT, the send window should be
    updated. If (SND.WL1 < SEG.SEQ or (SND.WL1 = SEG.SEQ and
    SND.WL2 =< SEG.ACK)), set SND.WND <- SEG.WND, set
    SND.WL1 <- SEG.SEQ, and set SND.WL2 <- SEG.ACK.

    The wl1/wl2 check prevents stale segments from shrinking the
    window.
    */
    if is_between_wrapped(
        inner.tcb.snd.una.wrapping_sub(1),
        ackno,
        inner.tcb.snd.nxt.wrapping_add(1),
    ) && (wrapping_lt(inner.tcb.snd.wl1, seg_seq)
        || (inner.tcb.snd.wl1 == seg_seq && seq_le(inner.tcb.snd.wl2, ackno)))
    {
        let was_closed = inner.tcb.usable_window() == 0;
        inner.tcb.snd.wnd = tcph.window_size();
        inner.tcb.snd.wl1 = seg_seq;
        inner.tcb.snd.wl2 = ackno;
        if was_closed && inner.tcb.usable_window() > 0 {
            sock.ack_cv.notify_all();
        }
    }

    // Close-sequence follow-ups once our FIN is fully acknowledged.
    let fin_acked = inner.tcb.snd.una == inner.tcb.snd.nxt;
    match inner.state {
        State::FinWait1 if fin_acked => {
            inner.state = State::FinWait2;
            debug!("fd {}: fin acked, fin-wait-2", sock.fd);
            sock.state_cv.notify_all();
        }
        State::Closing if fin_acked => {
            inner.state = State::TimeWait;
            debug!("fd {}: fin acked, time-wait", sock.fd);
            sock.state_cv.notify_all();
        }
        State::LastAck if fin_acked => {
            inner.state = State::Closed;
            debug!("fd {}: fin acked, closed", sock.fd);
            sock.state_cv.notify_all();
        }
        _ => {}
    }

    // Segment text is only accepted before the peer's FIN, exactly at
    // the left window edge; anything out of order is dropped without
    // reassembly.
    if !payload.is_empty() {
        match inner.state {
            State::Estab | State::FinWait1 | State::FinWait2 => {
                if seg_seq == inner.tcb.rcv.nxt {
                    let mut pkt = PktBuf::from_frame(payload);
                    pkt.seq = seg_seq;
                    pkt.end_seq = seg_seq.wrapping_add(payload.len() as u32);

                    inner.tcb.rcv.nxt = pkt.end_seq;
                    inner.tcb.rcv.wnd -= payload.len() as u16;
                    inner.rcv_queue.push_back(pkt);

                    tx::send_ack(stack, inner, tuple);
                    sock.data_cv.notify_all();
                } else {
                    debug!(
                        "fd {}: out-of-order data (seq {seg_seq}, expected {}), dropping",
                        sock.fd, inner.tcb.rcv.nxt
                    );
                }
            }
            _ => {
                debug!("fd {}: data after the peer's fin, ignoring", sock.fd);
            }
        }
    }

    // The FIN is consumed only when it lands exactly at RCV.NXT (its
    // data, if any, must have been accepted above). A retransmitted
    // FIN fails the legality test instead and was acked there.
    if tcph.fin() && seg_seq.wrapping_add(payload.len() as u32) == inner.tcb.rcv.nxt {
        on_fin(stack, sock, inner, tuple);
    }
}

/// A new acknowledgement: advance `SND.UNA`, retire fully acknowledged
/// segments and quiesce the RTO timer when the queue drains.
fn process_ack(stack: &Arc<Stack>, sock: &Sock, inner: &mut Inner, ackno: u32) {
    inner.tcb.snd.una = ackno;

    while let Some(head) = inner.snd_queue.front() {
        if seq_le(head.end_seq, inner.tcb.snd.una) {
            trace!(
                "fd {}: segment [{}, {}) fully acked, retiring",
                sock.fd,
                head.seq,
                head.end_seq
            );
            inner.snd_queue.pop_front();
        } else {
            break;
        }
    }

    if inner.snd_queue.is_empty() {
        tx::cancel_rto(stack, inner);
        inner.rto = TCP_START_RTO;
        inner.retries = 0;
    }

    // The window may have reopened for blocked senders.
    sock.ack_cv.notify_all();
}

/*
Eighth, check the FIN bit:

    SYN-RECEIVED STATE
    ESTABLISHED STATE
        Enter the CLOSE-WAIT state.

    FIN-WAIT-1 STATE
        If our FIN has been ACKed (perhaps in this segment), then
        enter TIME-WAIT; otherwise, enter the CLOSING state.

    FIN-WAIT-2 STATE
        Enter the TIME-WAIT state.

    CLOSE-WAIT, CLOSING, LAST-ACK, TIME-WAIT STATES
        Remain in the same state.
*/
fn on_fin(stack: &Arc<Stack>, sock: &Sock, inner: &mut Inner, tuple: &Tuple) {
    let next = match inner.state {
        State::Estab => Some(State::CloseWait),
        State::FinWait1 => {
            if inner.tcb.snd.una == inner.tcb.snd.nxt {
                Some(State::TimeWait)
            } else {
                Some(State::Closing)
            }
        }
        State::FinWait2 => Some(State::TimeWait),
        State::CloseWait | State::Closing | State::LastAck | State::TimeWait => None,
        other => {
            warn!("fd {}: fin in unexpected state {:?}", sock.fd, other);
            None
        }
    };

    // The FIN consumes one sequence number.
    inner.tcb.rcv.nxt = inner.tcb.rcv.nxt.wrapping_add(1);
    tx::send_ack(stack, inner, tuple);

    if let Some(next) = next {
        debug!("fd {}: peer fin, {:?} -> {:?}", sock.fd, inner.state, next);
        inner.state = next;
        sock.state_cv.notify_all();
        // Readers blocked on the receive queue observe end of stream.
        sock.data_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dev::ChannelWire;
    use crate::sock::Tuple;
    use crate::tcp::{Tcb, TCP_START_WINDOW};
    use etherparse::{PacketBuilder, TcpHeader};
    use std::net::Ipv4Addr;

    fn established_stack() -> (Arc<Stack>, Arc<Sock>, crate::dev::ChannelPeer) {
        let (wire, peer) = ChannelWire::pair();
        let stack = Stack::with_wire(Config::default(), Box::new(wire), true);
        let sock = stack.socks().alloc();
        *sock.tuple.lock().unwrap() = Tuple {
            sport: 50000,
            dport: 80,
            saddr: Ipv4Addr::new(10, 0, 0, 4),
            daddr: Ipv4Addr::new(10, 0, 0, 5),
        };

        let mut inner = sock.lock();
        inner.state = State::Estab;
        let mut tcb = Tcb::open(1000);
        tcb.snd.una = 1001;
        tcb.snd.nxt = 1001;
        tcb.snd.wnd = 4096;
        tcb.irs = 7000;
        tcb.rcv.nxt = 7001;
        tcb.rcv.wnd = TCP_START_WINDOW;
        inner.tcb = tcb;
        drop(inner);

        (stack, sock, peer)
    }

    fn peer_frame(seq: u32, ack: u32, wnd: u16, payload: &[u8]) -> Vec<u8> {
        let mut tcph = TcpHeader::new(80, 50000, seq, wnd);
        tcph.ack = true;
        tcph.acknowledgment_number = ack;
        let builder = PacketBuilder::ipv4([10, 0, 0, 5], [10, 0, 0, 4], 64).tcp_header(tcph);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn rx(stack: &Arc<Stack>, frame: &[u8]) {
        let ip4h = Ipv4HeaderSlice::from_slice(frame).unwrap();
        let hdr = usize::from(ip4h.ihl()) * 4;
        tcp_rx(stack, &ip4h, &frame[hdr..]);
    }

    #[test]
    fn old_ack_never_moves_una_backwards() {
        let (stack, sock, _peer) = established_stack();

        {
            let mut inner = sock.lock();
            inner.tcb.snd.nxt = 1501; // 500 bytes in flight
        }

        rx(&stack, &peer_frame(7001, 1301, 4096, &[]));
        assert_eq!(sock.lock().tcb.snd.una, 1301);

        // A reordered duplicate of an older acknowledgement.
        rx(&stack, &peer_frame(7001, 1101, 4096, &[]));
        assert_eq!(sock.lock().tcb.snd.una, 1301);
    }

    #[test]
    fn corrupted_segment_is_dropped() {
        let (stack, sock, _peer) = established_stack();

        let mut frame = peer_frame(7001, 1001, 4096, b"hello");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        rx(&stack, &frame);

        let inner = sock.lock();
        assert!(inner.rcv_queue.is_empty());
        assert_eq!(inner.tcb.rcv.nxt, 7001);
    }

    #[test]
    fn in_order_data_is_queued_and_acked() {
        let (stack, sock, peer) = established_stack();

        rx(&stack, &peer_frame(7001, 1001, 4096, b"abcdef"));

        {
            let inner = sock.lock();
            assert_eq!(inner.rcv_queue.len(), 1);
            assert_eq!(inner.rcv_queue[0].bytes(), b"abcdef");
            assert_eq!(inner.tcb.rcv.nxt, 7007);
            // The advertised window shrinks by what was buffered.
            assert_eq!(inner.tcb.rcv.wnd, TCP_START_WINDOW - 6);
        }

        let ack = peer.rx.recv().unwrap();
        let tcph = TcpHeaderSlice::from_slice(&ack[20..]).unwrap();
        assert!(tcph.ack());
        assert_eq!(tcph.acknowledgment_number(), 7007);
        assert_eq!(tcph.window_size(), TCP_START_WINDOW - 6);
    }

    #[test]
    fn out_of_order_data_is_not_queued() {
        let (stack, sock, _peer) = established_stack();

        rx(&stack, &peer_frame(7101, 1001, 4096, b"late"));

        let inner = sock.lock();
        assert!(inner.rcv_queue.is_empty());
        assert_eq!(inner.tcb.rcv.nxt, 7001);
        assert_eq!(inner.tcb.rcv.wnd, TCP_START_WINDOW);
    }

    #[test]
    fn ack_for_unsent_data_elicits_an_ack_and_no_movement() {
        let (stack, sock, peer) = established_stack();

        rx(&stack, &peer_frame(7001, 2500, 4096, &[]));

        let inner = sock.lock();
        assert_eq!(inner.tcb.snd.una, 1001);
        drop(inner);

        let reply = peer.rx.recv().unwrap();
        let tcph = TcpHeaderSlice::from_slice(&reply[20..]).unwrap();
        assert!(tcph.ack());
        assert_eq!(tcph.acknowledgment_number(), 7001);
    }
}
