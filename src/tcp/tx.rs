//! Segment construction, the retransmit queue and the RTO timer.

use std::io::Cursor;
use std::sync::Arc;

use etherparse::{Ipv4Header, TcpHeader};
use log::{debug, trace, warn};

use crate::err::Error;
use crate::ip::{self, IP_HDR_LEN, IPP_TCP, IP_TTL};
use crate::pktbuf::PktBuf;
use crate::sock::{Inner, Tuple};
use crate::tcp::{
    State, F_ACK, F_FIN, F_PSH, F_SYN, TCP_CONN_RETRIES, TCP_HDR_LEN, TCP_MAX_RETRIES,
    TCP_START_RTO,
};
use crate::Stack;

/// Builds one segment from the TCB fields its caller snapshot and hands
/// it to the IP layer. The checksum covers the pseudo-header and the
/// whole segment.
fn emit(
    stack: &Stack,
    tuple: &Tuple,
    seq: u32,
    ack: u32,
    wnd: u16,
    flags: u8,
    payload: &[u8],
) -> Result<usize, Error> {
    let mut tcph = TcpHeader::new(tuple.sport, tuple.dport, seq, wnd);
    tcph.acknowledgment_number = ack;
    tcph.fin = flags & F_FIN != 0;
    tcph.syn = flags & F_SYN != 0;
    tcph.psh = flags & F_PSH != 0;
    tcph.ack = flags & F_ACK != 0;

    // The pseudo-header for the checksum mirrors what the IP layer
    // will put in front of this segment.
    let ip4h = Ipv4Header::new(
        (TCP_HDR_LEN + payload.len()) as u16,
        IP_TTL,
        IPP_TCP,
        tuple.saddr.octets(),
        tuple.daddr.octets(),
    );
    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, payload)?;

    let mut pkt = PktBuf::alloc(IP_HDR_LEN + TCP_HDR_LEN);
    pkt.put(payload);
    let hdr = pkt.push(TCP_HDR_LEN);
    tcph.write(&mut Cursor::new(hdr)).map_err(ip::write_err)?;

    trace!(
        "tcp out: {}:{} -> {}:{} seq {} ack {} wnd {} flags {:#04x} len {}",
        tuple.saddr,
        tuple.sport,
        tuple.daddr,
        tuple.dport,
        seq,
        ack,
        wnd,
        flags,
        payload.len()
    );

    ip::ip_output(stack.dev(), tuple.daddr, IPP_TCP, &mut pkt)
}

/// Sends a segment that occupies sequence space and must therefore be
/// retransmittable: queues it tagged with its sequence span, advances
/// `SND.NXT`, and arms the RTO timer if the queue was idle. The caller
/// holds the connection lock, so the queue insertion and the `SND.NXT`
/// update are observed together.
pub(crate) fn queue_send(
    stack: &Arc<Stack>,
    fd: i32,
    inner: &mut Inner,
    tuple: &Tuple,
    flags: u8,
    payload: &[u8],
) -> Result<(), Error> {
    let seq = inner.tcb.snd.nxt;
    emit(
        stack,
        tuple,
        seq,
        inner.tcb.rcv.nxt,
        inner.tcb.rcv.wnd,
        flags,
        payload,
    )?;

    let mut pkt = PktBuf::alloc(0);
    pkt.put(payload);
    pkt.seq = seq;
    // SYN and FIN each consume one sequence number.
    let consumed = payload.len() as u32
        + u32::from(flags & F_SYN != 0)
        + u32::from(flags & F_FIN != 0);
    pkt.end_seq = seq.wrapping_add(consumed);
    pkt.flags = flags;

    inner.tcb.snd.nxt = pkt.end_seq;

    let was_idle = inner.snd_queue.is_empty();
    inner.snd_queue.push_back(pkt);
    if was_idle {
        arm_rto(stack, fd, inner);
    }

    Ok(())
}

pub(crate) fn send_syn(
    stack: &Arc<Stack>,
    fd: i32,
    inner: &mut Inner,
    tuple: &Tuple,
) -> Result<(), Error> {
    queue_send(stack, fd, inner, tuple, F_SYN, &[])
}

pub(crate) fn send_data(
    stack: &Arc<Stack>,
    fd: i32,
    inner: &mut Inner,
    tuple: &Tuple,
    payload: &[u8],
    push: bool,
) -> Result<(), Error> {
    let flags = F_ACK | if push { F_PSH } else { 0 };
    queue_send(stack, fd, inner, tuple, flags, payload)
}

pub(crate) fn send_fin(
    stack: &Arc<Stack>,
    fd: i32,
    inner: &mut Inner,
    tuple: &Tuple,
) -> Result<(), Error> {
    queue_send(stack, fd, inner, tuple, F_FIN | F_ACK, &[])
}

/// Pure acknowledgements bypass the retransmit queue; they are never
/// retransmitted on their own.
pub(crate) fn send_ack(stack: &Stack, inner: &Inner, tuple: &Tuple) {
    if let Err(e) = emit(
        stack,
        tuple,
        inner.tcb.snd.nxt,
        inner.tcb.rcv.nxt,
        inner.tcb.rcv.wnd,
        F_ACK,
        &[],
    ) {
        debug!("failed to send ack: {e}");
    }
}

/// Arms the RTO timer with the connection's current timeout. The timer
/// holds only the descriptor; the callback re-resolves the connection
/// through the socket table.
pub(crate) fn arm_rto(stack: &Arc<Stack>, fd: i32, inner: &mut Inner) {
    let weak = Arc::downgrade(stack);
    inner.retransmit = Some(stack.timer().schedule_us(inner.rto, move || {
        if let Some(stack) = weak.upgrade() {
            retransmit(&stack, fd);
        }
    }));
}

pub(crate) fn cancel_rto(stack: &Stack, inner: &mut Inner) {
    if let Some(id) = inner.retransmit.take() {
        stack.timer().cancel(id);
    }
}

/// RTO expiry: re-emit the head of the retransmit queue with doubled
/// timeout, up to the per-state retry ceiling.
pub(crate) fn retransmit(stack: &Arc<Stack>, fd: i32) {
    let Some(sock) = stack.socks().get_by_fd(fd) else {
        return;
    };

    let mut inner = sock.lock();
    // This firing consumed the scheduled timer.
    inner.retransmit = None;

    if inner.state == State::Closed {
        debug!("retransmit request on closed socket fd {fd}");
        return;
    }

    let Some(head) = inner.snd_queue.front() else {
        inner.retries = 0;
        inner.rto = TCP_START_RTO;
        return;
    };

    let ceiling = if inner.state == State::SynSent {
        TCP_CONN_RETRIES
    } else {
        TCP_MAX_RETRIES
    };
    if inner.retries >= ceiling {
        warn!("fd {fd}: no ack after {} retransmissions, giving up", inner.retries);
        inner.err = libc::ETIMEDOUT;
        sock.wake_all();
        return;
    }

    let seq = head.seq;
    let flags = head.flags;
    let payload = head.bytes().to_vec();
    let tuple = *sock.tuple.lock().unwrap();

    debug!(
        "fd {fd}: retransmitting seq {seq} after {} ticks (retry {})",
        inner.rto,
        inner.retries + 1
    );
    if let Err(e) = emit(
        stack,
        &tuple,
        seq,
        inner.tcb.rcv.nxt,
        inner.tcb.rcv.wnd,
        flags,
        &payload,
    ) {
        debug!("fd {fd}: retransmission failed: {e}");
    }

    inner.retries += 1;
    inner.rto = inner.rto.saturating_mul(2);
    arm_rto(stack, fd, &mut inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dev::ChannelWire;
    use crate::tcp::Tcb;
    use std::net::Ipv4Addr;

    fn test_tuple() -> Tuple {
        Tuple {
            sport: 50000,
            dport: 80,
            saddr: Ipv4Addr::new(10, 0, 0, 4),
            daddr: Ipv4Addr::new(10, 0, 0, 5),
        }
    }

    #[test]
    fn queued_segments_tile_the_sequence_space() {
        let (wire, peer) = ChannelWire::pair();
        let stack = Stack::with_wire(Config::default(), Box::new(wire), true);
        let sock = stack.socks().alloc();
        let tuple = test_tuple();
        *sock.tuple.lock().unwrap() = tuple;

        let mut inner = sock.lock();
        inner.state = State::Estab;
        inner.tcb = Tcb::open(1000);
        inner.tcb.snd.una = 1001;
        inner.tcb.snd.nxt = 1001;
        inner.tcb.snd.wnd = 10000;

        for len in [100usize, 300, 50] {
            queue_send(&stack, sock.fd, &mut inner, &tuple, F_ACK, &vec![7u8; len]).unwrap();
        }

        // SND.NXT advanced by exactly the bytes queued.
        assert_eq!(inner.tcb.snd.nxt, 1001 + 450);

        // Queue order matches sequence order and tiles [una, nxt).
        let mut expected = inner.tcb.snd.una;
        for seg in &inner.snd_queue {
            assert_eq!(seg.seq, expected);
            assert!(crate::tcp::wrapping_lt(seg.seq, seg.end_seq));
            expected = seg.end_seq;
        }
        assert_eq!(expected, inner.tcb.snd.nxt);

        // The timer is armed exactly once a segment is outstanding.
        assert!(inner.retransmit.is_some());
        drop(inner);

        // All three segments actually reached the wire.
        for len in [100usize, 300, 50] {
            let frame = peer.rx.recv().unwrap();
            assert_eq!(frame.len(), 20 + 20 + len);
        }
    }

    #[test]
    fn syn_and_fin_each_consume_one_sequence_number() {
        let (wire, _peer) = ChannelWire::pair();
        let stack = Stack::with_wire(Config::default(), Box::new(wire), true);
        let sock = stack.socks().alloc();
        let tuple = test_tuple();
        *sock.tuple.lock().unwrap() = tuple;

        let mut inner = sock.lock();
        inner.tcb = Tcb::open(5000);
        send_syn(&stack, sock.fd, &mut inner, &tuple).unwrap();
        assert_eq!(inner.tcb.snd.nxt, 5001);
        let syn = inner.snd_queue.back().unwrap();
        assert_eq!((syn.seq, syn.end_seq), (5000, 5001));

        send_fin(&stack, sock.fd, &mut inner, &tuple).unwrap();
        assert_eq!(inner.tcb.snd.nxt, 5002);
        let fin = inner.snd_queue.back().unwrap();
        assert_eq!((fin.seq, fin.end_seq), (5001, 5002));
    }

    #[test]
    fn acks_bypass_the_retransmit_queue() {
        let (wire, peer) = ChannelWire::pair();
        let stack = Stack::with_wire(Config::default(), Box::new(wire), true);
        let sock = stack.socks().alloc();
        let tuple = test_tuple();
        *sock.tuple.lock().unwrap() = tuple;

        let mut inner = sock.lock();
        inner.tcb = Tcb::open(9000);
        send_ack(&stack, &inner, &tuple);

        assert!(inner.snd_queue.is_empty());
        assert!(inner.retransmit.is_none());
        drop(inner);
        assert_eq!(peer.rx.recv().unwrap().len(), 40);
    }
}
