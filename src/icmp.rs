//! ICMP echo responder.
//!
//! Deliberately byte-level: the reply is the request with the type
//! flipped and the checksum recomputed, sent back to the source.

use std::sync::Arc;

use etherparse::Ipv4HeaderSlice;
use log::{debug, trace};

use crate::ip::{self, inet_csum, IP_HDR_LEN, IPP_ICMP};
use crate::pktbuf::PktBuf;
use crate::Stack;

pub const ICMP_V4_REPLY: u8 = 0;
pub const ICMP_V4_ECHO: u8 = 8;

const ICMP_HDR_LEN: usize = 8;

pub fn icmp_rx(stack: &Arc<Stack>, ip4h: &Ipv4HeaderSlice, body: &[u8]) {
    if body.len() < ICMP_HDR_LEN {
        debug!("icmp rx: short message ({} bytes), dropping", body.len());
        return;
    }

    if inet_csum(body) != 0 {
        debug!("icmp rx: invalid checksum, dropping");
        return;
    }

    match (body[0], body[1]) {
        (ICMP_V4_ECHO, 0) => icmp_reply(stack, ip4h, body),
        (ty, code) => {
            trace!("icmp rx: unimplemented (type, code) pair ({ty}, {code}), dropping");
        }
    }
}

fn icmp_reply(stack: &Arc<Stack>, ip4h: &Ipv4HeaderSlice, body: &[u8]) {
    let mut pkt = PktBuf::alloc(IP_HDR_LEN);
    pkt.put(body);

    let reply = pkt.bytes_mut();
    reply[0] = ICMP_V4_REPLY;
    reply[2] = 0;
    reply[3] = 0;
    let csum = inet_csum(reply);
    reply[2..4].copy_from_slice(&csum.to_be_bytes());

    trace!("icmp tx: echo reply to {}", ip4h.source_addr());
    if let Err(e) = ip::ip_output(stack.dev(), ip4h.source_addr(), IPP_ICMP, &mut pkt) {
        debug!("icmp tx: failed to send reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dev::ChannelWire;
    use etherparse::Ipv4Header;
    use std::time::Duration;

    fn echo_frame(payload: &[u8]) -> Vec<u8> {
        let mut body = vec![ICMP_V4_ECHO, 0, 0, 0, 0x12, 0x34, 0, 1];
        body.extend_from_slice(payload);
        let csum = inet_csum(&body);
        body[2..4].copy_from_slice(&csum.to_be_bytes());

        let ip4h = Ipv4Header::new(body.len() as u16, 64, IPP_ICMP, [10, 0, 0, 5], [10, 0, 0, 4]);
        let mut frame = Vec::new();
        ip4h.write(&mut frame).unwrap();
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn echo_request_gets_a_reply() {
        let (wire, peer) = ChannelWire::pair();
        let _stack = Stack::with_wire(Config::default(), Box::new(wire), true);

        peer.tx.send(echo_frame(b"ping payload")).unwrap();

        let reply = peer.rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let ip4h = Ipv4HeaderSlice::from_slice(&reply).unwrap();
        assert_eq!(ip4h.protocol(), IPP_ICMP);
        assert_eq!(ip4h.destination_addr().octets(), [10, 0, 0, 5]);

        let body = &reply[20..];
        assert_eq!(body[0], ICMP_V4_REPLY);
        assert_eq!(inet_csum(body), 0);
        assert_eq!(&body[ICMP_HDR_LEN..], b"ping payload");
    }

    #[test]
    fn corrupted_echo_is_dropped() {
        let (wire, peer) = ChannelWire::pair();
        let _stack = Stack::with_wire(Config::default(), Box::new(wire), true);

        let mut frame = echo_frame(b"x");
        let last = frame.len() - 1;
        frame[last] ^= 0xff; // payload no longer matches the checksum
        peer.tx.send(frame).unwrap();

        assert!(peer.rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
