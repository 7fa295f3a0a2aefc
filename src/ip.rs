//! IPv4 formatting, parsing and protocol dispatch.

use std::io::Cursor;
use std::net::Ipv4Addr;
use std::sync::Arc;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};
use log::{debug, trace};

use crate::dev::Netdev;
use crate::err::Error;
use crate::pktbuf::PktBuf;
use crate::{icmp, tcp, Stack};

pub const IP_HDR_LEN: usize = 20;
pub const IP_TTL: u8 = 64;

pub const IPP_ICMP: u8 = 1;
pub const IPP_TCP: u8 = 6;

/// Standard 16-bit ones'-complement sum. Returns the value to store in
/// a checksum field; summing a region with a valid checksum in place
/// yields zero.
pub fn inet_csum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

pub(crate) fn write_err(e: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        e.to_string(),
    ))
}

/// Prepends the IPv4 header onto `pkt` and hands the frame to the
/// device. Fails without transmitting while the device is not ready.
pub fn ip_output(
    dev: &Netdev,
    daddr: Ipv4Addr,
    protocol: u8,
    pkt: &mut PktBuf,
) -> Result<usize, Error> {
    if !dev.is_ready() {
        return Err(Error::DeviceNotReady);
    }

    let ip4h = Ipv4Header::new(
        pkt.len() as u16,
        IP_TTL,
        protocol,
        dev.addr.octets(),
        daddr.octets(),
    );

    let hdr = pkt.push(IP_HDR_LEN);
    ip4h.write(&mut Cursor::new(hdr)).map_err(write_err)?;

    trace!(
        "ip out: {} -> {} proto {} len {}",
        dev.addr,
        daddr,
        protocol,
        pkt.len()
    );

    dev.xmit(pkt.bytes())
}

/// Entry point of the background I/O loop: validate the IPv4 header
/// and dispatch the payload by protocol number.
pub fn ip_rx(stack: &Arc<Stack>, frame: &[u8]) {
    let ip4h = match Ipv4HeaderSlice::from_slice(frame) {
        Ok(slice) => slice,
        Err(e) => {
            debug!("ip rx: unparsable header, dropping: {e}");
            return;
        }
    };

    let hdr_len = usize::from(ip4h.ihl()) * 4;
    if inet_csum(&frame[..hdr_len]) != 0 {
        debug!("ip rx: bad header checksum, dropping");
        return;
    }

    if ip4h.destination_addr() != stack.dev().addr {
        trace!("ip rx: not for us ({}), dropping", ip4h.destination_addr());
        return;
    }

    let total_len = usize::from(ip4h.total_len()).min(frame.len());
    if total_len < hdr_len {
        debug!("ip rx: truncated datagram, dropping");
        return;
    }
    let payload = &frame[hdr_len..total_len];

    match ip4h.protocol() {
        IPP_TCP => tcp::rx::tcp_rx(stack, &ip4h, payload),
        IPP_ICMP => icmp::icmp_rx(stack, &ip4h, payload),
        other => trace!("ip rx: unhandled protocol {other}, dropping"),
    }
}
