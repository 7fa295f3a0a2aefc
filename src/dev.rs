//! Datagram devices.
//!
//! [`Wire`] moves whole IPv4 frames between the stack and the outside
//! world. The production implementation is a TUN device; tests plug in
//! [`ChannelWire`], an in-memory pair of frame queues driven by a
//! scripted peer.
//!
//! [`Netdev`] wraps a wire with the local address and a readiness
//! latch. The latch stands in for neighbour resolution on a cold start:
//! `ip_output` refuses to transmit until the device reports ready, and
//! the connect path waits on the latch between SYN attempts.

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

use crate::config::Config;
use crate::err::Error;

/// How long a single `recv` waits before giving the caller a chance to
/// observe shutdown, in milliseconds.
const RECV_POLL_MS: u64 = 100;

pub trait Wire: Send + Sync {
    /// Transmits one IPv4 frame.
    fn xmit(&self, frame: &[u8]) -> Result<usize, Error>;

    /// Waits briefly for an inbound frame. `Ok(0)` means none arrived
    /// within the poll interval.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, Error>;
}

pub struct TunWire {
    // Held for the lifetime of the device; all I/O goes through the fd.
    _tun: Tun,
    fd: RawFd,
}

impl TunWire {
    pub fn open(cfg: &Config) -> Result<TunWire, Error> {
        let tun = Tun::new(&cfg.ifname, false)?;
        tun.set_addr(cfg.addr)?;
        tun.set_netmask(cfg.netmask)?;
        tun.bring_up()?;

        let fd = tun.as_raw_fd();
        Ok(TunWire { _tun: tun, fd })
    }
}

fn os_err(errno: nix::errno::Errno) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(errno as i32))
}

impl Wire for TunWire {
    fn xmit(&self, frame: &[u8]) -> Result<usize, Error> {
        nix::unistd::write(self.fd, frame).map_err(os_err)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut pfd = [PollFd::new(self.fd, PollFlags::POLLIN)];
        match poll(&mut pfd[..], RECV_POLL_MS as i32) {
            Ok(0) => Ok(0),
            Ok(_) => nix::unistd::read(self.fd, buf).map_err(os_err),
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(e) => Err(os_err(e)),
        }
    }
}

/// In-memory wire: frames transmitted by the stack appear on the peer's
/// receiver, frames sent by the peer are handed to the stack.
pub struct ChannelWire {
    to_peer: Mutex<Sender<Vec<u8>>>,
    from_peer: Mutex<Receiver<Vec<u8>>>,
}

/// The far end of a [`ChannelWire`], held by a test's scripted peer.
pub struct ChannelPeer {
    pub tx: Sender<Vec<u8>>,
    pub rx: Receiver<Vec<u8>>,
}

impl ChannelWire {
    pub fn pair() -> (ChannelWire, ChannelPeer) {
        let (stack_tx, peer_rx) = mpsc::channel();
        let (peer_tx, stack_rx) = mpsc::channel();
        (
            ChannelWire {
                to_peer: Mutex::new(stack_tx),
                from_peer: Mutex::new(stack_rx),
            },
            ChannelPeer {
                tx: peer_tx,
                rx: peer_rx,
            },
        )
    }
}

impl Wire for ChannelWire {
    fn xmit(&self, frame: &[u8]) -> Result<usize, Error> {
        self.to_peer
            .lock()
            .unwrap()
            .send(frame.to_vec())
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer hung up",
                ))
            })?;
        Ok(frame.len())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let rx = self.from_peer.lock().unwrap();
        match rx.recv_timeout(Duration::from_millis(RECV_POLL_MS)) {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer hung up",
            ))),
        }
    }
}

pub struct Netdev {
    wire: Box<dyn Wire>,
    pub addr: Ipv4Addr,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

impl Netdev {
    pub fn new(wire: Box<dyn Wire>, addr: Ipv4Addr, ready: bool) -> Netdev {
        Netdev {
            wire,
            addr,
            ready: Mutex::new(ready),
            ready_cv: Condvar::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock().unwrap()
    }

    pub fn set_ready(&self, up: bool) {
        *self.ready.lock().unwrap() = up;
        self.ready_cv.notify_all();
    }

    /// Waits up to `timeout` for the device to come up. Returns the
    /// readiness observed at the end of the wait.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let ready = self.ready.lock().unwrap();
        let (ready, _) = self
            .ready_cv
            .wait_timeout_while(ready, timeout, |up| !*up)
            .unwrap();
        *ready
    }

    pub fn xmit(&self, frame: &[u8]) -> Result<usize, Error> {
        self.wire.xmit(frame)
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.wire.recv(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_wire_round_trips_frames() {
        let (wire, peer) = ChannelWire::pair();

        wire.xmit(&[1, 2, 3]).unwrap();
        assert_eq!(peer.rx.recv().unwrap(), vec![1, 2, 3]);

        peer.tx.send(vec![4, 5]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(wire.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[test]
    fn readiness_latch_wakes_waiters() {
        use std::sync::Arc;

        let dev = Arc::new(Netdev::new(
            Box::new(ChannelWire::pair().0),
            Ipv4Addr::new(10, 0, 0, 4),
            false,
        ));
        assert!(!dev.wait_ready(Duration::from_millis(10)));

        let dev2 = dev.clone();
        let waiter = std::thread::spawn(move || dev2.wait_ready(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        dev.set_ready(true);
        assert!(waiter.join().unwrap());
    }
}
