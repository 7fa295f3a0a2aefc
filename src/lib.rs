//! A user-space TCP client stack over a TUN device.
//!
//! An unmodified application, run with this crate's `cdylib` preloaded,
//! gets its `socket`/`connect`/`send`/`recv`/`close` calls for AF_INET
//! stream sockets served by this stack instead of the kernel. The same
//! operations are available directly on [`Stack`] for code that links
//! the crate (the demo binary and the test suite do).
//!
//! Threads: the caller's threads block inside the API operations; one
//! background thread reads frames from the device and drives the
//! receive path; the timer service's thread fires retransmissions.

use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use log::{error, info, warn};

mod config;
mod dev;
mod err;
mod icmp;
mod ip;
mod pktbuf;
mod shim;
mod sock;
mod tcp;
mod timer;

pub use config::Config;
pub use dev::{ChannelPeer, ChannelWire, Netdev, TunWire, Wire};
pub use err::Error;
pub use pktbuf::PktBuf;
pub use sock::{Sock, SockTable, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN, SOCK_FD_START};
pub use tcp::{State, Tcb};

use timer::TimerService;

pub struct Stack {
    cfg: Config,
    dev: Netdev,
    timer: TimerService,
    socks: SockTable,
}

impl Stack {
    /// Brings the stack up on a real TUN device.
    pub fn new(cfg: Config) -> Result<Arc<Stack>, Error> {
        let wire = TunWire::open(&cfg)?;
        info!("stack up on {} ({})", cfg.ifname, cfg.addr);
        Ok(Stack::with_wire(cfg, Box::new(wire), true))
    }

    /// Assembles a stack over an arbitrary wire. Tests pass a
    /// [`ChannelWire`] and control readiness themselves.
    pub fn with_wire(cfg: Config, wire: Box<dyn Wire>, ready: bool) -> Arc<Stack> {
        let stack = Arc::new(Stack {
            dev: Netdev::new(wire, cfg.addr, ready),
            timer: TimerService::start(),
            socks: SockTable::new(),
            cfg,
        });

        let weak = Arc::downgrade(&stack);
        thread::spawn(move || rx_loop(weak));

        stack
    }

    /// The process-wide stack used by the interposition shim, built
    /// from the environment on first use. `None` when bring-up failed
    /// (the shim then passes everything through to the kernel).
    pub fn global() -> Option<&'static Arc<Stack>> {
        static GLOBAL: OnceLock<Option<Arc<Stack>>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let _ = env_logger::try_init();
                match Stack::new(Config::from_env()) {
                    Ok(stack) => Some(stack),
                    Err(e) => {
                        error!("failed to bring the stack up: {e}");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Allocates a managed connection in CLOSED and returns its
    /// descriptor (always >= [`SOCK_FD_START`]).
    pub fn socket(&self) -> i32 {
        self.socks.alloc().fd
    }

    /// Active open towards `daddr:dport`.
    pub fn connect(self: &Arc<Self>, fd: i32, daddr: Ipv4Addr, dport: u16) -> Result<(), Error> {
        let sock = self.socks.get_by_fd(fd).ok_or(Error::BadFd(fd))?;
        tcp::api::connect(self, &sock, daddr, dport)
    }

    pub fn send(self: &Arc<Self>, fd: i32, buf: &[u8]) -> Result<usize, Error> {
        let sock = self.socks.get_by_fd(fd).ok_or(Error::BadFd(fd))?;
        tcp::api::send(self, &sock, buf)
    }

    pub fn recv(self: &Arc<Self>, fd: i32, buf: &mut [u8]) -> Result<usize, Error> {
        let sock = self.socks.get_by_fd(fd).ok_or(Error::BadFd(fd))?;
        tcp::api::receive(&sock, buf)
    }

    /// Graceful close, then removal from the socket table. A removal
    /// that finds the connection lock held is retried.
    pub fn close(self: &Arc<Self>, fd: i32) -> Result<(), Error> {
        let sock = self.socks.get_by_fd(fd).ok_or(Error::BadFd(fd))?;
        let ret = tcp::api::close(self, &sock);

        let mut removed = false;
        for _ in 0..64 {
            if self.socks.remove(fd, &self.timer) {
                removed = true;
                break;
            }
            thread::yield_now();
        }
        if !removed {
            warn!("fd {fd}: socket stayed busy through close, leaving it in the table");
        }
        ret
    }

    /// Connection state, for observability and tests.
    pub fn state(&self, fd: i32) -> Option<State> {
        self.socks.get_by_fd(fd).map(|s| s.state())
    }

    /// ISS generation: low-order 31 bits of the monotonic tick counter.
    pub(crate) fn generate_iss(&self) -> u32 {
        (self.timer.ticks_us() % i32::MAX as u64) as u32
    }

    pub(crate) fn dev(&self) -> &Netdev {
        &self.dev
    }

    /// Test hook: flip the device readiness latch.
    pub fn set_device_ready(&self, up: bool) {
        self.dev.set_ready(up);
    }

    pub(crate) fn timer(&self) -> &TimerService {
        &self.timer
    }

    pub(crate) fn socks(&self) -> &SockTable {
        &self.socks
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

/// Background I/O loop: pull frames off the device and hand them to
/// the IP layer. Holds only a weak reference so a dropped stack tears
/// the loop down.
fn rx_loop(stack: Weak<Stack>) {
    let mut buf = [0u8; 1500];
    loop {
        let Some(stack) = stack.upgrade() else {
            return;
        };
        match stack.dev.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => ip::ip_rx(&stack, &buf[..n]),
            Err(e) => {
                warn!("device receive failed, stopping i/o loop: {e}");
                return;
            }
        }
    }
}
