//! Managed connections and the process-wide socket table.
//!
//! Each [`Sock`] keeps its mutable state behind one mutex; the three
//! condition variables (state change, ACK arrival, data arrival) wait
//! on that same mutex, so a `wait_while` predicate always observes a
//! consistent snapshot. A terminal error must broadcast all three.
//!
//! Lock order: the tuple lock may be taken while holding the inner
//! lock, never the other way around. The receive path reads tuples
//! under the table's read lock without touching inner locks, so it can
//! never deadlock against an application thread blocked in the API.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use libc::c_int;
use log::{debug, trace};
use rand::Rng;

use crate::pktbuf::PktBuf;
use crate::tcp::{State, Tcb, TCP_START_RTO};
use crate::timer::{TimerId, TimerService};

/// Managed descriptors start here; anything below belongs to the kernel.
pub const SOCK_FD_START: i32 = 500_000;

pub const EPHEMERAL_PORT_MIN: u16 = 49152;
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

/// Local/remote orientation of a connection's 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple {
    pub sport: u16,
    pub dport: u16,
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
}

impl Default for Tuple {
    fn default() -> Self {
        Tuple {
            sport: 0,
            dport: 0,
            saddr: Ipv4Addr::UNSPECIFIED,
            daddr: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Everything the per-connection lock protects.
#[derive(Debug, Default)]
pub struct Inner {
    pub state: State,
    /// Last errno-equivalent to report through the API; 0 when clear.
    pub err: c_int,
    pub tcb: Tcb,
    /// Transmitted segments awaiting acknowledgement, in sequence order.
    pub snd_queue: VecDeque<PktBuf>,
    /// In-order data segments awaiting delivery to the application.
    pub rcv_queue: VecDeque<PktBuf>,
    /// Current retransmission timeout, in timer ticks.
    pub rto: u64,
    pub retries: u32,
    pub retransmit: Option<TimerId>,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            rto: TCP_START_RTO,
            ..Inner::default()
        }
    }
}

#[derive(Debug)]
pub struct Sock {
    pub fd: i32,
    pub(crate) tuple: Mutex<Tuple>,
    inner: Mutex<Inner>,
    pub(crate) state_cv: Condvar,
    pub(crate) ack_cv: Condvar,
    pub(crate) data_cv: Condvar,
}

impl Sock {
    fn new(fd: i32) -> Sock {
        Sock {
            fd,
            tuple: Mutex::new(Tuple::default()),
            inner: Mutex::new(Inner::new()),
            state_cv: Condvar::new(),
            ack_cv: Condvar::new(),
            data_cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Wakes every waiter on every condition. Required after any
    /// terminal error so no thread stays blocked on a dead connection.
    pub(crate) fn wake_all(&self) {
        self.state_cv.notify_all();
        self.ack_cv.notify_all();
        self.data_cv.notify_all();
    }

    /// Returns the connection to CLOSED: fresh TCB, cleared queues and
    /// tuple, cancelled retransmission.
    pub fn reset(&self, timer: &TimerService) {
        let mut inner = self.lock();
        inner.state = State::Closed;
        inner.err = 0;
        inner.tcb = Tcb::default();
        inner.snd_queue.clear();
        inner.rcv_queue.clear();
        inner.rto = TCP_START_RTO;
        inner.retries = 0;
        if let Some(id) = inner.retransmit.take() {
            timer.cancel(id);
        }
        *self.tuple.lock().unwrap() = Tuple::default();
        self.wake_all();
    }
}

struct TableInner {
    socks: Vec<Arc<Sock>>,
    next_fd: i32,
}

/// Process-wide registry of managed connections. Connection counts are
/// small, so lookups scan linearly under the read lock.
pub struct SockTable {
    table: RwLock<TableInner>,
    next_port: Mutex<u16>,
}

impl SockTable {
    pub fn new() -> SockTable {
        SockTable {
            table: RwLock::new(TableInner {
                socks: Vec::new(),
                next_fd: SOCK_FD_START,
            }),
            next_port: Mutex::new(
                rand::thread_rng().gen_range(EPHEMERAL_PORT_MIN..=EPHEMERAL_PORT_MAX),
            ),
        }
    }

    /// New connection in CLOSED with a freshly allocated descriptor.
    pub fn alloc(&self) -> Arc<Sock> {
        let mut table = self.table.write().unwrap();
        let fd = table.next_fd;
        table.next_fd += 1;

        let sock = Arc::new(Sock::new(fd));
        table.socks.push(sock.clone());
        trace!("allocated socket fd {fd}");
        sock
    }

    pub fn get_by_fd(&self, fd: i32) -> Option<Arc<Sock>> {
        let table = self.table.read().unwrap();
        table.socks.iter().find(|s| s.fd == fd).cloned()
    }

    /// Lookup in local/remote orientation; the receive path flips the
    /// packet's source and destination before calling this.
    pub fn get_by_tuple(
        &self,
        sport: u16,
        dport: u16,
        saddr: Ipv4Addr,
        daddr: Ipv4Addr,
    ) -> Option<Arc<Sock>> {
        let table = self.table.read().unwrap();
        table
            .socks
            .iter()
            .find(|s| {
                let t = s.tuple.lock().unwrap();
                t.sport == sport && t.dport == dport && t.saddr == saddr && t.daddr == daddr
            })
            .cloned()
    }

    /// Removes and destroys a connection. Refuses (returning false)
    /// when some other thread currently holds the connection lock; the
    /// caller retries.
    pub fn remove(&self, fd: i32, timer: &TimerService) -> bool {
        let mut table = self.table.write().unwrap();
        let Some(idx) = table.socks.iter().position(|s| s.fd == fd) else {
            return true;
        };

        match table.socks[idx].inner.try_lock() {
            Ok(mut inner) => {
                if let Some(id) = inner.retransmit.take() {
                    timer.cancel(id);
                }
            }
            Err(_) => {
                debug!("cannot remove socket fd {fd}: lock held elsewhere");
                return false;
            }
        }

        let sock = table.socks.remove(idx);
        sock.wake_all();
        trace!("removed socket fd {fd}");
        true
    }

    /// Next source port from the ephemeral range, monotonic with
    /// wrap-around, starting from a randomised offset.
    pub fn next_port(&self) -> u16 {
        let mut port = self.next_port.lock().unwrap();
        let ret = *port;
        *port = if ret == EPHEMERAL_PORT_MAX {
            EPHEMERAL_PORT_MIN
        } else {
            ret + 1
        };
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn descriptors_start_high_and_increase() {
        let table = SockTable::new();
        let a = table.alloc();
        let b = table.alloc();
        assert_eq!(a.fd, SOCK_FD_START);
        assert_eq!(b.fd, SOCK_FD_START + 1);
        assert_eq!(a.state(), State::Closed);
    }

    #[test]
    fn lookup_by_fd_and_tuple() {
        let table = SockTable::new();
        let sock = table.alloc();

        *sock.tuple.lock().unwrap() = Tuple {
            sport: 50000,
            dport: 80,
            saddr: Ipv4Addr::new(10, 0, 0, 4),
            daddr: Ipv4Addr::new(10, 0, 0, 5),
        };

        assert!(table.get_by_fd(sock.fd).is_some());
        assert!(table.get_by_fd(sock.fd + 7).is_none());

        let found = table
            .get_by_tuple(
                50000,
                80,
                Ipv4Addr::new(10, 0, 0, 4),
                Ipv4Addr::new(10, 0, 0, 5),
            )
            .expect("tuple lookup");
        assert_eq!(found.fd, sock.fd);

        assert!(table
            .get_by_tuple(
                50000,
                81,
                Ipv4Addr::new(10, 0, 0, 4),
                Ipv4Addr::new(10, 0, 0, 5),
            )
            .is_none());
    }

    #[test]
    fn remove_refuses_while_lock_held() {
        let table = SockTable::new();
        let timer = TimerService::start();
        let sock = table.alloc();
        let fd = sock.fd;

        let guard = sock.lock();
        assert!(!table.remove(fd, &timer));
        drop(guard);

        assert!(table.remove(fd, &timer));
        assert!(table.get_by_fd(fd).is_none());
        // Removing an unknown fd is not an error.
        assert!(table.remove(fd, &timer));
    }

    #[test]
    fn ephemeral_ports_stay_in_range_and_advance() {
        let table = SockTable::new();
        let first = table.next_port();
        assert!((EPHEMERAL_PORT_MIN..=EPHEMERAL_PORT_MAX).contains(&first));

        let second = table.next_port();
        if first == EPHEMERAL_PORT_MAX {
            assert_eq!(second, EPHEMERAL_PORT_MIN);
        } else {
            assert_eq!(second, first + 1);
        }
    }

    #[test]
    fn reset_clears_state_and_wakes_waiters() {
        let table = SockTable::new();
        let timer = TimerService::start();
        let sock = table.alloc();

        {
            let mut inner = sock.lock();
            inner.state = State::SynSent;
            inner.err = libc::ETIMEDOUT;
            let mut pkt = PktBuf::alloc(0);
            pkt.put(&[1, 2, 3]);
            inner.snd_queue.push_back(pkt);
        }

        let waiter = {
            let sock = sock.clone();
            thread::spawn(move || {
                let inner = sock.lock();
                let (inner, timed_out) = sock
                    .state_cv
                    .wait_timeout_while(inner, Duration::from_secs(2), |i| {
                        i.state != State::Closed
                    })
                    .unwrap();
                assert!(!timed_out.timed_out());
                assert_eq!(inner.state, State::Closed);
            })
        };

        thread::sleep(Duration::from_millis(20));
        sock.reset(&timer);
        waiter.join().unwrap();

        let inner = sock.lock();
        assert_eq!(inner.err, 0);
        assert!(inner.snd_queue.is_empty());
        assert_eq!(inner.rto, TCP_START_RTO);
    }
}
