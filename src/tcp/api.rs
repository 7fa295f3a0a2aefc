//! The application-facing core operations: active open, send, receive
//! and close. Each runs on the caller's thread and blocks on the
//! connection's condition variables while the packet paths make
//! progress.

use std::cmp;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::err::Error;
use crate::sock::{Sock, Tuple};
use crate::tcp::{tx, State, Tcb, TCP_CONN_RETRIES, TCP_CONN_WAIT, TCP_SAFE_MTU, TCP_START_RTO};
use crate::Stack;

/// How long the active open waits for the handshake to complete.
const CONNECT_DEADLINE: Duration = Duration::from_secs(2);

/// Active open: emit SYN, enter SYN-SENT and wait for the handshake.
/// Permitted only from CLOSED.
pub fn connect(
    stack: &Arc<Stack>,
    sock: &Arc<Sock>,
    daddr: Ipv4Addr,
    dport: u16,
) -> Result<(), Error> {
    let mut inner = sock.lock();
    if inner.state != State::Closed {
        inner.err = libc::EISCONN;
        return Err(Error::AlreadyConnected);
    }

    let tuple = Tuple {
        sport: stack.socks().next_port(),
        dport,
        saddr: stack.dev().addr,
        daddr,
    };
    *sock.tuple.lock().unwrap() = tuple;

    inner.rto = TCP_START_RTO;
    inner.retries = 0;
    inner.tcb = Tcb::open(stack.generate_iss());

    // The first SYN can fail while the device is still coming up; give
    // it a few attempts, pausing on the readiness latch between them.
    let mut attempts = 0;
    loop {
        match tx::send_syn(stack, sock.fd, &mut inner, &tuple) {
            Ok(()) => break,
            Err(e) if attempts < TCP_CONN_RETRIES => {
                attempts += 1;
                debug!(
                    "fd {}: failed to emit syn ({e}), attempt {attempts}/{TCP_CONN_RETRIES}",
                    sock.fd
                );
                drop(inner);
                stack.dev().wait_ready(Duration::from_micros(TCP_CONN_WAIT));
                inner = sock.lock();
                if inner.state != State::Closed {
                    // Someone else raced a connect in; bail out.
                    inner.err = libc::EISCONN;
                    return Err(Error::AlreadyConnected);
                }
            }
            Err(e) => {
                warn!("fd {}: could not emit syn: {e}", sock.fd);
                inner.err = libc::ECONNREFUSED;
                drop(inner);
                sock.reset(stack.timer());
                return Err(Error::ConnectionRefused);
            }
        }
    }

    inner.state = State::SynSent;
    debug!("fd {}: syn sent to {}:{}", sock.fd, daddr, dport);

    let (inner, _) = sock
        .state_cv
        .wait_timeout_while(inner, CONNECT_DEADLINE, |i| {
            i.state != State::Estab && i.err == 0
        })
        .unwrap();

    if inner.state == State::Estab {
        return Ok(());
    }

    let err = if inner.err != 0 {
        Error::from_errno(inner.err)
    } else {
        Error::ConnectionRefused
    };
    drop(inner);
    sock.reset(stack.timer());
    Err(err)
}

/// Queues `buf` for transmission in window-bounded segments. Blocks on
/// the ACK condition while the usable window is closed. Returns the
/// number of bytes handed to the wire, which is less than `buf.len()`
/// only on error.
pub fn send(stack: &Arc<Stack>, sock: &Arc<Sock>, buf: &[u8]) -> Result<usize, Error> {
    if buf.is_empty() {
        let mut inner = sock.lock();
        inner.err = libc::EINVAL;
        return Err(Error::InvalidArgument);
    }

    let tuple = *sock.tuple.lock().unwrap();
    let mut inner = sock.lock();

    match inner.state {
        State::Estab | State::CloseWait => {}
        State::Closed => {
            inner.err = libc::ENOTCONN;
            return Err(Error::NotConnected);
        }
        State::Listen | State::SynSent | State::SynRcvd => {
            return Err(Error::NotEstablished);
        }
        _ => {
            inner.err = libc::EPIPE;
            return Err(Error::Closing);
        }
    }

    let mut sent = 0usize;
    while sent < buf.len() {
        if inner.err != 0 {
            let err = inner.err;
            return partial(sent, Error::from_errno(err));
        }
        if !matches!(inner.state, State::Estab | State::CloseWait) {
            return partial(sent, Error::Closing);
        }

        // Re-read the usable window every round; ACK processing both
        // widens and (via a shrunken advertisement) narrows it.
        let mut window = inner.tcb.usable_window() as usize;
        if window == 0 {
            inner = sock
                .ack_cv
                .wait_while(inner, |i| {
                    i.tcb.usable_window() == 0
                        && i.err == 0
                        && matches!(i.state, State::Estab | State::CloseWait)
                })
                .unwrap();
            if inner.err != 0 {
                let err = inner.err;
                return partial(sent, Error::from_errno(err));
            }
            if !matches!(inner.state, State::Estab | State::CloseWait) {
                return partial(sent, Error::Closing);
            }
            window = inner.tcb.usable_window() as usize;
        }

        let chunk = cmp::min(cmp::min(TCP_SAFE_MTU, window), buf.len() - sent);
        let push = sent + chunk == buf.len();
        match tx::send_data(stack, sock.fd, &mut inner, &tuple, &buf[sent..sent + chunk], push) {
            Ok(()) => sent += chunk,
            Err(e) => return partial(sent, e),
        }
    }

    Ok(sent)
}

fn partial(sent: usize, err: Error) -> Result<usize, Error> {
    if sent > 0 {
        Ok(sent)
    } else {
        Err(err)
    }
}

/// Drains whole segments from the receive queue into `buf`, blocking
/// until data, end of stream or a connection error. A segment that
/// would overflow the remaining buffer stays queued.
pub fn receive(sock: &Arc<Sock>, buf: &mut [u8]) -> Result<usize, Error> {
    let mut inner = sock.lock();

    match inner.state {
        State::Estab | State::FinWait1 | State::FinWait2 => {}
        State::CloseWait if !inner.rcv_queue.is_empty() => {}
        State::Closed => {
            inner.err = libc::ENOTCONN;
            return Err(Error::NotConnected);
        }
        State::Listen | State::SynSent | State::SynRcvd => {
            return Err(Error::NotEstablished);
        }
        _ => {
            inner.err = libc::EPIPE;
            return Err(Error::Closing);
        }
    }

    inner = sock
        .data_cv
        .wait_while(inner, |i| {
            i.rcv_queue.is_empty()
                && i.err == 0
                && matches!(i.state, State::Estab | State::FinWait1 | State::FinWait2)
        })
        .unwrap();

    if inner.rcv_queue.is_empty() {
        if inner.err != 0 {
            let err = inner.err;
            return Err(Error::from_errno(err));
        }
        // The peer closed while we were blocked: end of stream.
        return Ok(0);
    }

    let mut received = 0usize;
    while let Some(head) = inner.rcv_queue.front() {
        let len = head.len();
        if received + len > buf.len() {
            break;
        }
        buf[received..received + len].copy_from_slice(head.bytes());
        received += len;
        // Consumed bytes reopen the advertised window.
        inner.tcb.rcv.wnd += len as u16;
        inner.rcv_queue.pop_front();
    }

    Ok(received)
}

/*
Close behaviour by state:

    CLOSED                   error (not connected)
    LISTEN, SYN-SENT         abandon, back to CLOSED
    SYN-RECEIVED, ESTAB      send FIN, FIN-WAIT-1, wait for TIME-WAIT
    FIN-WAIT-1, FIN-WAIT-2   already closing, succeed
    CLOSE-WAIT               send FIN, LAST-ACK, wait for CLOSED
    CLOSING, LAST-ACK,
    TIME-WAIT                error (already closing)
*/
pub fn close(stack: &Arc<Stack>, sock: &Arc<Sock>) -> Result<(), Error> {
    let tuple = *sock.tuple.lock().unwrap();
    let mut inner = sock.lock();

    match inner.state {
        State::Closed => {
            inner.err = libc::ENOTCONN;
            Err(Error::NotConnected)
        }
        State::Listen | State::SynSent => {
            tx::cancel_rto(stack, &mut inner);
            inner.snd_queue.clear();
            inner.state = State::Closed;
            sock.state_cv.notify_all();
            Ok(())
        }
        State::SynRcvd | State::Estab => {
            tx::send_fin(stack, sock.fd, &mut inner, &tuple)?;
            inner.state = State::FinWait1;
            debug!("fd {}: fin sent, fin-wait-1", sock.fd);
            sock.state_cv.notify_all();

            let inner = sock
                .state_cv
                .wait_while(inner, |i| {
                    !matches!(i.state, State::TimeWait | State::Closed) && i.err == 0
                })
                .unwrap();
            finish_close(&inner)
        }
        State::FinWait1 | State::FinWait2 => Ok(()),
        State::CloseWait => {
            tx::send_fin(stack, sock.fd, &mut inner, &tuple)?;
            inner.state = State::LastAck;
            debug!("fd {}: fin sent, last-ack", sock.fd);
            sock.state_cv.notify_all();

            let inner = sock
                .state_cv
                .wait_while(inner, |i| i.state != State::Closed && i.err == 0)
                .unwrap();
            finish_close(&inner)
        }
        State::Closing | State::LastAck | State::TimeWait => {
            inner.err = libc::EPIPE;
            Err(Error::Closing)
        }
    }
}

fn finish_close(inner: &crate::sock::Inner) -> Result<(), Error> {
    if inner.err != 0 {
        Err(Error::from_errno(inner.err))
    } else {
        Ok(())
    }
}
