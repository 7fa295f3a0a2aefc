//! libc symbol interposition.
//!
//! Built as a `cdylib` and loaded with `LD_PRELOAD`, these definitions
//! shadow the C library's socket entry points. Calls concerning a
//! managed descriptor (>= `SOCK_FD_START`) are translated onto the
//! stack's core operations; everything else is forwarded to the real
//! implementations resolved through `dlsym(RTLD_NEXT, ..)`.

use std::mem;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use libc::{c_char, c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};
use log::{debug, warn};

use crate::sock::SOCK_FD_START;
use crate::Stack;

type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;

struct RealFns {
    socket: SocketFn,
    connect: ConnectFn,
    send: SendFn,
    recv: RecvFn,
    close: CloseFn,
}

unsafe fn resolve<T: Copy>(name: &[u8]) -> T {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
    assert!(
        !sym.is_null(),
        "next symbol {:?} not found",
        std::str::from_utf8(&name[..name.len() - 1]).unwrap_or("?")
    );
    mem::transmute_copy(&sym)
}

fn real() -> &'static RealFns {
    static REAL: OnceLock<RealFns> = OnceLock::new();
    REAL.get_or_init(|| unsafe {
        RealFns {
            socket: resolve(b"socket\0"),
            connect: resolve(b"connect\0"),
            send: resolve(b"send\0"),
            recv: resolve(b"recv\0"),
            close: resolve(b"close\0"),
        }
    })
}

fn set_errno(errno: c_int) {
    unsafe {
        *libc::__errno_location() = errno;
    }
}

fn is_managed(fd: c_int) -> bool {
    fd >= SOCK_FD_START
}

fn is_socket_supported(domain: c_int, ty: c_int, protocol: c_int) -> bool {
    domain == libc::AF_INET
        && (ty & libc::SOCK_STREAM) != 0
        && (protocol == 0 || protocol == libc::IPPROTO_TCP)
}

/// # Safety
/// C ABI entry point; arguments follow the `socket(2)` contract.
#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if is_socket_supported(domain, ty, protocol) {
        if let Some(stack) = Stack::global() {
            let fd = stack.socket();
            debug!("shim: managed socket fd {fd}");
            return fd;
        }
        warn!("shim: stack unavailable, passing AF_INET stream socket through");
    }

    (real().socket)(domain, ty, protocol)
}

/// # Safety
/// C ABI entry point; `addr` must point to `addrlen` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    if !is_managed(fd) {
        return (real().connect)(fd, addr, addrlen);
    }

    let Some(stack) = Stack::global() else {
        set_errno(libc::EBADF);
        return -1;
    };

    if addr.is_null() || (addrlen as usize) < mem::size_of::<libc::sockaddr_in>() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let sin = &*(addr as *const libc::sockaddr_in);
    if c_int::from(sin.sin_family) != libc::AF_INET {
        set_errno(libc::EAFNOSUPPORT);
        return -1;
    }

    let daddr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    let dport = u16::from_be(sin.sin_port);

    match stack.connect(fd, daddr, dport) {
        Ok(()) => 0,
        Err(e) => {
            debug!("shim: connect fd {fd} failed: {e}");
            set_errno(e.errno());
            -1
        }
    }
}

/// # Safety
/// C ABI entry point; `buf` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    if !is_managed(fd) {
        return (real().send)(fd, buf, len, flags);
    }

    let Some(stack) = Stack::global() else {
        set_errno(libc::EBADF);
        return -1;
    };
    if buf.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }

    let data = std::slice::from_raw_parts(buf as *const u8, len);
    match stack.send(fd, data) {
        Ok(n) => n as ssize_t,
        Err(e) => {
            set_errno(e.errno());
            -1
        }
    }
}

/// # Safety
/// C ABI entry point; `buf` must point to `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    if !is_managed(fd) {
        return (real().recv)(fd, buf, len, flags);
    }

    let Some(stack) = Stack::global() else {
        set_errno(libc::EBADF);
        return -1;
    };
    if buf.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }

    let data = std::slice::from_raw_parts_mut(buf as *mut u8, len);
    match stack.recv(fd, data) {
        Ok(n) => n as ssize_t,
        Err(e) => {
            set_errno(e.errno());
            -1
        }
    }
}

/// # Safety
/// C ABI entry point.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !is_managed(fd) {
        return (real().close)(fd);
    }

    let Some(stack) = Stack::global() else {
        set_errno(libc::EBADF);
        return -1;
    };

    match stack.close(fd) {
        Ok(()) => 0,
        Err(e) => {
            set_errno(e.errno());
            -1
        }
    }
}
