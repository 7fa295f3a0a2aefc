use libc::c_int;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet build error: {0}")]
    PacketBuild(#[from] etherparse::ValueError),

    #[error("device has no carrier")]
    DeviceNotReady,

    #[error("connection already exists")]
    AlreadyConnected,

    #[error("connection does not exist")]
    NotConnected,

    #[error("queueing data on a not yet established connection is not supported")]
    NotEstablished,

    #[error("connection is closing")]
    Closing,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection timed out")]
    TimedOut,

    #[error("connection reset")]
    Reset,

    #[error("out of memory")]
    OutOfMemory,

    #[error("bad descriptor: {0}")]
    BadFd(i32),
}

impl Error {
    /// The POSIX error code the shim stores in the caller's errno.
    pub fn errno(&self) -> c_int {
        match self {
            Error::Tun(_) | Error::Io(_) | Error::PacketBuild(_) => libc::EIO,
            Error::DeviceNotReady => libc::ENETDOWN,
            Error::AlreadyConnected => libc::EISCONN,
            Error::NotConnected => libc::ENOTCONN,
            Error::NotEstablished => libc::EAGAIN,
            Error::Closing => libc::EPIPE,
            Error::InvalidArgument => libc::EINVAL,
            Error::ConnectionRefused => libc::ECONNREFUSED,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Reset => libc::ECONNRESET,
            Error::OutOfMemory => libc::ENOMEM,
            Error::BadFd(_) => libc::EBADF,
        }
    }

    /// Reverse mapping for errno values recorded on a connection by the
    /// packet paths (e.g. `ETIMEDOUT` set by the retransmit timer).
    pub fn from_errno(errno: c_int) -> Self {
        match errno {
            libc::EISCONN => Error::AlreadyConnected,
            libc::ENOTCONN => Error::NotConnected,
            libc::EPIPE => Error::Closing,
            libc::EINVAL => Error::InvalidArgument,
            libc::ECONNREFUSED => Error::ConnectionRefused,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::ECONNRESET => Error::Reset,
            libc::ENOMEM => Error::OutOfMemory,
            libc::ENETDOWN => Error::DeviceNotReady,
            _ => Error::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }
}
