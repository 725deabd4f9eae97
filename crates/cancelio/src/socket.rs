use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::str::FromStr;

use tracing::warn;

use crate::error::SetupError;

fn set_nonblocking(fd: RawFd) -> Result<(), SetupError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(SetupError::NonBlocking(io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(SetupError::NonBlocking(io::Error::last_os_error()));
    }
    Ok(())
}

fn sockaddr_in(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from(addr).to_be() },
        sin_zero: [0; 8],
    }
}

fn new_tcp_socket() -> Result<RawFd, SetupError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(SetupError::Socket(io::Error::last_os_error()));
    }
    Ok(fd)
}

/// Opens a fresh non-blocking TCP socket, ready to `connect`.
pub(crate) fn new_nonblocking_tcp_socket() -> Result<RawFd, SetupError> {
    let fd = new_tcp_socket()?;
    if let Err(e) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Starts a non-blocking connect to `ip:port`. Returns `true` if the socket
/// is connected or the connect is in progress (`EINPROGRESS`); the caller
/// must confirm completion with a writability wait. Returns `false` on a
/// malformed address or any other immediate failure.
pub(crate) fn connect_nonblocking(fd: RawFd, ip: &str, port: u16) -> bool {
    let Ok(addr) = Ipv4Addr::from_str(ip) else {
        warn!(ip, "not a valid IPv4 address");
        return false;
    };
    let sa = sockaddr_in(addr, port);
    let rc = unsafe {
        libc::connect(
            fd,
            std::ptr::addr_of!(sa).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return true;
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    warn!(%err, ip, port, "connect failed");
    false
}

/// Creates a non-blocking listening socket bound to `0.0.0.0:port`.
pub(crate) fn listen_nonblocking(port: u16, backlog: i32) -> Result<RawFd, SetupError> {
    let fd = new_tcp_socket()?;

    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(enable).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(SetupError::ReuseAddr(err));
    }

    let sa = sockaddr_in(Ipv4Addr::UNSPECIFIED, port);
    let rc = unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(sa).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(SetupError::Bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), err));
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(SetupError::Listen(err));
    }

    if let Err(e) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    Ok(fd)
}

/// Accepts a pending connection as a non-blocking socket. `Ok(None)` means
/// no connection was waiting (`EAGAIN`/`EWOULDBLOCK`); the caller is
/// expected to have already confirmed readability via a poll wait, so this
/// is purely defensive against spurious wakeups.
pub(crate) fn accept_nonblocking(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    let fd = unsafe {
        libc::accept4(listen_fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK)
    };
    if fd >= 0 {
        return Ok(Some(fd));
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(None),
        _ => Err(err),
    }
}
