//! Raw syscall plumbing for the socket core.
//!
//! Everything platform-specific lives here: non-blocking fds, the worker's
//! self-pipe, `getaddrinfo`, `select`-based readiness waits and socket
//! options. Error values are POSIX errnos carried as [`SysError`].

#[cfg(not(unix))]
compile_error!("the skiff socket core requires a Unix platform (select/self-pipe/getaddrinfo)");

use std::ffi::CStr;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::SysError;
use crate::socket::SocketFlags;

pub(crate) fn last_error() -> SysError {
    SysError::last_os_error()
}

pub(crate) fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), SysError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(last_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(last_error());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags != -1 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

// =============================================================================
// Self-pipe
// =============================================================================

pub(crate) fn pipe() -> Result<[RawFd; 2], SysError> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(last_error());
    }
    for fd in fds {
        set_cloexec(fd);
    }
    // The read end is drained opportunistically and must never block.
    set_nonblocking(fds[0])?;
    Ok(fds)
}

pub(crate) fn pipe_write(fd: RawFd) {
    let byte = 0u8;
    loop {
        let res = unsafe { libc::write(fd, &byte as *const u8 as *const c_void, 1) };
        if res != -1 || last_error().0 != libc::EINTR {
            return;
        }
    }
}

pub(crate) fn pipe_drain(fd: RawFd) {
    let mut buf = [0u8; 128];
    unsafe {
        // Nonblocking read, return value irrelevant.
        let _ = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
    }
}

// =============================================================================
// Name resolution
// =============================================================================

/// An owned `getaddrinfo` result list.
pub(crate) struct AddrList {
    head: *mut libc::addrinfo,
}

impl AddrList {
    pub(crate) fn iter(&self) -> AddrIter<'_> {
        AddrIter { cur: self.head, _list: self }
    }
}

impl Drop for AddrList {
    fn drop(&mut self) {
        if !self.head.is_null() {
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

pub(crate) struct AddrIter<'a> {
    cur: *mut libc::addrinfo,
    _list: &'a AddrList,
}

impl<'a> Iterator for AddrIter<'a> {
    type Item = &'a libc::addrinfo;

    fn next(&mut self) -> Option<&'a libc::addrinfo> {
        if self.cur.is_null() {
            return None;
        }
        let item = unsafe { &*self.cur };
        self.cur = item.ai_next;
        Some(item)
    }
}

/// Blocking resolver call. `host == None` resolves a passive (bind) address.
pub(crate) fn resolve(
    host: Option<&CStr>,
    port: &CStr,
    family: c_int,
    passive: bool,
) -> Result<AddrList, SysError> {
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family;
    hints.ai_socktype = libc::SOCK_STREAM;
    if passive {
        hints.ai_flags = libc::AI_PASSIVE | libc::AI_NUMERICSERV;
    }

    let mut head: *mut libc::addrinfo = ptr::null_mut();
    let res = unsafe {
        libc::getaddrinfo(
            host.map_or(ptr::null(), |h| h.as_ptr()),
            port.as_ptr(),
            &hints,
            &mut head,
        )
    };
    if res != 0 {
        if res == libc::EAI_SYSTEM {
            return Err(last_error());
        }
        return Err(SysError(res));
    }
    Ok(AddrList { head })
}

// =============================================================================
// Socket creation and options
// =============================================================================

pub(crate) fn new_stream_socket(ai: &libc::addrinfo) -> Result<RawFd, SysError> {
    let fd = unsafe { libc::socket(ai.ai_family, ai.ai_socktype, ai.ai_protocol) };
    if fd == -1 {
        return Err(last_error());
    }
    set_cloexec(fd);
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe {
        // No SIGPIPE when writing to a closed peer; Linux uses MSG_NOSIGNAL
        // per send instead.
        let value: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        );
    }
    Ok(fd)
}

/// Begin a non-blocking connect. Returns `0`, `EINPROGRESS` or an errno.
pub(crate) fn start_connect(fd: RawFd, ai: &libc::addrinfo) -> SysError {
    let res = unsafe { libc::connect(fd, ai.ai_addr, ai.ai_addrlen) };
    if res == 0 { SysError::NONE } else { last_error() }
}

pub(crate) fn so_error(fd: RawFd) -> SysError {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if res != 0 { last_error() } else { SysError(error) }
}

pub(crate) fn apply_flags(fd: RawFd, flags: SocketFlags, mask: SocketFlags) -> Result<(), SysError> {
    unsafe {
        if mask.nodelay() {
            let value: c_int = if flags.nodelay() { 1 } else { 0 };
            let res = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &value as *const c_int as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
            if res != 0 {
                return Err(last_error());
            }
        }
        if mask.keepalive() {
            let value: c_int = if flags.keepalive() { 1 } else { 0 };
            let res = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &value as *const c_int as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
            if res != 0 {
                return Err(last_error());
            }
        }
    }
    Ok(())
}

/// Apply kernel buffer sizes; `-1` leaves a direction untouched.
pub(crate) fn apply_buffer_sizes(fd: RawFd, size_read: c_int, size_write: c_int) -> Result<(), SysError> {
    unsafe {
        if size_read != -1 {
            let res = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size_read as *const c_int as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
            if res != 0 {
                return Err(last_error());
            }
        }
        if size_write != -1 {
            let res = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size_write as *const c_int as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
            if res != 0 {
                return Err(last_error());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Byte I/O
// =============================================================================

pub(crate) fn recv(fd: RawFd, buf: &mut [u8], peek: bool) -> Result<usize, SysError> {
    let flags = if peek { libc::MSG_PEEK } else { 0 };
    let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) };
    if res == -1 { Err(last_error()) } else { Ok(res as usize) }
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> Result<usize, SysError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;
    let res = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) };
    if res == -1 { Err(last_error()) } else { Ok(res as usize) }
}

/// Peek whether the peer left data before its FIN. `Ok(0)` means orderly
/// end-of-stream.
pub(crate) fn peek_available(fd: RawFd) -> Result<usize, SysError> {
    let mut byte = [0u8; 1];
    recv(fd, &mut byte, true)
}

pub(crate) fn accept(fd: RawFd) -> Result<RawFd, SysError> {
    let res = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
    if res == -1 {
        return Err(last_error());
    }
    set_cloexec(res);
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe {
        let value: c_int = 1;
        libc::setsockopt(
            res,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        );
    }
    Ok(res)
}

pub(crate) fn bind_fd(fd: RawFd, ai: &libc::addrinfo) -> Result<(), SysError> {
    if unsafe { libc::bind(fd, ai.ai_addr, ai.ai_addrlen) } != 0 {
        return Err(last_error());
    }
    Ok(())
}

pub(crate) fn listen_fd(fd: RawFd, backlog: c_int) -> Result<(), SysError> {
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(last_error());
    }
    Ok(())
}

// =============================================================================
// Readiness wait
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Block in `select` until the fd becomes ready in a requested direction
/// or the self-pipe is written. Drains the self-pipe before returning.
pub(crate) fn wait_readiness(
    fd: RawFd,
    wake_fd: RawFd,
    want_read: bool,
    want_write: bool,
) -> Result<Readiness, SysError> {
    unsafe {
        let mut readfds: libc::fd_set = mem::zeroed();
        let mut writefds: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut readfds);
        libc::FD_ZERO(&mut writefds);

        libc::FD_SET(wake_fd, &mut readfds);
        let mut nfds = wake_fd;
        if fd >= 0 && want_read {
            libc::FD_SET(fd, &mut readfds);
            nfds = nfds.max(fd);
        }
        if fd >= 0 && want_write {
            libc::FD_SET(fd, &mut writefds);
            nfds = nfds.max(fd);
        }

        let res = libc::select(nfds + 1, &mut readfds, &mut writefds, ptr::null_mut(), ptr::null_mut());
        if res == -1 {
            return Err(last_error());
        }

        if libc::FD_ISSET(wake_fd, &readfds) {
            pipe_drain(wake_fd);
        }

        Ok(Readiness {
            readable: fd >= 0 && libc::FD_ISSET(fd, &readfds),
            writable: fd >= 0 && libc::FD_ISSET(fd, &writefds),
        })
    }
}

// =============================================================================
// Address introspection
// =============================================================================

/// Format a socket address numerically. IPv6 addresses are bracketed when
/// a port is included to keep the colon separator unambiguous.
pub(crate) fn sockaddr_to_string(
    addr: *const libc::sockaddr,
    len: socklen_t,
    with_port: bool,
    strip_zone_index: bool,
) -> Option<String> {
    const NI_MAXHOST: usize = 1025;
    const NI_MAXSERV: usize = 32;
    let mut hostbuf = [0 as libc::c_char; NI_MAXHOST];
    let mut portbuf = [0 as libc::c_char; NI_MAXSERV];
    let res = unsafe {
        libc::getnameinfo(
            addr,
            len,
            hostbuf.as_mut_ptr(),
            hostbuf.len() as socklen_t,
            portbuf.as_mut_ptr(),
            portbuf.len() as socklen_t,
            libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
        )
    };
    if res != 0 {
        return None;
    }

    let mut host = unsafe { CStr::from_ptr(hostbuf.as_ptr()) }.to_string_lossy().into_owned();
    let port = unsafe { CStr::from_ptr(portbuf.as_ptr()) }.to_string_lossy().into_owned();

    let family = unsafe { (*addr).sa_family } as c_int;
    if family == libc::AF_INET6 {
        if strip_zone_index {
            if let Some(pos) = host.find('%') {
                host.truncate(pos);
            }
        }
        if with_port {
            host = format!("[{}]", host);
        }
    }

    if with_port { Some(format!("{}:{}", host, port)) } else { Some(host) }
}

fn name_of(fd: RawFd, peer: bool) -> Option<(libc::sockaddr_storage, socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let addr = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr;
    let res = unsafe {
        if peer { libc::getpeername(fd, addr, &mut len) } else { libc::getsockname(fd, addr, &mut len) }
    };
    if res != 0 { None } else { Some((storage, len)) }
}

pub(crate) fn ip_string(fd: RawFd, peer: bool, strip_zone_index: bool) -> Option<String> {
    let (storage, len) = name_of(fd, peer)?;
    sockaddr_to_string(
        &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        len,
        false,
        strip_zone_index,
    )
}

pub(crate) fn port_of(fd: RawFd, peer: bool) -> Result<u16, SysError> {
    let (storage, _) = name_of(fd, peer).ok_or_else(last_error)?;
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let addr = unsafe { &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Ok(u16::from_be(addr.sin_port))
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            Ok(u16::from_be(addr.sin6_port))
        }
        _ => Err(SysError(libc::EINVAL)),
    }
}

pub(crate) fn family_of(fd: RawFd) -> Option<c_int> {
    name_of(fd, false).map(|(storage, _)| storage.ss_family as c_int)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn pipe_wakes_select() {
        let fds = pipe().unwrap();
        pipe_write(fds[1]);
        let ready = wait_readiness(-1, fds[0], false, false).unwrap();
        assert!(!ready.readable);
        assert!(!ready.writable);
        close_fd(fds[0]);
        close_fd(fds[1]);
    }

    #[test]
    fn resolve_numeric_loopback() {
        let host = CString::new("127.0.0.1").unwrap();
        let port = CString::new("2121").unwrap();
        let list = resolve(Some(&host), &port, libc::AF_UNSPEC, false).unwrap();
        let first = list.iter().next().expect("at least one address");
        let formatted = sockaddr_to_string(first.ai_addr, first.ai_addrlen, true, false).unwrap();
        assert_eq!(formatted, "127.0.0.1:2121");
    }

    #[test]
    fn ipv6_addresses_are_bracketed_with_port() {
        let host = CString::new("::1").unwrap();
        let port = CString::new("21").unwrap();
        let Ok(list) = resolve(Some(&host), &port, libc::AF_INET6, false) else {
            // Host without IPv6 support.
            return;
        };
        let first = list.iter().next().unwrap();
        let formatted = sockaddr_to_string(first.ai_addr, first.ai_addrlen, true, false).unwrap();
        assert_eq!(formatted, "[::1]:21");
        let bare = sockaddr_to_string(first.ai_addr, first.ai_addrlen, false, false).unwrap();
        assert_eq!(bare, "::1");
    }
}
