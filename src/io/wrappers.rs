/*
 * Synchronous I/O Wrappers
 *
 * Blocking-style POSIX calls that suspend only the calling fibre. The
 * shared pattern: descriptors are opened non-blocking at the OS level;
 * an EAGAIN sends the fibre through registration (policy-dependent) and
 * onto the descriptor's read- or write-side semaphore until a poller
 * reports readiness, then the call is retried.
 *
 * Input wrappers yield once before the first attempt; output wrappers do
 * not. Descriptors the *user* marked non-blocking bypass all of it.
 */

use std::io;

use libc::{c_int, c_void, msghdr, size_t, sockaddr, socklen_t};

use crate::context;
use crate::fibre;
use crate::io::Side;
use crate::utils::sys;

#[cfg(not(any(feature = "eager-registration", feature = "oneshot-registration")))]
use crate::io::poller::PollFlags;

/// Core retry loop shared by every data-path wrapper.
fn sync_io<F: FnMut() -> isize>(
    fd: c_int,
    side: Side,
    yield_first: bool,
    mut op: F,
) -> io::Result<isize> {
    let scope = context::curr_scope();
    let entry = scope
        .registry()
        .entry(fd)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
    if entry.is_nonblocking() {
        let ret = op();
        return if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        };
    }

    if yield_first {
        fibre::yield_now();
    }
    let ret = op();
    if ret >= 0 {
        return Ok(ret);
    }
    if sys::errno() != libc::EAGAIN {
        return Err(io::Error::last_os_error());
    }
    log::debug!(target: "polling", "fd {} would block ({:?})", fd, side);

    // Lazy policy: first EAGAIN registers the descriptor; retry once
    // before committing to the park.
    #[cfg(not(any(feature = "eager-registration", feature = "oneshot-registration")))]
    {
        let flags = match side {
            Side::Input => PollFlags::INPUT,
            Side::Output => PollFlags::OUTPUT,
        };
        if scope.register_fd(fd, flags, true) {
            fibre::yield_now();
            let ret = op();
            if ret >= 0 {
                return Ok(ret);
            }
            if sys::errno() != libc::EAGAIN {
                return Err(io::Error::last_os_error());
            }
        }
    }

    let mutex = entry.serial_mutex(side);
    mutex.lock();
    let result = loop {
        #[cfg(feature = "oneshot-registration")]
        scope.register_fd_oneshot(fd);
        entry.sem(side).p();
        let ret = op();
        if ret >= 0 {
            break Ok(ret);
        }
        if sys::errno() != libc::EAGAIN {
            break Err(io::Error::last_os_error());
        }
    };
    mutex.unlock();
    result
}

fn base_socket_type(ty: c_int) -> c_int {
    ty & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
}

/// Create a socket; internally always non-blocking. Stream sockets are
/// registered later (listen/connect decide the interest set).
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<c_int> {
    let fd = sys::cvt(unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) })?;
    if base_socket_type(ty) != libc::SOCK_STREAM {
        context::curr_scope().register_fd_on_create(fd);
    }
    Ok(fd)
}

/// Bind; an asynchronous EINPROGRESS completion is awaited on the
/// write-side semaphore.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> io::Result<()> {
    let ret = unsafe { libc::bind(fd, addr, len) };
    if ret >= 0 {
        return Ok(());
    }
    if sys::errno() == libc::EINPROGRESS {
        return context::curr_scope().check_async_completion(fd);
    }
    Err(io::Error::last_os_error())
}

/// Connect; EINPROGRESS is awaited, other errors are returned verbatim.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> io::Result<()> {
    let ret = unsafe { libc::connect(fd, addr, len) };
    if ret >= 0 {
        context::curr_scope().register_fd_on_create(fd);
        return Ok(());
    }
    if sys::errno() == libc::EINPROGRESS {
        context::curr_scope().check_async_completion(fd)?;
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

/// Listen; the server descriptor is registered input-side only.
pub fn listen(fd: c_int, backlog: c_int) -> io::Result<()> {
    sys::cvt(unsafe { libc::listen(fd, backlog) })?;
    context::curr_scope().register_server_fd(fd);
    Ok(())
}

/// Accept a connection, parking until one is pending. The new descriptor
/// is registered before it is returned.
///
/// # Safety
///
/// `addr`/`len` may be null, or must point to a writable address buffer.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> io::Result<c_int> {
    let ret = sync_io(fd, Side::Input, false, || unsafe {
        libc::accept4(fd, addr, len, libc::SOCK_NONBLOCK) as isize
    })?;
    let new_fd = ret as c_int;
    context::curr_scope().register_fd_on_create(new_fd);
    Ok(new_fd)
}

/// Non-blocking accept for listen-queue draining; EAGAIN is returned.
///
/// # Safety
///
/// As [`accept`].
pub unsafe fn try_accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> io::Result<c_int> {
    let new_fd = sys::cvt(unsafe { libc::accept4(fd, addr, len, libc::SOCK_NONBLOCK) })?;
    context::curr_scope().register_fd_on_create(new_fd);
    Ok(new_fd)
}

/// Duplicate a descriptor; the clone gets its own registration.
pub fn dup(fd: c_int) -> io::Result<c_int> {
    let new_fd = sys::cvt(unsafe { libc::dup(fd) })?;
    context::curr_scope().register_fd_on_create(new_fd);
    Ok(new_fd)
}

/// Create a pipe; both ends non-blocking and registered.
pub fn pipe() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    sys::cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) })?;
    let scope = context::curr_scope();
    scope.register_fd_on_create(fds[0]);
    scope.register_fd_on_create(fds[1]);
    Ok((fds[0], fds[1]))
}

/// Close: the registry entry is torn down first, so no new park can land
/// on the dead descriptor.
pub fn close(fd: c_int) -> io::Result<()> {
    context::curr_scope().deregister_fd(fd);
    sys::cvt(unsafe { libc::close(fd) })?;
    Ok(())
}

/// File status flags; O_NONBLOCK set by the user switches the wrappers
/// into pass-through mode for this descriptor (the OS-level descriptor
/// stays non-blocking either way).
pub fn fcntl_setfl(fd: c_int, flags: c_int) -> io::Result<()> {
    sys::cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    if let Some(entry) = context::curr_scope().registry().entry(fd) {
        entry.set_nonblocking(flags & libc::O_NONBLOCK != 0);
    }
    Ok(())
}

pub fn read(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    sync_io(fd, Side::Input, true, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len() as size_t)
    })
    .map(|n| n as usize)
}

pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    sync_io(fd, Side::Input, true, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len() as size_t, flags)
    })
    .map(|n| n as usize)
}

/// # Safety
///
/// `addr`/`len` may be null, or must point to a writable address buffer.
pub unsafe fn recv_from(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> io::Result<usize> {
    sync_io(fd, Side::Input, true, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len() as size_t,
            flags,
            addr,
            len,
        )
    })
    .map(|n| n as usize)
}

/// # Safety
///
/// `msg` must point to a valid message header.
pub unsafe fn recv_msg(fd: c_int, msg: *mut msghdr, flags: c_int) -> io::Result<usize> {
    sync_io(fd, Side::Input, true, || unsafe { libc::recvmsg(fd, msg, flags) })
        .map(|n| n as usize)
}

pub fn write(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    sync_io(fd, Side::Output, false, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len() as size_t)
    })
    .map(|n| n as usize)
}

pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> io::Result<usize> {
    sync_io(fd, Side::Output, false, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len() as size_t, flags)
    })
    .map(|n| n as usize)
}

/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn send_to(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    addr: *const sockaddr,
    len: socklen_t,
) -> io::Result<usize> {
    sync_io(fd, Side::Output, false, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len() as size_t,
            flags,
            addr,
            len,
        )
    })
    .map(|n| n as usize)
}

/// # Safety
///
/// `msg` must point to a valid message header.
pub unsafe fn send_msg(fd: c_int, msg: *const msghdr, flags: c_int) -> io::Result<usize> {
    sync_io(fd, Side::Output, false, || unsafe { libc::sendmsg(fd, msg, flags) })
        .map(|n| n as usize)
}

/// Run unpollable (disk) I/O on the scope's disk cluster, migrating the
/// calling fibre there and back.
pub fn direct_io<T>(f: impl FnOnce() -> T) -> T {
    context::curr_scope().direct_io(f)
}
