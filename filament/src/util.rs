use std::io;
use std::os::unix::io::RawFd;

use once_cell::sync::Lazy;

use crate::{Error, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let rv = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(rv > 0, "sysconf(_SC_PAGESIZE) failed");
    rv as usize
});

#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE
}

pub(crate) fn round_up_to_page_size(size: usize) -> usize {
    let sz = page_size();
    match size % sz {
        0 => size,
        rem => size + sz - rem,
    }
}

/// Switch a file descriptor into non-blocking mode.
///
/// Descriptors handed to the host event loop must not block the thread all
/// fibers share.
pub fn fd_nonblock(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(Error::IO(io::Error::last_os_error()));
    }
    let rv = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rv == -1 {
        return Err(Error::IO(io::Error::last_os_error()));
    }
    Ok(())
}
