//! Socketpair doorbell for queue interrupts.
//!
//! Each queue direction gets one Unix datagram socketpair: the transmitter
//! signals one end, the receiver drains the other. The receiving end can be
//! polled without blocking from the control path, or cloned and registered
//! with tokio to wait for interrupts out of band.
//!
//! ```ignore
//! let bell = transport.interrupt_doorbell(conn.connection_handle().unwrap(), 0)?;
//! let bell = bell.into_async()?;
//! loop {
//!     bell.wait().await?;
//!     conn.handle_interrupt(0)?;
//! }
//! ```

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// One end of a doorbell socketpair.
#[derive(Debug)]
pub struct Doorbell {
    fd: OwnedFd,
}

impl Doorbell {
    /// Create a connected pair. Signals on one end wake the other.
    pub fn create_pair() -> io::Result<(Self, Self)> {
        let (a, b) = create_socketpair()?;
        Ok((Self { fd: a }, Self { fd: b }))
    }

    /// Ring the other end.
    ///
    /// Sends a 1-byte datagram. A full socket buffer means the other side
    /// already has a signal pending, so the signal is dropped.
    pub fn signal(&self) {
        let buf = [1u8];

        // SAFETY: fd is valid, buf is valid
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                tracing::warn!("doorbell signal failed: {}", err);
            }
        }
    }

    /// Consume all pending signals without blocking.
    ///
    /// Returns true if at least one was pending.
    pub fn drain(&self) -> bool {
        drain_fd(self.fd.as_raw_fd())
    }

    /// Another handle to the same end, for an out-of-band waiter.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Register with the current tokio reactor.
    ///
    /// Must be called from within a runtime.
    pub fn into_async(self) -> io::Result<AsyncDoorbell> {
        Ok(AsyncDoorbell {
            async_fd: AsyncFd::with_interest(self.fd, Interest::READABLE)?,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A doorbell end that can be awaited.
#[derive(Debug)]
pub struct AsyncDoorbell {
    async_fd: AsyncFd<OwnedFd>,
}

impl AsyncDoorbell {
    /// Wait until the other end signals, consuming the pending signals.
    pub async fn wait(&self) -> io::Result<()> {
        loop {
            let mut guard = self.async_fd.ready(Interest::READABLE).await?;

            if drain_fd(self.async_fd.get_ref().as_raw_fd()) {
                return Ok(());
            }

            // Spurious wakeup
            guard.clear_ready();
        }
    }

    pub fn drain(&self) -> bool {
        drain_fd(self.async_fd.get_ref().as_raw_fd())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

fn drain_fd(fd: RawFd) -> bool {
    let mut buf = [0u8; 64];
    let mut drained = false;

    loop {
        // SAFETY: fd is valid, buf is valid
        let ret = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if ret > 0 {
            drained = true;
        } else if ret == 0 {
            break;
        } else {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                tracing::warn!("doorbell drain failed: {}", err);
            }
            break;
        }
    }

    drained
}

/// Create a Unix domain socketpair (SOCK_DGRAM, non-blocking, close-on-exec).
fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: socketpair succeeded, fds are valid
    let fd0 = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let fd1 = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    Ok((fd0, fd1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_then_drain() {
        let (tx, rx) = Doorbell::create_pair().unwrap();
        assert!(!rx.drain());

        tx.signal();
        tx.signal();
        assert!(rx.drain());
        assert!(!rx.drain());
    }

    #[test]
    fn test_clone_shares_pending_signals() {
        let (tx, rx) = Doorbell::create_pair().unwrap();
        let other = rx.try_clone().unwrap();
        assert_ne!(other.as_raw_fd(), rx.as_raw_fd());

        tx.signal();
        assert!(other.drain());
        assert!(!rx.drain());
    }

    #[tokio::test]
    async fn test_async_wait() {
        let (tx, rx) = Doorbell::create_pair().unwrap();
        let rx = rx.into_async().unwrap();

        tx.signal();
        tokio::time::timeout(Duration::from_millis(100), rx.wait())
            .await
            .expect("timeout waiting for doorbell")
            .expect("wait failed");

        // Nothing pending now.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), rx.wait())
                .await
                .is_err()
        );
    }
}
