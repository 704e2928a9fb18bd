//! Async TCP stream and listener.
//!
//! Both wrap the std socket in non-blocking mode and park the calling task
//! on its [`AsyncFd`] registration whenever the OS reports `WouldBlock`.

use std::io::{self, Read, Write};
use std::net::{self, Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use weft_rt::AsyncFd;

use crate::sys;

/// An async TCP stream.
///
/// Must be created inside a task; the registration belongs to that task's
/// agent.
pub struct TcpStream {
    // Declared first so the registration is dropped before the socket closes.
    registration: AsyncFd,
    inner: net::TcpStream,
}

impl TcpStream {
    /// Connects to `addr` without blocking the agent.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let (inner, in_progress) = sys::start_connect(&addr)?;
        let registration = AsyncFd::new(inner.as_raw_fd())?;

        if in_progress {
            registration.writable().await?;
            if let Some(err) = inner.take_error()? {
                return Err(err);
            }
        }
        log::trace!("connected fd {} to {addr}", inner.as_raw_fd());
        Ok(TcpStream {
            registration,
            inner,
        })
    }

    /// Adopts a connected std stream, switching it to non-blocking mode.
    pub fn from_std(inner: net::TcpStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        let registration = AsyncFd::new(inner.as_raw_fd())?;
        Ok(TcpStream {
            registration,
            inner,
        })
    }

    /// Reads into `buf`. Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.inner).read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.registration.readable().await?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes from `buf`, returning how much was accepted by the socket.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match (&self.inner).write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.registration.writable().await?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// An async TCP listener.
pub struct TcpListener {
    registration: AsyncFd,
    inner: net::TcpListener,
}

impl TcpListener {
    /// Binds to `addr` and starts listening. Must be called inside a task.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        let registration = AsyncFd::new(inner.as_raw_fd())?;
        Ok(TcpListener {
            registration,
            inner,
        })
    }

    /// Waits for the next incoming connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    log::trace!("accepted {peer} on fd {}", self.inner.as_raw_fd());
                    return Ok((TcpStream::from_std(stream)?, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.registration.readable().await?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
