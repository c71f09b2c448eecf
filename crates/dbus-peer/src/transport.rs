//! Stream transport with optional file-descriptor passing
//!
//! The transport owns the socket and exposes buffer-level reads and
//! writes. Both sides take `&self`: the connection's reader task is the
//! only reader, and writers serialize behind the connection's write lock.
//! On unix sockets, reads collect `SCM_RIGHTS` descriptors into a queue in
//! reception order and writes can attach descriptors to the first byte of
//! a frame.

use crate::address::BusAddress;
use crate::error::{Error, Result};
use crate::sys;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::env;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

/// Read chunk size
const READ_CHUNK: usize = 8192;

enum Inner {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// A connected byte-stream socket
pub struct Transport {
    inner: Inner,
    fd_passing: AtomicBool,
}

impl Transport {
    /// Connect to a parsed bus address
    pub async fn connect(addr: &BusAddress) -> Result<Self> {
        let inner = match addr {
            BusAddress::UnixPath(path) => Inner::Unix(UnixStream::connect(path).await?),
            BusAddress::UnixAbstract(name) => {
                let std_stream = sys::connect_unix(name.as_bytes(), true)?;
                std_stream.set_nonblocking(true)?;
                Inner::Unix(UnixStream::from_std(std_stream)?)
            }
            BusAddress::Tcp { host, port } => {
                Inner::Tcp(TcpStream::connect((host.as_str(), *port)).await?)
            }
            BusAddress::LaunchdEnv(var) => {
                let path = env::var(var)
                    .map_err(|_| Error::AddressParse(format!("launchd:env={}", var)))?;
                Inner::Unix(UnixStream::connect(path).await?)
            }
        };
        Ok(Self {
            inner,
            fd_passing: AtomicBool::new(false),
        })
    }

    /// Wrap an already-connected unix stream (peer-to-peer, tests)
    pub fn from_unix(stream: UnixStream) -> Self {
        Self {
            inner: Inner::Unix(stream),
            fd_passing: AtomicBool::new(false),
        }
    }

    /// Wrap a blocking unix stream, switching it to nonblocking mode
    pub fn from_std_unix(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_unix(UnixStream::from_std(stream)?))
    }

    /// Whether the socket family supports descriptor passing at all
    pub fn supports_fd_passing(&self) -> bool {
        matches!(self.inner, Inner::Unix(_))
    }

    /// Whether descriptor passing was negotiated
    pub fn fd_passing(&self) -> bool {
        self.fd_passing.load(Ordering::Relaxed)
    }

    pub fn set_fd_passing(&self, enabled: bool) {
        self.fd_passing
            .store(enabled && self.supports_fd_passing(), Ordering::Relaxed);
    }

    fn raw_fd(&self) -> RawFd {
        match &self.inner {
            Inner::Unix(s) => s.as_raw_fd(),
            Inner::Tcp(s) => s.as_raw_fd(),
        }
    }

    /// Shut down both directions, waking the reader task
    pub fn shutdown(&self) {
        sys::shutdown(self.raw_fd());
    }

    /// Read whatever is available into `out`, collecting descriptors into
    /// `fds`. Returns the number of bytes read; zero means end of stream.
    pub async fn read_buf(
        &self,
        out: &mut BytesMut,
        fds: &mut VecDeque<RawFd>,
    ) -> Result<usize> {
        match &self.inner {
            Inner::Unix(stream) => loop {
                stream.readable().await?;
                let mut chunk = [0u8; READ_CHUNK];
                let mut received = Vec::new();
                let raw = stream.as_raw_fd();
                match stream.try_io(Interest::READABLE, || {
                    sys::recv_with_fds(raw, &mut chunk, &mut received)
                }) {
                    Ok(n) => {
                        out.extend_from_slice(&chunk[..n]);
                        fds.extend(received);
                        return Ok(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Inner::Tcp(stream) => loop {
                stream.readable().await?;
                let mut chunk = [0u8; READ_CHUNK];
                match stream.try_read(&mut chunk) {
                    Ok(n) => {
                        out.extend_from_slice(&chunk[..n]);
                        return Ok(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    /// Write all of `data`, attaching `fds` to the first bytes written.
    pub async fn write_all(&self, data: &[u8], fds: &[RawFd]) -> Result<()> {
        match &self.inner {
            Inner::Unix(stream) => {
                let raw = stream.as_raw_fd();
                let mut written = 0;
                let mut pending_fds = fds;
                while written < data.len() {
                    stream.writable().await?;
                    match stream.try_io(Interest::WRITABLE, || {
                        sys::send_with_fds(raw, &data[written..], pending_fds)
                    }) {
                        Ok(n) => {
                            written += n;
                            if n > 0 {
                                pending_fds = &[];
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            Inner::Tcp(stream) => {
                if !fds.is_empty() {
                    return Err(Error::FdPassingDisabled);
                }
                let mut written = 0;
                while written < data.len() {
                    stream.writable().await?;
                    match stream.try_write(&data[written..]) {
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        }
    }
}
