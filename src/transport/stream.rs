use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Where a cancel request for this session must be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Blocking connect, trying each resolved address in turn.
    pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    return Ok(Stream::Tcp(tcp));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("could not resolve host \"{host}\""))
        }))
    }

    /// Start a non-blocking connect. The flag is `true` if the connection
    /// completed immediately.
    pub(crate) fn connect_tcp_nonblocking(host: &str, port: u16) -> io::Result<(Self, bool)> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            socket.set_nonblocking(true)?;
            socket.set_nodelay(true)?;
            let connected = match socket.connect(&SockAddr::from(addr)) {
                Ok(()) => true,
                Err(e) if is_connect_pending(&e) => false,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            return Ok((Stream::Tcp(socket.into()), connected));
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("could not resolve host \"{host}\""))
        }))
    }

    pub(crate) fn connect_unix(path: &str) -> io::Result<Self> {
        Ok(Stream::Unix(UnixStream::connect(path)?))
    }

    /// Whether a non-blocking connect has completed.
    pub(crate) fn poll_connected(&self) -> io::Result<bool> {
        match self {
            Stream::Tcp(tcp) => {
                if let Some(err) = tcp.take_error()? {
                    return Err(err);
                }
                match tcp.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Stream::Unix(_) => Ok(true),
        }
    }

    pub(crate) fn endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Stream::Tcp(tcp) => Ok(Endpoint::Tcp(tcp.peer_addr()?)),
            Stream::Unix(unix) => {
                let addr = unix.peer_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "unnamed unix socket peer")
                })?;
                Ok(Endpoint::Unix(path.to_path_buf()))
            }
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Whether an I/O error only means "try again later".
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Whether a non-blocking `connect` is still under way.
fn is_connect_pending(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InProgress | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_pending_kinds() {
        assert!(is_connect_pending(&io::Error::from(io::ErrorKind::InProgress)));
        assert!(is_connect_pending(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_connect_pending(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
    }

    #[test]
    fn test_nonblocking_connect_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (stream, mut connected) = Stream::connect_tcp_nonblocking("127.0.0.1", port).unwrap();
        let _peer = listener.accept().unwrap();
        for _ in 0..100 {
            if connected {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            connected = stream.poll_connected().unwrap();
        }
        assert!(connected);
        assert_eq!(
            stream.endpoint().unwrap(),
            Endpoint::Tcp(listener.local_addr().unwrap())
        );
    }
}
