use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use crate::protocol::frontend::write_cancel_request;

use super::stream::Endpoint;

/// Out-of-band cancellation handle for one session.
///
/// The token is independent of the connection it came from: it can be moved
/// to another thread and used while the connection is blocked in a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelToken {
    endpoint: Endpoint,
    pid: u32,
    secret: u32,
}

impl CancelToken {
    pub(crate) fn new(endpoint: Endpoint, pid: u32, secret: u32) -> Self {
        Self {
            endpoint,
            pid,
            secret,
        }
    }

    /// Backend process the token targets.
    pub fn backend_pid(&self) -> u32 {
        self.pid
    }

    /// Ask the server to cancel whatever the session is running.
    ///
    /// Success only means the request was delivered; the server may still
    /// finish the command.
    pub fn cancel(&self) -> io::Result<()> {
        let mut packet = Vec::with_capacity(16);
        write_cancel_request(&mut packet, self.pid, self.secret)
            .map_err(|e| io::Error::other(e.to_string()))?;
        tracing::debug!(pid = self.pid, "sending cancel request");

        let mut reply = [0u8; 1];
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr)?;
                stream.write_all(&packet)?;
                stream.flush()?;
                // The server closes the socket once it has read the request.
                let _ = stream.read(&mut reply)?;
            }
            Endpoint::Unix(path) => {
                let mut stream = UnixStream::connect(path)?;
                stream.write_all(&packet)?;
                stream.flush()?;
                let _ = stream.read(&mut reply)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_cancel_sends_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            socket.read_exact(&mut buf).unwrap();
            buf
        });

        let token = CancelToken::new(Endpoint::Tcp(addr), 4242, 0xDEAD_BEEF);
        token.cancel().unwrap();

        let packet = server.join().unwrap();
        assert_eq!(&packet[0..4], &16i32.to_be_bytes());
        assert_eq!(&packet[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&packet[8..12], &4242u32.to_be_bytes());
        assert_eq!(&packet[12..16], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn test_token_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CancelToken>();
    }
}
