// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Connection metadata and the two legs of a relayed session.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use rustls::{ClientConnection, IoState, Reader, ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};
use tracing::{trace, warn};
use uuid::Uuid;

/// Size of a single read; a shorter read marks the end of a message.
pub const READ_CHUNK: usize = 2048;

/// Metadata associated with an accepted client connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
        }
    }
}

/// Block until at least one descriptor is readable or `timeout` elapses.
///
/// Hang-up and error conditions count as readable so the next read reports
/// them. Returns one flag per descriptor, all false on timeout.
pub fn wait_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> io::Result<Vec<bool>> {
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    loop {
        match poll(&mut pollfds, PollTimeout::from(millis)) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pollfds
        .iter()
        .map(|p| p.revents().is_some_and(|r| r.intersects(ready)))
        .collect())
}

/// Outcome of reading a leg that turned readable.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    Message(Vec<u8>),
    /// Only TLS records without application data arrived.
    Nothing,
    Closed,
}

impl Incoming {
    fn from_parts(data: Vec<u8>, closed: bool) -> Self {
        match (data.is_empty(), closed) {
            (false, _) => Incoming::Message(data),
            (true, true) => Incoming::Closed,
            (true, false) => Incoming::Nothing,
        }
    }
}

fn readable_now(sock: &TcpStream) -> io::Result<bool> {
    let ready = wait_readable(&[sock.as_fd()], Duration::ZERO)?;
    Ok(ready.first().copied().unwrap_or(false))
}

fn read_plain(sock: &mut TcpStream) -> io::Result<Incoming> {
    let mut data = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match sock.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        data.extend_from_slice(&chunk[..n]);
        if n < READ_CHUNK || !readable_now(sock)? {
            return Ok(Incoming::from_parts(data, n == 0));
        }
    }
}

/// The parts of a rustls connection the relay drives by hand.
trait TlsConnection {
    fn receive(&mut self, sock: &mut TcpStream) -> io::Result<usize>;
    fn process(&mut self) -> Result<IoState, rustls::Error>;
    fn plaintext(&mut self) -> Reader<'_>;
    fn send_records(&mut self, sock: &mut TcpStream) -> io::Result<()>;
}

impl TlsConnection for ServerConnection {
    fn receive(&mut self, sock: &mut TcpStream) -> io::Result<usize> {
        self.read_tls(sock)
    }

    fn process(&mut self) -> Result<IoState, rustls::Error> {
        self.process_new_packets()
    }

    fn plaintext(&mut self) -> Reader<'_> {
        self.reader()
    }

    fn send_records(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        while self.wants_write() {
            self.write_tls(sock)?;
        }
        Ok(())
    }
}

impl TlsConnection for ClientConnection {
    fn receive(&mut self, sock: &mut TcpStream) -> io::Result<usize> {
        self.read_tls(sock)
    }

    fn process(&mut self) -> Result<IoState, rustls::Error> {
        self.process_new_packets()
    }

    fn plaintext(&mut self) -> Reader<'_> {
        self.reader()
    }

    fn send_records(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        while self.wants_write() {
            self.write_tls(sock)?;
        }
        Ok(())
    }
}

/// Drain decrypted bytes, pulling more records only while the socket is
/// readable without blocking.
fn read_records<C: TlsConnection>(conn: &mut C, sock: &mut TcpStream) -> io::Result<Incoming> {
    let mut data = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut eof = false;
    loop {
        loop {
            match conn.plaintext().read(&mut chunk) {
                Ok(0) => return Ok(Incoming::from_parts(data, true)),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // peers commonly close without close_notify
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(Incoming::from_parts(data, true));
                }
                Err(e) => return Err(e),
            }
        }
        if eof || !readable_now(sock)? {
            return Ok(Incoming::from_parts(data, eof));
        }
        let n = match conn.receive(sock) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        eof = n == 0;
        let processed = conn.process();
        // alerts and key update replies go out even when processing failed
        conn.send_records(sock)?;
        processed.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
}

/// One side of a session: plaintext TCP, or TCP wrapped in a TLS session
/// where the proxy is either the server (client leg) or the client (origin leg).
pub enum Leg {
    Plain(TcpStream),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl std::fmt::Debug for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Leg::Plain(_) => "plain",
            Leg::TlsServer(_) => "tls-server",
            Leg::TlsClient(_) => "tls-client",
        };
        f.debug_struct("Leg")
            .field("kind", &kind)
            .field("peer", &self.tcp().peer_addr().ok())
            .finish()
    }
}

impl Leg {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Leg::Plain(s) => s,
            Leg::TlsServer(s) => &s.sock,
            Leg::TlsClient(s) => &s.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Leg::Plain(_))
    }

    /// Input the TLS session already holds, which a readiness wait on the
    /// socket would not see: decrypted bytes or a received close_notify.
    pub fn has_pending_input(&mut self) -> bool {
        let state = match self {
            Leg::Plain(_) => return false,
            Leg::TlsServer(s) => s.conn.process_new_packets(),
            Leg::TlsClient(s) => s.conn.process_new_packets(),
        };
        state.is_ok_and(|st| st.plaintext_bytes_to_read() > 0 || st.peer_has_closed())
    }

    /// Read what the peer sent since the leg turned readable.
    ///
    /// Plain legs accumulate chunks until a short read, or until a full
    /// chunk leaves nothing more to read right now. TLS legs take records
    /// off the socket only while it is readable, so a wake that carried
    /// only handshake records (session tickets, key updates) yields
    /// [`Incoming::Nothing`] instead of blocking for application data.
    pub fn read_message(&mut self) -> io::Result<Incoming> {
        let incoming = match self {
            Leg::Plain(s) => read_plain(s)?,
            Leg::TlsServer(s) => read_records(&mut s.conn, &mut s.sock)?,
            Leg::TlsClient(s) => read_records(&mut s.conn, &mut s.sock)?,
        };
        match &incoming {
            Incoming::Message(data) => trace!(len = data.len(), "read message"),
            other => trace!(?other, "read without message"),
        }
        Ok(incoming)
    }

    /// Write `buf` to the peer.
    ///
    /// Plain legs issue a single write and report a short write without
    /// resuming it. TLS legs hand the whole buffer to the session.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Leg::Plain(s) => {
                let n = s.write(buf)?;
                if n < buf.len() {
                    warn!(written = n, len = buf.len(), "short write");
                }
                Ok(n)
            }
            Leg::TlsServer(s) => {
                s.write_all(buf)?;
                s.flush()?;
                Ok(buf.len())
            }
            Leg::TlsClient(s) => {
                s.write_all(buf)?;
                s.flush()?;
                Ok(buf.len())
            }
        }
    }

    /// Tear the leg down: TLS legs send close_notify first, then the socket is shut.
    pub fn close(self) {
        match self {
            Leg::Plain(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Leg::TlsServer(mut s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
                let _ = s.sock.shutdown(Shutdown::Both);
            }
            Leg::TlsClient(mut s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
                let _ = s.sock.shutdown(Shutdown::Both);
            }
        }
    }
}

impl AsFd for Leg {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.tcp().as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> io::Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr)?;
        let (server, _) = listener.accept()?;
        Ok((client, server))
    }

    #[test]
    fn wait_readable_times_out_when_idle() -> io::Result<()> {
        let (a, _b) = pair()?;
        let ready = wait_readable(&[a.as_fd()], Duration::from_millis(50))?;
        assert_eq!(ready, vec![false]);
        Ok(())
    }

    #[test]
    fn wait_readable_flags_the_ready_descriptor() -> io::Result<()> {
        let (a, mut b) = pair()?;
        let (c, _d) = pair()?;
        b.write_all(b"ping")?;
        let ready = wait_readable(&[c.as_fd(), a.as_fd()], Duration::from_secs(2))?;
        assert_eq!(ready, vec![false, true]);
        Ok(())
    }

    #[test]
    fn read_message_accumulates_multiple_chunks() -> io::Result<()> {
        let (a, mut b) = pair()?;
        let payload = vec![b'x'; READ_CHUNK * 3 + 17];
        b.write_all(&payload)?;
        // let everything land in the receive buffer
        thread::sleep(Duration::from_millis(100));
        let mut leg = Leg::Plain(a);
        assert_eq!(leg.read_message()?, Incoming::Message(payload));
        Ok(())
    }

    #[test]
    fn read_message_reports_a_closed_peer() -> io::Result<()> {
        let (a, b) = pair()?;
        drop(b);
        let mut leg = Leg::Plain(a);
        assert_eq!(leg.read_message()?, Incoming::Closed);
        Ok(())
    }

    #[test]
    fn close_shuts_the_socket_for_the_peer() -> io::Result<()> {
        let (a, mut b) = pair()?;
        let mut leg = Leg::Plain(a);
        assert_eq!(leg.send(b"bye")?, 3);
        leg.close();
        let mut buf = Vec::new();
        b.read_to_end(&mut buf)?;
        assert_eq!(buf, b"bye");
        Ok(())
    }
}
