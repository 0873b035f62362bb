//! [std::net]-like API for TCP communication.
//!
//! Every operation comes in a blocking and a non-blocking flavour. Blocking
//! calls wait on the connection until it changes, bounded by an optional
//! timeout; non-blocking calls fail with [io::ErrorKind::WouldBlock]
//! instead.
//!
//! [std::net]: https://doc.rust-lang.org/std/net/index.html

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::{ConnectionHandle, ListenerHandle};
use super::stack::Stack;
use crate::error;
use crate::protocol::SocketAddr;
use crate::protocol::fsm::ConnectionState;
use crate::protocol::tcb::TCB;
use crate::{Error, Result};

/// A TCP socket server, listening for connections.
#[derive(Debug)]
pub struct TcpListener {
    stack: Stack,
    listener: Arc<ListenerHandle>,
    timeout: Option<Duration>,
}

impl TcpListener {
    /// Creates a new `TcpListener` bound to `addr`; `0.0.0.0` accepts
    /// connections to any local address. At most `backlog` connections wait
    /// to be accepted.
    ///
    /// The returned listener is ready for accepting connections.
    ///
    /// # Errors
    ///
    /// Fails with [io::ErrorKind::AddrInUse] if the address is taken.
    pub fn bind(stack: &Stack, addr: impl Into<SocketAddr>, backlog: usize) -> Result<Self> {
        let listener = stack.inner.listen(addr.into(), backlog)?;

        Ok(Self {
            stack: stack.clone(),
            listener,
            timeout: None,
        })
    }

    /// Accepts a new incoming connection, blocking until one is established.
    ///
    /// # Errors
    ///
    /// Fails with [io::ErrorKind::TimedOut] once the timeout elapses, or
    /// [io::ErrorKind::NotConnected] if the listener was closed.
    pub fn accept(&self) -> Result<TcpStream> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let conn = self.listener.accept(true, deadline)?;

        Ok(TcpStream::new(self.stack.clone(), conn))
    }

    /// Accepts an established connection if one is waiting.
    ///
    /// # Errors
    ///
    /// Fails with [io::ErrorKind::WouldBlock] if none is.
    pub fn try_accept(&self) -> Result<TcpStream> {
        let conn = self.listener.accept(false, None)?;
        Ok(TcpStream::new(self.stack.clone(), conn))
    }

    /// Returns the local socket address of this listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.addr()
    }

    /// Bounds how long [TcpListener::accept] blocks; `None` waits
    /// indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Stops listening. Half-open requests are dropped and established
    /// connections never accepted are reset.
    pub fn close(&self) {
        self.stack.inner.unlisten(&self.listener, Instant::now());
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// A TCP stream between a local and a remote socket.
#[derive(Debug)]
pub struct TcpStream {
    stack: Stack,
    conn: Arc<ConnectionHandle>,
    timeout: Option<Duration>,
}

impl TcpStream {
    fn new(stack: Stack, conn: Arc<ConnectionHandle>) -> Self {
        Self {
            stack,
            conn,
            timeout: None,
        }
    }

    /// Opens a TCP connection to a remote host, blocking until the handshake
    /// completes.
    ///
    /// # Errors
    ///
    /// - [io::ErrorKind::HostUnreachable] if there is no route to `addr`.
    /// - [io::ErrorKind::AddrNotAvailable] if no local port is free.
    /// - [io::ErrorKind::ConnectionRefused] if the peer answers with a reset.
    /// - [io::ErrorKind::TimedOut] if the peer never answers.
    pub fn connect(stack: &Stack, addr: impl Into<SocketAddr>) -> Result<Self> {
        let stream = Self::connect_nonblocking(stack, addr)?;
        stream.wait_connected()?;
        Ok(stream)
    }

    /// Starts opening a TCP connection and returns at once, in `SYN_SENT`.
    ///
    /// # Errors
    ///
    /// - [io::ErrorKind::HostUnreachable] if there is no route to `addr`.
    /// - [io::ErrorKind::AddrNotAvailable] if no local port is free.
    pub fn connect_nonblocking(stack: &Stack, addr: impl Into<SocketAddr>) -> Result<Self> {
        let conn = stack.inner.connect(addr.into(), Instant::now())?;
        Ok(Self::new(stack.clone(), conn))
    }

    /// Blocks until the handshake of a connection opened with
    /// [TcpStream::connect_nonblocking] completes.
    ///
    /// # Errors
    ///
    /// Fails with the reason the handshake did not complete.
    pub fn wait_connected(&self) -> Result<()> {
        self.blocking(|tcb, _| tcb.poll_connect().unwrap_or_else(|| Err(Error::would_block())))
    }

    /// Writes data to the stream, blocking until at least one byte fits in
    /// the send buffer. Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// Fails with [io::ErrorKind::BrokenPipe] after [TcpStream::close], or
    /// with the reason the connection failed.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.blocking(|tcb, now| tcb.send(buf, now))
    }

    /// Writes data to the stream without blocking.
    ///
    /// # Errors
    ///
    /// Fails with [io::ErrorKind::WouldBlock] if the send buffer is full;
    /// otherwise as [TcpStream::send].
    pub fn try_send(&self, buf: &[u8]) -> Result<usize> {
        self.with(|tcb, now| tcb.send(buf, now))
    }

    /// Reads data from the stream, blocking until some is available.
    /// `Ok(0)` signals the peer closed its side.
    ///
    /// # Errors
    ///
    /// Fails with the reason the connection failed.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.blocking(|tcb, now| tcb.recv(&mut buf[..], now))
    }

    /// Reads data from the stream without blocking.
    ///
    /// # Errors
    ///
    /// Fails with [io::ErrorKind::WouldBlock] if no data is available;
    /// otherwise as [TcpStream::recv].
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.with(|tcb, now| tcb.recv(buf, now))
    }

    /// Closes the stream for writing. Pending data is sent before the
    /// `FIN`; reading continues until the peer closes. Calling it again has
    /// no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment could not be constructed.
    pub fn close(&self) -> Result<()> {
        self.with(|tcb, now| tcb.close(now))
    }

    /// Resets the connection, discarding any data in either direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the `RST` could not be constructed.
    pub fn abort(&self) -> Result<()> {
        self.with(|tcb, _| tcb.abort())
    }

    /// Enables or disables keepalive probing of an idle connection.
    pub fn set_keepalive(&self, enabled: bool) {
        self.with(|tcb, now| tcb.set_keepalive(enabled, now));
    }

    /// Bounds how long blocking calls wait; `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Returns the current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.with(|tcb, _| tcb.state())
    }

    /// Returns the socket address of the local half of this TCP connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.conn.socket().local
    }

    /// Returns the socket address of the remote peer of this TCP connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.socket().remote
    }

    fn with<R>(&self, f: impl FnOnce(&mut TCB, Instant) -> R) -> R {
        let now = Instant::now();
        self.conn.with(&self.stack.inner, now, |tcb| f(tcb, now))
    }

    /// Retries `op` each time the connection changes while it would block.
    fn blocking<R>(&self, mut op: impl FnMut(&mut TCB, Instant) -> Result<R>) -> Result<R> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let now = Instant::now();
            let (res, seen) = self
                .conn
                .with_generation(&self.stack.inner, now, |tcb| op(tcb, now));

            match res {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !self.conn.wait(seen, deadline) {
                        return Err(Error::timed_out());
                    }
                }
                res => return res,
            }
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.with(|tcb, now| {
            if let Err(err) = tcb.close(now) {
                error!("[{}] failed to close connection: {err}", tcb.socket());
            }
            tcb.orphan(now);
        });
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for &TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).map_err(Into::into)
    }
}

impl Write for &TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::Config;
    use crate::net::loopback::{DirectRoute, LoopbackPort};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

    /// Two stacks joined by a loopback link, each with its timer thread.
    fn pair(config: Config) -> (Stack, Stack, Arc<LoopbackPort>) {
        let (a, b) = LoopbackPort::pair().unwrap();

        let route = Arc::new(DirectRoute::new(CLIENT, 1500));
        let client = Stack::new(config.clone(), a.clone(), route.clone(), route);

        let route = Arc::new(DirectRoute::new(SERVER, 1500));
        let server = Stack::new(config, b, route.clone(), route);

        client.spawn_timer_thread().unwrap();
        server.spawn_timer_thread().unwrap();

        (client, server, a)
    }

    fn listen(server: &Stack, port: u16) -> TcpListener {
        let mut listener = TcpListener::bind(server, ([0; 4], port), 16).unwrap();
        listener.set_timeout(TIMEOUT);
        listener
    }

    fn connect(client: &Stack, port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(client, (SERVER, port)).unwrap();
        stream.set_timeout(TIMEOUT);
        stream
    }

    fn read_to_end(stream: &TcpStream) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0; 4096];

        loop {
            match stream.recv(&mut buf).unwrap() {
                0 => return data,
                n => data.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn echo_round_trip() {
        let (client, server, _link) = pair(Config::default());
        let listener = listen(&server, 7);

        let echo = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            stream.set_timeout(TIMEOUT);

            let data = read_to_end(&stream);
            (&stream).write_all(&data).unwrap();
            stream.close().unwrap();
            data.len()
        });

        let stream = connect(&client, 7);
        assert_eq!(stream.state(), ConnectionState::ESTABLISHED);
        assert_eq!(stream.peer_addr(), SocketAddr::new(SERVER, 7));

        (&stream).write_all(b"hello, world").unwrap();
        stream.close().unwrap();

        assert_eq!(read_to_end(&stream), b"hello, world");
        assert_eq!(echo.join().unwrap(), 12);
    }

    #[test]
    fn bulk_transfer_survives_loss() {
        let config = Config {
            initial_rto: Duration::from_millis(200),
            ..Config::default()
        };
        let (client, server, link) = pair(config);
        let listener = listen(&server, 9);

        // Lose every 7th frame from the client after the handshake.
        let mut count = 0;
        link.set_drop_filter(Some(Box::new(move |_: &[u8]| {
            count += 1;
            count > 3 && count % 7 == 0
        })));

        let sink = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            stream.set_timeout(TIMEOUT);
            read_to_end(&stream)
        });

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let stream = connect(&client, 9);
        (&stream).write_all(&payload).unwrap();
        stream.close().unwrap();

        assert_eq!(sink.join().unwrap(), payload);
        assert!(client.stats().retransmissions > 0);
    }

    #[test]
    fn connect_to_closed_port_is_refused() {
        let (client, _server, _link) = pair(Config::default());

        let err = TcpStream::connect(&client, (SERVER, 81)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(client.connections(), 0);
    }

    #[test]
    fn nonblocking_calls_would_block() {
        let (client, server, _link) = pair(Config::default());
        let listener = listen(&server, 8);

        assert_eq!(
            listener.try_accept().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let mut stream = TcpStream::connect_nonblocking(&client, (SERVER, 8)).unwrap();
        stream.set_timeout(TIMEOUT);
        stream.wait_connected().unwrap();

        let mut buf = [0; 16];
        assert_eq!(
            stream.try_recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.peer_addr(), stream.local_addr());
    }

    #[test]
    fn blocking_recv_times_out() {
        let (client, server, _link) = pair(Config::default());
        let listener = listen(&server, 10);

        let mut stream = connect(&client, 10);
        let _accepted = listener.accept().unwrap();

        stream.set_timeout(Some(Duration::from_millis(100)));
        let mut buf = [0; 16];
        assert_eq!(
            stream.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
    }

    #[test]
    fn abort_resets_the_peer() {
        let (client, server, _link) = pair(Config::default());
        let listener = listen(&server, 11);

        let stream = connect(&client, 11);
        let mut accepted = listener.accept().unwrap();
        accepted.set_timeout(TIMEOUT);

        stream.abort().unwrap();
        assert_eq!(stream.state(), ConnectionState::CLOSED);

        let mut buf = [0; 16];
        assert_eq!(
            accepted.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            stream.send(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn closed_listener_resets_unaccepted_connections() {
        let (client, server, _link) = pair(Config::default());
        let listener = listen(&server, 12);

        let mut stream = connect(&client, 12);
        stream.set_timeout(TIMEOUT);

        listener.close();
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        let mut buf = [0; 16];
        assert_eq!(
            stream.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn active_close_lingers_in_time_wait() {
        let (client, server, _link) = pair(Config::default());
        let listener = listen(&server, 13);

        let stream = connect(&client, 13);
        let mut accepted = listener.accept().unwrap();
        accepted.set_timeout(TIMEOUT);

        stream.close().unwrap();
        assert_eq!(read_to_end(&accepted), b"");
        accepted.close().unwrap();

        assert_eq!(read_to_end(&stream), b"");

        let deadline = Instant::now() + Duration::from_secs(10);
        while client.time_wait() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(client.time_wait(), 1);
        assert_eq!(client.connections(), 0);
        assert_eq!(stream.state(), ConnectionState::TIME_WAIT);
    }
}
