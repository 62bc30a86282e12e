// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket I/O reactor.
//!
//! Thin layer over `mio::Poll`: token allocation, interest registration and
//! a microsecond-timeout wait. mio delivers edge-triggered readiness, so the
//! discipline everywhere in this crate is:
//!
//! - on readable: drain with [`drain_read`] until `WouldBlock` or EOF
//! - on writable (and immediately after queueing bytes): flush with
//!   [`flush_write`] until done or `WouldBlock`
//!
//! Missing either half loses the edge and stalls the flow.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

/// Chunk size for socket reads.
const READ_CHUNK: usize = 8 * 1024;

/// Maximum events drained per poll.
const MAX_EVENTS: usize = 128;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Poll wrapper owning the token space.
pub struct Reactor {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            next_token: 0,
        })
    }

    /// Allocate a fresh token. Tokens are never reused.
    pub fn next_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Register a source with the given interests.
    pub fn register<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, token, interests(readable, writable))
    }

    /// Change the interests of an already registered source.
    pub fn reregister<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, token, interests(readable, writable))
    }

    /// Remove a source from the poll set.
    pub fn deregister<S: Source>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Wait for readiness or timeout. `None` waits indefinitely.
    pub fn wait(&mut self, timeout_usec: Option<u64>) -> io::Result<Vec<Ready>> {
        let timeout = timeout_usec.map(Duration::from_micros);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            ready.push(Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }
        Ok(ready)
    }
}

fn interests(readable: bool, writable: bool) -> Interest {
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // Registration with no interest is a caller bug; default to read.
        _ => Interest::READABLE,
    }
}

/// How a drain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket has no more bytes for now.
    WouldBlock,

    /// Peer closed its sending half.
    Eof,
}

/// Read everything currently available into `buf`.
///
/// Returns the number of bytes appended and how the drain stopped. Real
/// I/O errors (reset, aborted) surface as `Err`.
pub fn drain_read(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<(usize, ReadOutcome)> {
    let mut total = 0usize;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok((total, ReadOutcome::Eof)),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok((total, ReadOutcome::WouldBlock))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// How a flush stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything up to `buf.len()` has been handed to the kernel.
    Flushed,

    /// Socket buffer full; `offset` records the resume point.
    Pending,
}

/// Write `buf[*offset..]`, advancing `offset`.
pub fn flush_write(
    stream: &mut TcpStream,
    buf: &[u8],
    offset: &mut usize,
) -> io::Result<WriteOutcome> {
    while *offset < buf.len() {
        match stream.write(&buf[*offset..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket refused bytes",
                ))
            }
            Ok(n) => *offset += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::Pending),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(WriteOutcome::Flushed)
}

/// Start a non-blocking connect.
pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}

/// Check whether a non-blocking connect has completed.
///
/// Call on the first writable event after `connect`. `Ok(true)` means
/// established, `Ok(false)` means still in progress.
pub fn connect_complete(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        // Linux reports EINPROGRESS through peer_addr as WouldBlock.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

/// Apply per-session socket options (nodelay, keepalive).
pub fn configure_stream(
    stream: &TcpStream,
    nodelay: bool,
    keepalive: Option<Duration>,
) -> io::Result<()> {
    stream.set_nodelay(nodelay)?;
    if let Some(interval) = keepalive {
        let sock = socket2::SockRef::from(stream);
        let ka = socket2::TcpKeepalive::new().with_time(interval);
        sock.set_tcp_keepalive(&ka)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    #[test]
    fn test_token_allocation_unique() {
        let mut reactor = Reactor::new().unwrap();
        let a = reactor.next_token();
        let b = reactor.next_token();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wait_times_out_empty() {
        let mut reactor = Reactor::new().unwrap();
        let ready = reactor.wait(Some(1_000)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_listener_accept_readiness() {
        let mut reactor = Reactor::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();

        let tok = reactor.next_token();
        reactor.register(&mut listener, tok, true, false).unwrap();

        // Connect from a plain std stream; the listener must become readable.
        let _client = std::net::TcpStream::connect(local).unwrap();

        let mut accepted = false;
        for _ in 0..50 {
            let ready = reactor.wait(Some(100_000)).unwrap();
            if ready.iter().any(|r| r.token == tok && r.readable) {
                let (stream, _) = listener.accept().unwrap();
                drop(stream);
                accepted = true;
                break;
            }
        }
        assert!(accepted, "listener never became readable");
    }

    #[test]
    fn test_connect_and_roundtrip() {
        let mut reactor = Reactor::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();

        let ltok = reactor.next_token();
        reactor.register(&mut listener, ltok, true, false).unwrap();

        let mut client = connect(local).unwrap();
        let ctok = reactor.next_token();
        reactor.register(&mut client, ctok, true, true).unwrap();

        let mut server_side = None;
        let mut connected = false;
        let payload = b"ping".to_vec();
        let mut offset = 0usize;
        let mut echoed = Vec::new();

        for _ in 0..100 {
            let ready = reactor.wait(Some(100_000)).unwrap();
            for r in ready {
                if r.token == ltok {
                    let (mut s, _) = listener.accept().unwrap();
                    let stok = reactor.next_token();
                    reactor.register(&mut s, stok, true, false).unwrap();
                    server_side = Some((s, stok));
                }
                if r.token == ctok && r.writable && !connected {
                    connected = connect_complete(&client).unwrap();
                    if connected {
                        flush_write(&mut client, &payload, &mut offset).unwrap();
                    }
                }
                if let Some((ref mut s, stok)) = server_side {
                    if r.token == stok && r.readable {
                        let _ = drain_read(s, &mut echoed).unwrap();
                    }
                }
            }
            if echoed == payload {
                return;
            }
        }
        panic!("payload never arrived: got {:?}", echoed);
    }

    #[test]
    fn test_flush_write_tracks_offset() {
        // Flush into a connected pair until Pending, offset must advance.
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = std::net::TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();
        let std_client = std::net::TcpStream::connect(local).unwrap();
        std_client.set_nonblocking(true).unwrap();
        let mut client = TcpStream::from_std(std_client);
        let (_peer, _) = listener.accept().unwrap();

        // Large enough to overflow the socket buffer without a reader.
        let big = vec![0xABu8; 64 * 1024 * 1024];
        let mut offset = 0usize;
        let out = flush_write(&mut client, &big, &mut offset).unwrap();
        assert_eq!(out, WriteOutcome::Pending);
        assert!(offset > 0 && offset < big.len());
    }
}
