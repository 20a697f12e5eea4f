use log::trace;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

const SOCKET: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Readable,
    TimedOut,
    Interrupted,
}

/// The one non-blocking UDP socket a host multiplexes every peer over,
/// plus the poll registration used to sleep until it turns readable.
pub(crate) struct Socket {
    io: UdpSocket,
    poll: Poll,
    events: Events,
}

impl Socket {
    pub fn bind(addr: SocketAddr) -> io::Result<Socket> {
        let mut io = UdpSocket::bind(addr)?;
        io.set_broadcast(true)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut io, SOCKET, Interest::READABLE)?;

        Ok(Socket {
            io,
            poll,
            events: Events::with_capacity(4),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    /// Send one datagram. A full kernel buffer drops the datagram (returns
    /// 0 sent) rather than blocking; the protocol treats that as loss.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.io.send_to(data, addr) {
            Ok(sent) => Ok(sent),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("send_to; would block; addr={:?}; len={}", addr, data.len());
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Receive one datagram if any is queued.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.io.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // A previous send hit a closed port; the datagram path stays up.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block until the socket is readable, the timeout elapses, or the
    /// wait is interrupted by a signal.
    pub fn wait(&mut self, timeout_ms: u32) -> io::Result<Wait> {
        let timeout = Duration::from_millis(u64::from(timeout_ms));

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {
                if self.events.iter().next().is_some() {
                    Ok(Wait::Readable)
                } else {
                    Ok(Wait::TimedOut)
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(Wait::Interrupted),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unwrap::unwrap;

    fn local() -> SocketAddr {
        unwrap!("127.0.0.1:0".parse())
    }

    #[test]
    fn empty_socket_reports_would_block_as_none() {
        let socket = unwrap!(Socket::bind(local()));
        let mut buf = [0u8; 64];

        assert!(unwrap!(socket.recv_from(&mut buf)).is_none());
    }

    #[test]
    fn wait_wakes_on_an_incoming_datagram() {
        let mut receiver = unwrap!(Socket::bind(local()));
        let sender = unwrap!(Socket::bind(local()));
        let addr = unwrap!(receiver.local_addr());

        assert_eq!(unwrap!(sender.send_to(b"ping", addr)), 4);

        assert_eq!(unwrap!(receiver.wait(1000)), Wait::Readable);

        let mut buf = [0u8; 64];
        let (len, from) = unwrap!(unwrap!(receiver.recv_from(&mut buf)));
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, unwrap!(sender.local_addr()));
    }

    #[test]
    fn wait_times_out_when_idle() {
        let mut socket = unwrap!(Socket::bind(local()));

        assert_eq!(unwrap!(socket.wait(10)), Wait::TimedOut);
    }
}
