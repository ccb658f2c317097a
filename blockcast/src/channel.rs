//! Multicast channel: one UDP socket joined to the group, readiness polling,
//! datagram send/receive and last-source tracking.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use blockcast_core::{Datagram, Error, Result, MAX_DATAGRAM_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::debug;

/// Outcome of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The timeout elapsed.
    Idle,
    Readable,
    Writable,
    Both,
}

impl Readiness {
    pub fn is_readable(self) -> bool {
        matches!(self, Readiness::Readable | Readiness::Both)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Readiness::Writable | Readiness::Both)
    }
}

/// A socket bound to `INADDR_ANY:port` and joined to one group. Everything
/// sent goes to the destination, which is the group unless redirected.
pub struct MulticastChannel {
    socket: UdpSocket,
    destination: SocketAddr,
    last_source: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl MulticastChannel {
    /// Create the socket, bind it and join `group`. Must run inside a tokio runtime.
    pub fn open(group: Ipv4Addr, port: u16, ttl: u32, multicast_loop: bool) -> Result<Self> {
        let socket =
            make_multicast_socket(group, port, ttl, multicast_loop).map_err(Error::Transport)?;
        debug!(%group, port, "joined multicast group");
        Ok(Self::from_socket(
            socket,
            SocketAddr::V4(SocketAddrV4::new(group, port)),
        ))
    }

    /// Wrap an already configured socket.
    pub fn from_socket(socket: UdpSocket, destination: SocketAddr) -> Self {
        Self {
            socket,
            destination,
            last_source: None,
            buf: vec![0u8; MAX_DATAGRAM_LEN],
        }
    }

    /// Wait up to `timeout` (forever when `None`) for readability, and for
    /// writability too when `want_write` is set.
    pub async fn poll(&self, timeout: Option<Duration>, want_write: bool) -> Result<Readiness> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = match timeout {
            Some(t) => match tokio::time::timeout(t, self.socket.ready(interest)).await {
                Ok(ready) => ready,
                Err(_) => return Ok(Readiness::Idle),
            },
            None => self.socket.ready(interest).await,
        }
        .map_err(Error::Transport)?;
        Ok(
            match (ready.is_readable(), want_write && ready.is_writable()) {
                (true, true) => Readiness::Both,
                (true, false) => Readiness::Readable,
                (false, true) => Readiness::Writable,
                (false, false) => Readiness::Idle,
            },
        )
    }

    /// Read one datagram and validate its framing. `Ok(None)` when the
    /// readiness turned out to be spurious.
    pub fn receive(&mut self) -> Result<Option<Datagram>> {
        let (n, source) = match self.socket.try_recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::Transport(e)),
        };
        self.last_source = Some(source);
        let datagram = Datagram::parse(self.buf[..n].to_vec())?;
        Ok(Some(datagram))
    }

    /// Send the whole datagram to the destination.
    pub async fn send(&self, datagram: &Datagram) -> Result<()> {
        let written = self
            .socket
            .send_to(datagram.as_bytes(), self.destination)
            .await
            .map_err(Error::Transport)?;
        if written != datagram.len() {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", written, datagram.len()),
            )));
        }
        Ok(())
    }

    /// Address of the most recent sender.
    pub fn last_source(&self) -> Option<SocketAddr> {
        self.last_source
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Send to `destination` instead of the group, e.g. one host for unicast debugging.
    pub fn set_destination(&mut self, destination: SocketAddr) {
        self.destination = destination;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Transport)
    }
}

/// Several processes on one host may join the same group and port, so the
/// address is marked reusable before binding.
fn make_multicast_socket(
    group: Ipv4Addr,
    port: u16,
    ttl: u32,
    multicast_loop: bool,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(multicast_loop)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
