//! UDP socket pool for the tunnel's IPv4/IPv6 listeners, grounded on the
//! dual-stack setup pattern in `nyx-transport`'s `Transport`, adapted here
//! to a single-threaded cooperative event loop: no background tasks are
//! spawned, sockets are driven directly from `tokio::select!` in the
//! daemon's loop.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Either bind address may be absent (spec §6); at least one must be set
/// (enforced by `vex_core::Config::validate`).
pub struct UdpPool {
    pub v4: Option<UdpSocket>,
    pub v6: Option<UdpSocket>,
}

impl UdpPool {
    pub fn bind(bind_v4: Option<SocketAddr>, bind_v6: Option<SocketAddr>) -> io::Result<Self> {
        let v4 = bind_v4.map(bind_nonblocking).transpose()?;
        let v6 = bind_v6.map(bind_nonblocking).transpose()?;
        Ok(Self { v4, v6 })
    }

    /// Send on whichever socket matches the destination's address family.
    pub async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        match dest {
            SocketAddr::V4(_) => self
                .v4
                .as_ref()
                .ok_or_else(no_socket)?
                .send_to(buf, dest)
                .await,
            SocketAddr::V6(_) => self
                .v6
                .as_ref()
                .ok_or_else(no_socket)?
                .send_to(buf, dest)
                .await,
        }
    }
}

fn no_socket() -> io::Error {
    io::Error::new(io::ErrorKind::AddrNotAvailable, "no bound socket for address family")
}

fn bind_nonblocking(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
