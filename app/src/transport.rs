use std::io::{self, ErrorKind::WouldBlock};
use std::net::{SocketAddr, UdpSocket};

use sip_engine::Transport;

/// Non-blocking UDP socket connected to a single next hop.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    pub fn bind(local: &str, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        // Connecting picks the outgoing interface, so local_addr() reports
        // an address the peer can reach.
        socket.connect(peer)?;
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// One datagram, or `None` when nothing is waiting.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(ref e) if e.kind() == WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, data: &str) -> bool {
        match self.socket.send(data.as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("SIP send to {} failed: {:?}", self.peer, e);
                false
            }
        }
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn via_transport(&self) -> &str {
        "UDP"
    }
}
