use std::io;
use std::net::UdpSocket;

use crate::address::Address;

/// Non-blocking UDP endpoint bound to `0.0.0.0:port`.
///
/// This layer has no notion of loss or peers: `receive` reports whatever
/// datagram is pending, or `None` when the queue is drained. Reliability
/// lives one layer up.
#[derive(Debug)]
pub struct Socket {
    socket: UdpSocket,
    local_port: u16,
}

impl Socket {
    /// Binds the port (0 picks an ephemeral one) and switches the socket to
    /// non-blocking mode. `broadcast` additionally enables `SO_BROADCAST`
    /// for beacon use.
    pub fn open(port: u16, broadcast: bool) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        let local_port = socket.local_addr()?.port();
        Ok(Self { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send(&self, to: Address, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, to.to_socket_addr())?;
        Ok(())
    }

    /// Returns the next pending datagram, or `None` once the queue is empty.
    /// Datagrams from IPv6 senders are skipped.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(Address, usize)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((size, from)) => match Address::from_socket_addr(from) {
                    Some(addr) => return Ok(Some((addr, size))),
                    None => continue,
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_send_receive() {
        let a = Socket::open(0, false).unwrap();
        let b = Socket::open(0, false).unwrap();
        let b_addr = Address::new(127, 0, 0, 1, b.local_port());

        a.send(b_addr, b"hello").unwrap();

        let mut buf = [0u8; 64];
        let start = std::time::Instant::now();
        loop {
            if let Some((from, size)) = b.receive(&mut buf).unwrap() {
                assert_eq!(&buf[..size], b"hello");
                assert_eq!(from.port(), a.local_port());
                break;
            }
            assert!(start.elapsed().as_millis() < 500, "datagram never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_receive_empty_is_none() {
        let s = Socket::open(0, false).unwrap();
        let mut buf = [0u8; 16];
        assert!(s.receive(&mut buf).unwrap().is_none());
    }
}
