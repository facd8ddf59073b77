//! `SoftPeer` — the active side of a soft fabric connection.
//!
//! Connects, waits for `ACCEPT`, confirms with `READY`. After that each
//! `send` is one inbound message at the server and each `recv` returns one
//! message the server posted.

use crate::wire::{self, Frame};

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};

#[derive(Debug)]
pub struct SoftPeer {
    stream: TcpStream,
}

impl SoftPeer {
    /// Connect and complete the handshake.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        match wire::read_frame(&mut stream)? {
            Some(Frame::Accept) => {}
            Some(other) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected ACCEPT, got {:?}", other),
                ))
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection closed before accept",
                ))
            }
        }
        wire::write_frame(&mut stream, &Frame::Ready)?;
        Ok(Self { stream })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn send(&mut self, message: &[u8]) -> io::Result<()> {
        wire::write_frame(&mut self.stream, &Frame::Data(message.to_vec()))
    }

    /// Next message from the server. `None` if the server went away.
    pub fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match wire::read_frame(&mut self.stream)? {
                Some(Frame::Data(payload)) => return Ok(Some(payload)),
                Some(Frame::Disconnect) | None => return Ok(None),
                Some(other) => log::debug!("peer: ignoring {:?}", other),
            }
        }
    }

    /// Say goodbye and close.
    pub fn disconnect(mut self) -> io::Result<()> {
        wire::write_frame(&mut self.stream, &Frame::Disconnect)?;
        self.stream.shutdown(Shutdown::Both)
    }
}

/// Cut `message` at its first NUL.
pub fn until_nul(message: &[u8]) -> &[u8] {
    match message.iter().position(|&b| b == 0) {
        Some(end) => &message[..end],
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_handshake_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            wire::write_frame(&mut s, &Frame::Accept).unwrap();
            assert_eq!(wire::read_frame(&mut s).unwrap(), Some(Frame::Ready));
            assert_eq!(wire::read_frame(&mut s).unwrap(), Some(Frame::Data(b"hi".to_vec())));
            wire::write_frame(&mut s, &Frame::Data(b"yo\0\0".to_vec())).unwrap();
            assert_eq!(wire::read_frame(&mut s).unwrap(), Some(Frame::Disconnect));
        });

        let mut peer = SoftPeer::connect(addr).unwrap();
        peer.send(b"hi").unwrap();
        let reply = peer.recv().unwrap().unwrap();
        assert_eq!(until_nul(&reply), b"yo");
        peer.disconnect().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_refused_before_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            drop(s);
        });
        let err = SoftPeer::connect(addr).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        server.join().unwrap();
    }
}
