//! I/O seams: the UDP transport carrying ESP, and the local byte streams
//! emulated TCP flows relay to.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};

use log::debug;

/// Sends raw datagrams to a peer endpoint.
pub trait Transport: Send + Sync {
    fn send_raw(&self, data: &[u8], to: SocketAddr) -> io::Result<()>;
}

impl Transport for UdpSocket {
    fn send_raw(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        let sent = self.send_to(data, to)?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {} of {} bytes", sent, data.len()),
            ));
        }
        Ok(())
    }
}

/// The real byte stream behind one emulated TCP flow.
pub trait BackingStream: Send {
    /// Bytes that can be received without blocking.
    fn available(&mut self) -> io::Result<usize>;
    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, buffer: &[u8]) -> io::Result<usize>;
    fn close(&mut self) -> io::Result<()>;
}

/// Opens the backing stream for a flow once its handshake completes.
pub trait BackingConnector: Send + Sync {
    /// `local` is the address and port the remote side asked for.
    fn connect(&self, local: SocketAddrV4) -> io::Result<Box<dyn BackingStream>>;
}

/// Relays every flow to a web application listening on the loopback
/// interface, whatever port the remote requested.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    port: u16,
}

impl LoopbackConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl BackingConnector for LoopbackConnector {
    fn connect(&self, local: SocketAddrV4) -> io::Result<Box<dyn BackingStream>> {
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port);
        debug!("Opening backing stream to {} for {}", target, local);
        let stream = TcpStream::connect(target)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(LocalStream::new(stream)))
    }
}

/// A blocking [`TcpStream`] with a non-blocking readiness probe.
pub struct LocalStream {
    stream: TcpStream,
    probe: Vec<u8>,
    closed: bool,
}

impl LocalStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            probe: vec![0u8; 64 * 1024],
            closed: false,
        }
    }
}

impl BackingStream for LocalStream {
    fn available(&mut self) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.stream.set_nonblocking(true)?;
        let peeked = match self.stream.peek(&mut self.probe) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        };
        self.stream.set_nonblocking(false)?;
        peeked
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        self.stream.read(buffer)
    }

    fn send(&mut self, buffer: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        self.stream.write_all(buffer)?;
        Ok(buffer.len())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    #[test]
    fn loopback_stream_relays_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = LoopbackConnector::new(port);
        let mut backing = connector
            .connect(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 80))
            .unwrap();
        let (mut app, _) = listener.accept().unwrap();

        assert_eq!(backing.available().unwrap(), 0);
        assert_eq!(backing.send(b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        app.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        app.write_all(b"world!").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while backing.available().unwrap() < 6 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut buf = [0u8; 16];
        let n = backing.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world!");

        backing.close().unwrap();
        backing.close().unwrap();
        assert!(backing.send(b"late").is_err());
    }
}
