//! Shared fixtures: an in-memory transport, scripted backing streams and a
//! peer tunnel holding the mirrored SA.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use espvpn_core::packet::{self, IpV4Packet};
use espvpn_core::tcp::TcpFlags;
use espvpn_core::{
    AesCbcHmacSha256, BackingConnector, BackingStream, EspCrypto, SaParams, Transport,
    TunnelSession, TunnelSettings,
};
use etherparse::{IpNumber, TcpHeader};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
pub const SERVICE: Ipv4Addr = Ipv4Addr::new(55, 55, 55, 55);
pub const SPI_OURS: u32 = 0x0A0B_0C0D;
pub const SPI_THEIRS: u32 = 0xC0FF_EE00;

pub fn sender() -> SocketAddr {
    SocketAddr::new(GATEWAY.into(), 4500)
}

#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl Transport for Recorder {
    fn send_raw(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        self.sent.lock().push((data.to_vec(), to));
        Ok(())
    }
}

impl Recorder {
    pub fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

/// Bytes moving through one fake local application connection.
#[derive(Default)]
pub struct AppSide {
    pub received: Vec<u8>,
    pub pending: VecDeque<Vec<u8>>,
    pub closed: bool,
    /// When set, the next readiness check signals the first channel and
    /// then blocks until the second one delivers.
    pub gate: Option<(Sender<()>, Receiver<()>)>,
}

struct AppStream(Arc<Mutex<AppSide>>);

impl BackingStream for AppStream {
    fn available(&mut self) -> io::Result<usize> {
        let gate = self.0.lock().gate.take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        Ok(self.0.lock().pending.iter().map(Vec::len).sum())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut side = self.0.lock();
        let Some(mut chunk) = side.pending.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buffer.len());
        buffer[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            side.pending.push_front(chunk);
        }
        Ok(n)
    }

    fn send(&mut self, buffer: &[u8]) -> io::Result<usize> {
        self.0.lock().received.extend_from_slice(buffer);
        Ok(buffer.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.0.lock().closed = true;
        Ok(())
    }
}

/// Hands out one [`AppSide`] per connect call, recording each.
#[derive(Default)]
pub struct AppConnector {
    pub apps: Mutex<Vec<(SocketAddrV4, Arc<Mutex<AppSide>>)>>,
}

impl BackingConnector for AppConnector {
    fn connect(&self, local: SocketAddrV4) -> io::Result<Box<dyn BackingStream>> {
        let side = Arc::new(Mutex::new(AppSide::default()));
        self.apps.lock().push((local, side.clone()));
        Ok(Box::new(AppStream(side)))
    }
}

fn crypto(enc: u8, auth: u8) -> Box<dyn EspCrypto> {
    Box::new(AesCbcHmacSha256::new(&[enc; 32], &[auth; 32]).unwrap())
}

pub struct Harness {
    pub ours: Arc<TunnelSession>,
    pub peer: TunnelSession,
    pub transport: Arc<Recorder>,
    pub connector: Arc<AppConnector>,
}

impl Harness {
    pub fn new(settings: TunnelSettings) -> Self {
        Self::build(settings, false)
    }

    pub fn build(settings: TunnelSettings, initiator: bool) -> Self {
        let transport = Arc::new(Recorder::default());
        let connector = Arc::new(AppConnector::default());
        let ours = TunnelSession::new(
            GATEWAY,
            SaParams {
                spi_in: SPI_OURS,
                spi_out: SPI_THEIRS,
                crypto_in: crypto(1, 2),
                crypto_out: crypto(3, 4),
            },
            Some(transport.clone() as Arc<dyn Transport>),
        )
        .with_settings(settings)
        .with_connector(connector.clone() as Arc<dyn BackingConnector>)
        .with_rng(StdRng::seed_from_u64(42))
        .initiator(initiator);
        let peer = TunnelSession::new(
            GATEWAY,
            SaParams {
                spi_in: SPI_THEIRS,
                spi_out: SPI_OURS,
                crypto_in: crypto(3, 4),
                crypto_out: crypto(1, 2),
            },
            None,
        );
        Self {
            ours: Arc::new(ours),
            peer,
            transport,
            connector,
        }
    }

    /// Deliver `packet` as the peer would, from the gateway endpoint.
    pub fn deliver(&self, packet: &IpV4Packet) {
        self.deliver_from(packet, sender());
    }

    pub fn deliver_from(&self, packet: &IpV4Packet, from: SocketAddr) {
        let message = self.peer.encapsulate(packet).unwrap();
        self.ours.handle_datagram(&message, from).unwrap();
    }

    /// Decrypt everything our tunnel sent since the last call.
    pub fn replies(&self) -> Vec<IpV4Packet> {
        self.transport
            .take()
            .into_iter()
            .map(|(bytes, _)| self.peer.decapsulate(&bytes).unwrap())
            .collect()
    }

    pub fn tcp_replies(&self) -> Vec<(TcpHeader, Vec<u8>)> {
        self.replies()
            .into_iter()
            .map(|p| {
                let (tcp, data) = TcpHeader::from_slice(&p.payload).unwrap();
                (tcp, data.to_vec())
            })
            .collect()
    }
}

pub fn tcp_segment(
    source: Ipv4Addr,
    source_port: u16,
    destination_port: u16,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> IpV4Packet {
    let mut tcp = TcpHeader::new(source_port, destination_port, seq, 4096);
    tcp.acknowledgment_number = ack;
    tcp.fin = flags & TcpFlags::FIN != 0;
    tcp.syn = flags & TcpFlags::SYN != 0;
    tcp.rst = flags & TcpFlags::RST != 0;
    tcp.psh = flags & TcpFlags::PSH != 0;
    tcp.ack = flags & TcpFlags::ACK != 0;
    let header = packet::ipv4_header(
        source,
        SERVICE,
        IpNumber::TCP,
        tcp.header_len() as usize + payload.len(),
        7,
    )
    .unwrap();
    tcp.checksum = tcp.calc_checksum_ipv4(&header, payload).unwrap();
    let mut body = Vec::new();
    tcp.write(&mut body).unwrap();
    body.extend_from_slice(payload);
    IpV4Packet::new(header, body)
}
