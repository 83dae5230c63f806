//! Emulated TCP responder for flows arriving through an ESP tunnel.
//!
//! The gateway has no OS stack for addresses that only exist inside the
//! tunnel, so each flow is answered by a small hand-written state machine:
//!
//! - Listen -> SynReceived on a pure SYN (SYN+ACK reply)
//! - SynReceived -> Established on a pure ACK (backing stream opened)
//! - Established relays payload to the backing stream and drains replies
//! - any closing state ends the session on the next inbound segment
//!
//! Replies are handed back to the owning tunnel through [`TunnelLink`].
//! Handlers never call into the session table themselves; they return a
//! [`Disposition`] that the tunnel acts on once the connection is unlocked.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use etherparse::{IpNumber, TcpHeader};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{TcpError, TunnelError};
use crate::packet::{self, IpV4Packet};
use crate::session_table::FlowKey;
use crate::transport::{BackingConnector, BackingStream};

/// TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    SynSent,
}

/// TCP flags constants
pub struct TcpFlags;

impl TcpFlags {
    pub const NONE: u8 = 0x00;
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn of(header: &TcpHeader) -> u8 {
        let mut flags = Self::NONE;
        for (set, bit) in [
            (header.fin, Self::FIN),
            (header.syn, Self::SYN),
            (header.rst, Self::RST),
            (header.psh, Self::PSH),
            (header.ack, Self::ACK),
            (header.urg, Self::URG),
            (header.ece, Self::ECE),
            (header.cwr, Self::CWR),
        ] {
            if set {
                flags |= bit;
            }
        }
        flags
    }

    fn apply(header: &mut TcpHeader, flags: u8) {
        header.fin = flags & Self::FIN != 0;
        header.syn = flags & Self::SYN != 0;
        header.rst = flags & Self::RST != 0;
        header.psh = flags & Self::PSH != 0;
        header.ack = flags & Self::ACK != 0;
    }
}

/// Upward path from a connection to the tunnel that owns it.
pub trait TunnelLink {
    /// Encapsulate `packet` and send it to `gateway`.
    fn send(&self, packet: &IpV4Packet, gateway: SocketAddr) -> Result<(), TunnelError>;
}

/// What the owning tunnel should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The connection asks to be torn down.
    EndSession,
}

/// One emulated TCP flow.
pub struct VirtualTcpConnection {
    key: FlowKey,
    /// Tunnel endpoint the flow's first packet arrived from.
    gateway: SocketAddr,
    state: TcpState,
    local_seq: u32,
    remote_seq: u32,
    local_address: Ipv4Addr,
    local_port: u16,
    remote_address: Ipv4Addr,
    remote_port: u16,
    window_size: u16,
    last_contact: Instant,
    backing: Option<Box<dyn BackingStream>>,
    connector: Arc<dyn BackingConnector>,
    buffer: Vec<u8>,
    rng: StdRng,
}

impl VirtualTcpConnection {
    pub fn new(
        key: FlowKey,
        gateway: SocketAddr,
        connector: Arc<dyn BackingConnector>,
        relay_buffer_size: usize,
        rng: StdRng,
    ) -> Self {
        Self {
            key,
            gateway,
            state: TcpState::Closed,
            local_seq: 0,
            remote_seq: 0,
            local_address: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_address: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            window_size: 0,
            last_contact: Instant::now(),
            backing: None,
            connector,
            buffer: vec![0u8; relay_buffer_size.max(1)],
            rng,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_seq
    }

    /// Time since the last inbound segment.
    pub fn idle_time(&self) -> Duration {
        self.last_contact.elapsed()
    }

    pub fn local_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.local_address, self.local_port)
    }

    pub fn remote_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_address, self.remote_port)
    }

    /// Initiate the connection from the flow's first packet.
    ///
    /// Any error is fatal to the connection attempt: the connection is
    /// closed again and must not be installed in the session table.
    pub fn start(
        &mut self,
        packet: &IpV4Packet,
        link: &dyn TunnelLink,
    ) -> Result<Disposition, TcpError> {
        if self.state != TcpState::Closed {
            return Err(TcpError::InvalidState {
                expected: TcpState::Closed,
                actual: self.state,
            });
        }
        debug!("TCP session initiation");

        self.local_seq = self.rng.gen_range(100..65000);
        self.state = TcpState::Listen;

        let disposition = match self.handle_message(packet, link) {
            Ok(d) => d,
            Err(e) => {
                debug!("TCP session initiation failed: {}", e);
                if let Err(close_err) = self.close() {
                    warn!("Failed to release aborted TCP session: {}", close_err);
                }
                return Err(e);
            }
        };

        self.last_contact = Instant::now();
        debug!(
            "TCP session initiation completed: remote={}, local={}",
            self.remote_endpoint(),
            self.local_endpoint()
        );
        Ok(disposition)
    }

    /// Continue the session with another packet from the remote.
    pub fn accept(
        &mut self,
        packet: &IpV4Packet,
        link: &dyn TunnelLink,
    ) -> Result<Disposition, TcpError> {
        self.last_contact = Instant::now();
        self.handle_message(packet, link)
    }

    /// Drive outbound data. Returns true if any bytes were relayed.
    pub fn event_pump(&mut self, link: &dyn TunnelLink) -> Result<bool, TcpError> {
        if self.state != TcpState::Established {
            return Ok(false);
        }
        Ok(self.drain_backing(link)? > 0)
    }

    /// Release the backing stream. Safe to call repeatedly.
    pub fn close(&mut self) -> std::io::Result<()> {
        self.state = TcpState::Closed;
        match self.backing.take() {
            Some(mut backing) => backing.close(),
            None => Ok(()),
        }
    }

    /// Feed an incoming packet through the state machine.
    fn handle_message(
        &mut self,
        packet: &IpV4Packet,
        link: &dyn TunnelLink,
    ) -> Result<Disposition, TcpError> {
        let (tcp, payload) = match TcpHeader::from_slice(&packet.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("TCP payload did not parse: {}", e);
                return Err(TcpError::Malformed);
            }
        };
        let flags = TcpFlags::of(&tcp);

        debug!(
            "From {}:{} to {}:{} flags={:#04x} seq={} ack={} len={} state={:?}",
            packet.source(),
            tcp.source_port,
            packet.destination(),
            tcp.destination_port,
            flags,
            tcp.sequence_number,
            tcp.acknowledgment_number,
            payload.len(),
            self.state
        );

        match self.state {
            TcpState::Closed => Err(TcpError::ClosedConnection),

            // Expect a SYN and move to SynReceived
            TcpState::Listen => {
                if flags != TcpFlags::SYN {
                    return Err(TcpError::UnexpectedFlags {
                        state: self.state,
                        flags,
                    });
                }
                // The opening segment fixes both endpoints for the flow's life.
                self.local_address = packet.destination();
                self.local_port = tcp.destination_port;
                self.remote_address = packet.source();
                self.remote_port = tcp.source_port;
                self.window_size = tcp.window_size;
                self.remote_seq = tcp.sequence_number.wrapping_add(1);
                self.reply(link, TcpFlags::SYN | TcpFlags::ACK, &[])?;
                self.state = TcpState::SynReceived;
                Ok(Disposition::Continue)
            }

            // Expect the ACK completing the handshake
            TcpState::SynReceived => {
                if flags != TcpFlags::ACK {
                    return Err(TcpError::UnexpectedFlags {
                        state: self.state,
                        flags,
                    });
                }

                // Tolerated: some peers and NAT boxes get these wrong.
                if tcp.sequence_number != self.remote_seq {
                    warn!(
                        "Initial SYNC: request out of sequence: expected {}, got {}",
                        self.remote_seq, tcp.sequence_number
                    );
                }
                if tcp.acknowledgment_number != self.local_seq {
                    warn!(
                        "Initial SYNC: acknowledgement out of sequence: expected {}, got {}",
                        self.local_seq, tcp.acknowledgment_number
                    );
                }

                if self.backing.is_none() {
                    self.backing = Some(self.connector.connect(self.local_endpoint())?);
                }
                self.state = TcpState::Established;
                info!(
                    "TCP connection established: {} -> {}",
                    self.remote_endpoint(),
                    self.local_endpoint()
                );
                Ok(Disposition::Continue)
            }

            TcpState::Established => self.handle_established(&tcp, flags, payload, link),

            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait
            | TcpState::SynSent => {
                info!("Immediate end of session from state {:?}", self.state);
                Ok(Disposition::EndSession)
            }
        }
    }

    fn handle_established(
        &mut self,
        tcp: &TcpHeader,
        flags: u8,
        payload: &[u8],
        link: &dyn TunnelLink,
    ) -> Result<Disposition, TcpError> {
        if tcp.source_port != self.remote_port {
            warn!(
                "Segment from port {} collides with flow {}. Ignored",
                tcp.source_port,
                self.remote_endpoint()
            );
            return Ok(Disposition::Continue);
        }

        if flags & TcpFlags::SYN != 0 {
            warn!(
                "Unexpected SYN on established flow {} (flags={:#04x}). Ignored",
                self.remote_endpoint(),
                flags
            );
            return Ok(Disposition::Continue);
        }

        self.window_size = tcp.window_size;

        if flags & TcpFlags::RST != 0 {
            info!("Remote reset {} (flags={:#04x})", self.remote_endpoint(), flags);
            self.state = TcpState::FinWait1;
            return Ok(Disposition::EndSession);
        }

        if flags == TcpFlags::ACK && payload.is_empty() {
            debug!("Handshake complete. Connected to {}", self.remote_endpoint());
            return Ok(Disposition::Continue);
        }

        if tcp.sequence_number != self.remote_seq {
            warn!(
                "Established request out of sequence: expected {}, got {}",
                self.remote_seq, tcp.sequence_number
            );
        }
        if tcp.acknowledgment_number != self.local_seq {
            warn!(
                "Established acknowledgement out of sequence: expected {}, got {}",
                self.local_seq, tcp.acknowledgment_number
            );
        }

        // One per segment, not per byte.
        self.remote_seq = self.remote_seq.wrapping_add(1);

        if !payload.is_empty() {
            let backing = self.backing.as_mut().ok_or(TcpError::ClosedConnection)?;
            let written = backing.send(payload)?;
            debug!("Sent {} bytes to app from {} bytes of payload", written, payload.len());
        }

        self.drain_backing(link)?;
        Ok(Disposition::Continue)
    }

    /// Relay everything the backing stream has ready. Returns bytes relayed.
    fn drain_backing(&mut self, link: &dyn TunnelLink) -> Result<usize, TcpError> {
        let Some(mut backing) = self.backing.take() else {
            return Ok(0);
        };
        let result = self.drain_from(backing.as_mut(), link);
        self.backing = Some(backing);
        result
    }

    fn drain_from(
        &mut self,
        backing: &mut dyn BackingStream,
        link: &dyn TunnelLink,
    ) -> Result<usize, TcpError> {
        let mut total = 0;
        let mut available = backing.available()?;
        while available > 0 {
            let mut chunk = std::mem::take(&mut self.buffer);
            let read = backing.receive(&mut chunk);
            let read = match read {
                Ok(n) => n,
                Err(e) => {
                    self.buffer = chunk;
                    return Err(e.into());
                }
            };
            if read == 0 {
                self.buffer = chunk;
                break;
            }
            available = backing.available()?;
            debug!("Read {} bytes from app, {} more available", read, available);

            // ACK|PSH marks the last chunk of this burst
            let flags = if available > 0 {
                TcpFlags::NONE
            } else {
                TcpFlags::ACK | TcpFlags::PSH
            };
            let sent = self.reply(link, flags, &chunk[..read]);
            self.buffer = chunk;
            sent?;
            total += read;
        }
        Ok(total)
    }

    /// Build a segment back to the remote, wrap it in a fresh IPv4 header
    /// and hand it to the tunnel. Advances the local sequence by one.
    fn reply(&mut self, link: &dyn TunnelLink, flags: u8, payload: &[u8]) -> Result<(), TcpError> {
        let mut tcp = TcpHeader::new(
            self.local_port,
            self.remote_port,
            self.local_seq,
            self.window_size,
        );
        tcp.acknowledgment_number = self.remote_seq;
        TcpFlags::apply(&mut tcp, flags);

        let packet_id: u16 = self.rng.gen_range(10..32700);
        let ip_header = packet::ipv4_header(
            self.local_address,
            self.remote_address,
            IpNumber::TCP,
            tcp.header_len() as usize + payload.len(),
            packet_id,
        )?;

        tcp.checksum = tcp
            .calc_checksum_ipv4(&ip_header, payload)
            .map_err(|_| TunnelError::Malformed("oversized TCP segment"))?;

        let mut segment = Vec::with_capacity(tcp.header_len() as usize + payload.len());
        tcp.write(&mut segment)?;
        segment.extend_from_slice(payload);

        debug!(
            "Reply {} -> {} flags={:#04x} seq={} ack={} checksum={:#06x}",
            self.local_endpoint(),
            self.remote_endpoint(),
            flags,
            self.local_seq,
            self.remote_seq,
            tcp.checksum
        );

        self.local_seq = self.local_seq.wrapping_add(1);
        link.send(&IpV4Packet::new(ip_header, segment), self.gateway)?;
        Ok(())
    }
}

impl Drop for VirtualTcpConnection {
    fn drop(&mut self) {
        if let Some(mut backing) = self.backing.take() {
            if let Err(e) = backing.close() {
                debug!("Backing stream close on drop failed: {}", e);
            }
        }
    }
}
