//! One ESP security association terminated in user space.
//!
//! A [`TunnelSession`] owns the per-direction crypto contexts and sequence
//! counters of a child SA, decapsulates inbound datagrams, answers ICMP
//! echo statelessly and hands TCP to emulated connections kept in a
//! [`SessionTable`]. It is shared between the dispatcher thread and the
//! event-pump ticker, so all mutable state sits behind `parking_lot` locks.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use etherparse::Icmpv4Type;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TunnelSettings;
use crate::crypto::EspCrypto;
use crate::error::{Result, TcpError, TunnelError};
use crate::packet::{self, protocol, EspPacket, IpV4Packet};
use crate::selector::TrafficSelector;
use crate::session_table::{FlowKey, SessionTable};
use crate::tcp::{Disposition, TcpState, TunnelLink, VirtualTcpConnection};
use crate::transport::{BackingConnector, LoopbackConnector, Transport};

/// Single-byte NAT-T keep-alive probe (RFC 3948).
pub const KEEP_ALIVE_PROBE: [u8; 1] = [0xFF];

pub type SharedConnection = Arc<Mutex<VirtualTcpConnection>>;

/// Keys and SPIs for one child SA, as produced by IKE negotiation.
pub struct SaParams {
    pub spi_in: u32,
    pub spi_out: u32,
    pub crypto_in: Box<dyn EspCrypto>,
    pub crypto_out: Box<dyn EspCrypto>,
}

struct KeepAliveTimer {
    interval: Duration,
    last: Instant,
}

impl KeepAliveTimer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    fn expired(&self) -> bool {
        self.last.elapsed() >= self.interval
    }

    fn reset(&mut self) {
        self.last = Instant::now();
    }
}

/// ESP tunnel state for one child SA.
pub struct TunnelSession {
    spi_in: u32,
    spi_out: u32,
    gateway: Ipv4Addr,
    crypto_in: Box<dyn EspCrypto>,
    crypto_out: Box<dyn EspCrypto>,
    /// Lowest inbound sequence still acceptable. Past `u32::MAX` once the
    /// last sequence number has been used.
    seq_in: Mutex<u64>,
    /// Last outbound sequence used.
    seq_out: Mutex<u32>,
    transport: Option<Arc<dyn Transport>>,
    connector: Arc<dyn BackingConnector>,
    settings: TunnelSettings,
    traffic_select: Option<Vec<TrafficSelector>>,
    initiator: bool,
    keep_alive: Mutex<KeepAliveTimer>,
    sessions: SessionTable<FlowKey, SharedConnection>,
    rng: Mutex<StdRng>,
    /// Held for the duration of one event-pump tick.
    pump: Mutex<()>,
    captures: AtomicU64,
}

impl TunnelSession {
    pub fn new(gateway: Ipv4Addr, sa: SaParams, transport: Option<Arc<dyn Transport>>) -> Self {
        let settings = TunnelSettings::default();
        Self {
            spi_in: sa.spi_in,
            spi_out: sa.spi_out,
            gateway,
            crypto_in: sa.crypto_in,
            crypto_out: sa.crypto_out,
            seq_in: Mutex::new(1),
            seq_out: Mutex::new(0),
            transport,
            connector: Arc::new(LoopbackConnector::new(settings.web_app_port)),
            keep_alive: Mutex::new(KeepAliveTimer::new(settings.keep_alive_interval)),
            settings,
            traffic_select: None,
            initiator: false,
            sessions: SessionTable::new(),
            rng: Mutex::new(StdRng::from_entropy()),
            pump: Mutex::new(()),
            captures: AtomicU64::new(0),
        }
    }

    /// Replace the settings. The backing connector follows the new web-app
    /// port unless one was set explicitly afterwards.
    pub fn with_settings(mut self, settings: TunnelSettings) -> Self {
        self.connector = Arc::new(LoopbackConnector::new(settings.web_app_port));
        self.keep_alive = Mutex::new(KeepAliveTimer::new(settings.keep_alive_interval));
        self.settings = settings;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn BackingConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_traffic_selectors(mut self, selectors: Vec<TrafficSelector>) -> Self {
        self.traffic_select = Some(selectors);
        self
    }

    /// Mark this side as the IKE initiator; only initiators send keep-alives.
    pub fn initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn spi_in(&self) -> u32 {
        self.spi_in
    }

    pub fn spi_out(&self) -> u32 {
        self.spi_out
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn gateway_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.gateway.into(), self.settings.nat_t_port)
    }

    pub fn sessions(&self) -> &SessionTable<FlowKey, SharedConnection> {
        &self.sessions
    }

    /// Wrap an IPv4 packet as an ESP datagram. The IPv4 checksum must
    /// already be written.
    pub fn encapsulate(&self, packet: &IpV4Packet) -> Result<Vec<u8>> {
        let plain = packet.to_bytes();
        trace!("ESP out: {} plaintext bytes", plain.len());
        self.capture(&plain, "out");
        let encrypted = self.crypto_out.encrypt(&plain, protocol::IPV4)?;

        let sequence = {
            let mut seq_out = self.seq_out.lock();
            *seq_out = seq_out.wrapping_add(1);
            *seq_out
        };
        let mut message = EspPacket {
            spi: self.spi_out,
            sequence,
            payload: encrypted,
        }
        .to_bytes();
        self.crypto_out.append_checksum(&mut message);
        Ok(message)
    }

    /// Validate and decrypt an inbound ESP datagram.
    pub fn decapsulate(&self, data: &[u8]) -> Result<IpV4Packet> {
        if data.len() < EspPacket::HEADER_LEN {
            return Err(TunnelError::Truncated(data.len()));
        }
        let esp = EspPacket::from_bytes(data, self.crypto_in.checksum_len())?;

        if esp.spi != self.spi_in {
            return Err(TunnelError::SpiMismatch {
                expected: self.spi_in,
                actual: esp.spi,
            });
        }

        let mut seq_in = self.seq_in.lock();
        if u64::from(esp.sequence) < *seq_in {
            return Err(TunnelError::StaleSequence {
                expected: *seq_in,
                actual: esp.sequence,
            });
        }

        if !self.crypto_in.verify_checksum(data) {
            if self.crypto_out.verify_checksum(data) {
                error!(
                    "ESP checksum for SPI {:08x} verifies with the outbound key. Crypto settings are reversed",
                    self.spi_in
                );
            }
            return Err(TunnelError::ChecksumFailure);
        }

        let (plain, declared) = self.crypto_in.decrypt(&esp.payload)?;
        if declared != protocol::IPV4 {
            return Err(TunnelError::UnsupportedPayload(declared));
        }
        trace!("ESP in: {} plaintext bytes", plain.len());
        self.capture(&plain, "in");

        let packet = IpV4Packet::from_bytes(&plain)?;
        *seq_in = u64::from(esp.sequence) + 1;
        if esp.sequence == u32::MAX {
            warn!(
                "Inbound sequence space of SPI {:08x} exhausted. The SA must be rekeyed",
                self.spi_in
            );
        }
        Ok(packet)
    }

    /// Decapsulate and dispatch one datagram received from `sender`.
    /// Failures of the inner protocol handlers are logged, not returned.
    pub fn handle_datagram(&self, data: &[u8], sender: SocketAddr) -> Result<()> {
        debug!("ESP datagram: {} bytes from {}", data.len(), sender);
        let packet = self.decapsulate(data)?;
        self.dispatch(&packet, sender);
        Ok(())
    }

    /// Route a decapsulated packet by its inner protocol.
    pub fn dispatch(&self, packet: &IpV4Packet, sender: SocketAddr) {
        match packet.protocol() {
            protocol::ICMP => {
                if let Err(e) = self.handle_icmp(packet, sender) {
                    error!("Error in ICMP path: {}", e);
                }
            }
            protocol::TCP => self.handle_tcp(packet, sender),
            protocol::UDP => info!("UDP packet tunnelled in from {}. Not responding", sender),
            p if protocol::is_tunnel_like(p) => error!(
                "Another VPN-like protocol ({}) was tunnelled through this link. This is likely a misconfiguration",
                p
            ),
            p => warn!("Unsupported protocol delivered ({})", p),
        }
    }

    fn handle_icmp(&self, packet: &IpV4Packet, sender: SocketAddr) -> Result<()> {
        let (icmp, data) = packet::read_icmp(packet)?;
        match icmp.icmp_type {
            Icmpv4Type::EchoRequest(echo) => {
                info!("Ping from {} via {}. Replying", packet.source(), sender);
                let reply = packet::icmp_echo_reply(packet, echo, data, self.packet_id())?;
                self.send(&reply, sender)
            }
            Icmpv4Type::EchoReply(_) => {
                info!("ICMP ping reply from {} via {}", packet.source(), sender);
                Ok(())
            }
            other => {
                debug!("Unsupported ICMP message {:?}. Not replying", other);
                Ok(())
            }
        }
    }

    fn handle_tcp(&self, packet: &IpV4Packet, sender: SocketAddr) {
        let Some(key) = FlowKey::from_packet(packet) else {
            info!("Invalid TCP/IP request: segment did not parse");
            return;
        };
        if !key.is_valid() {
            info!("Invalid TCP/IP request: address or port not recognised");
            return;
        }

        if let Some(conn) = self.sessions.live(&key) {
            let result = {
                let mut conn = conn.lock();
                if conn.gateway().ip() != sender.ip() {
                    warn!(
                        "Crossed connection in TCP? Expected gateway {}, got {}. Not replying",
                        conn.gateway().ip(),
                        sender.ip()
                    );
                    return;
                }
                conn.accept(packet, self)
            };
            self.settle(&key, result);
            return;
        }

        let seed = self.rng.lock().gen();
        let mut conn = VirtualTcpConnection::new(
            key,
            sender,
            self.connector.clone(),
            self.settings.relay_buffer_size,
            StdRng::seed_from_u64(seed),
        );
        match conn.start(packet, self) {
            Ok(Disposition::Continue) => {
                self.sessions.insert_live(key, Arc::new(Mutex::new(conn)));
            }
            Ok(Disposition::EndSession) => {
                if let Err(e) = conn.close() {
                    warn!("Failed to release TCP session {:?}: {}", key, e);
                }
            }
            Err(e) => self.log_tcp_error(&key, &e),
        }
    }

    /// Act on a connection handler's outcome once its lock is released.
    fn settle(&self, key: &FlowKey, result: std::result::Result<Disposition, TcpError>) {
        match result {
            Ok(Disposition::Continue) => {}
            Ok(Disposition::EndSession) => self.end_session(key),
            Err(e) => {
                self.log_tcp_error(key, &e);
                self.terminate_connection(key);
            }
        }
    }

    fn log_tcp_error(&self, key: &FlowKey, e: &TcpError) {
        if e.is_invariant_violation() {
            error!("Session table fault for {:?}: {}", key, e);
        } else if e.is_fatal() {
            debug!("TCP session {:?} rejected: {}", key, e);
        } else {
            warn!("TCP session {:?} failed: {}", key, e);
        }
    }

    /// Upward notification from a connection that wants to be torn down.
    pub fn end_session(&self, key: &FlowKey) {
        debug!("End of session requested for {:?}", key);
        self.terminate_connection(key);
    }

    /// Remove the flow from both tables and release its resources.
    /// Repeated calls are no-ops.
    pub fn terminate_connection(&self, key: &FlowKey) {
        let (live, parked) = self.sessions.remove(key);
        for conn in live.into_iter().chain(parked) {
            if let Err(e) = conn.lock().close() {
                error!("Failed to close TCP session {:?}: {}", key, e);
            }
        }
    }

    /// Stop routing new traffic for `key` to its connection, but keep
    /// pumping it until it finishes shutting down.
    pub fn release_connection(&self, key: &FlowKey) {
        if self.sessions.park(key) {
            debug!("Parked TCP session {:?}", key);
        }
    }

    /// Drive timed work. Returns true if any action was taken.
    pub fn event_pump(&self) -> bool {
        let Some(_tick) = self.pump.try_lock() else {
            return false;
        };
        let mut acted = false;

        if self.initiator {
            let mut keep_alive = self.keep_alive.lock();
            if keep_alive.expired() {
                keep_alive.reset();
                drop(keep_alive);
                self.send_keep_alive();
                acted = true;
            }
        }

        for key in self.sessions.live_keys() {
            let Some(conn) = self.sessions.live(&key) else {
                continue;
            };
            let outcome = {
                let mut conn = conn.lock();
                let idle = conn.idle_time();
                if idle > self.settings.tcp_timeout {
                    debug!(
                        "Old session: idle {:?}; remote={}, local={}. Closing",
                        idle,
                        conn.remote_endpoint(),
                        conn.local_endpoint()
                    );
                    None
                } else if conn.state() == TcpState::Closed {
                    debug!(
                        "Old session closed: {} -> {}",
                        conn.remote_endpoint(),
                        conn.local_endpoint()
                    );
                    None
                } else {
                    Some(conn.event_pump(self))
                }
            };
            match outcome {
                None => {
                    self.terminate_connection(&key);
                    acted = true;
                }
                Some(Ok(pumped)) => acted |= pumped,
                Some(Err(e)) => {
                    self.log_tcp_error(&key, &e);
                    self.terminate_connection(&key);
                    acted = true;
                }
            }
        }

        for key in self.sessions.parked_keys() {
            let Some(conn) = self.sessions.parked(&key) else {
                continue;
            };
            let mut conn = conn.lock();
            if conn.state() == TcpState::Closed {
                drop(conn);
                self.sessions.remove_parked(&key);
            } else if let Err(e) = conn.event_pump(self) {
                warn!("Parked TCP session {:?} failed: {}", key, e);
                if let Err(e) = conn.close() {
                    debug!("Failed to close parked session {:?}: {}", key, e);
                }
            }
        }

        acted
    }

    fn send_keep_alive(&self) {
        let to = self.gateway_endpoint();
        debug!("Sending keep-alive to {}", to);
        let Some(transport) = &self.transport else {
            return;
        };
        if let Err(e) = transport.send_raw(&KEEP_ALIVE_PROBE, to) {
            warn!("Keep-alive to {} failed: {}", to, e);
        }
    }

    /// Whether any traffic selector declared by the peer covers `target`.
    pub fn contains_ip(&self, target: Ipv4Addr) -> bool {
        let Some(selectors) = &self.traffic_select else {
            debug!("Child SA has no traffic select");
            return false;
        };
        if selectors.is_empty() {
            debug!("Child SA was provided a traffic select, but it is empty");
            return false;
        }
        selectors.iter().any(|selector| {
            let found = selector.contains(target);
            trace!("    {} in {}: {}", target, selector, found);
            found
        })
    }

    /// Send one ICMP echo request from `source` to `target` through the tunnel.
    pub fn send_ping(&self, source: Ipv4Addr, target: Ipv4Addr) -> Result<()> {
        let ping = packet::icmp_echo_request(source, target, self.packet_id())?;
        info!("Sending ping {} -> {}", source, target);
        self.send(&ping, self.gateway_endpoint())
    }

    /// Encapsulate `packet` and send it to `to`.
    pub fn send(&self, packet: &IpV4Packet, to: SocketAddr) -> Result<()> {
        let message = self.encapsulate(packet)?;
        match &self.transport {
            Some(transport) => {
                transport.send_raw(&message, to)?;
                Ok(())
            }
            None => {
                warn!("Can't send to {}, this child SA has no transport", to);
                Ok(())
            }
        }
    }

    /// Number of packets dumped so far with `capture_traffic` enabled.
    pub fn captured(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    fn capture(&self, plain: &[u8], direction: &str) {
        if !self.settings.capture_traffic {
            return;
        }
        let n = self.captures.fetch_add(1, Ordering::Relaxed);
        trace!(
            "ipv4_{}_{} spi={:08x} ({} bytes): {:02x?}",
            n,
            direction,
            self.spi_in,
            plain.len(),
            plain
        );
    }

    fn packet_id(&self) -> u16 {
        self.rng.lock().gen()
    }
}

impl TunnelLink for TunnelSession {
    fn send(&self, packet: &IpV4Packet, gateway: SocketAddr) -> std::result::Result<(), TunnelError> {
        TunnelSession::send(self, packet, gateway)
    }
}
