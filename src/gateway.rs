//! NAT-T port (4500) front end: routes ESP datagrams to their tunnel by SPI
//! and runs the dispatcher and event-pump threads.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Result, TunnelError};
use crate::packet::EspPacket;
use crate::transport::Transport;
use crate::tunnel::{TunnelSession, KEEP_ALIVE_PROBE};

/// Four zero bytes in place of an SPI mark an IKE message on port 4500.
const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// Largest datagram the dispatcher reads.
const MAX_DATAGRAM: usize = 65_535;

/// Tunnels served from one UDP endpoint, keyed by inbound SPI.
pub struct EspGateway {
    transport: Arc<dyn Transport>,
    tunnels: Mutex<HashMap<u32, Arc<TunnelSession>>>,
}

impl EspGateway {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Install a tunnel once its SA is negotiated. Replaces any tunnel
    /// already registered under the same inbound SPI.
    pub fn add_tunnel(&self, tunnel: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        info!(
            "Child SA up: in={:08x} out={:08x} gateway={}",
            tunnel.spi_in(),
            tunnel.spi_out(),
            tunnel.gateway()
        );
        self.tunnels.lock().insert(tunnel.spi_in(), tunnel)
    }

    /// Remove a tunnel when its SA is torn down or expires.
    pub fn remove_tunnel(&self, spi_in: u32) -> Option<Arc<TunnelSession>> {
        let removed = self.tunnels.lock().remove(&spi_in)?;
        for key in removed.sessions().live_keys() {
            removed.terminate_connection(&key);
        }
        for key in removed.sessions().parked_keys() {
            removed.terminate_connection(&key);
        }
        info!("Child SA down: in={:08x}", spi_in);
        Some(removed)
    }

    pub fn tunnel(&self, spi_in: u32) -> Option<Arc<TunnelSession>> {
        self.tunnels.lock().get(&spi_in).cloned()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Handle one datagram received on the NAT-T port.
    pub fn handle_datagram(&self, data: &[u8], sender: SocketAddr) -> Result<()> {
        if data.len() < 4 && data.first() == Some(&KEEP_ALIVE_PROBE[0]) {
            debug!("Keep-alive from {}. Sending pong", sender);
            self.transport.send_raw(data, sender)?;
            return Ok(());
        }

        if data.len() >= 4 && data[..4] == NON_ESP_MARKER {
            debug!("Non-ESP marker from {}; IKE traffic is not handled here", sender);
            return Ok(());
        }

        if data.len() < EspPacket::HEADER_LEN {
            return Err(TunnelError::Truncated(data.len()));
        }

        let spi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let Some(tunnel) = self.tunnel(spi) else {
            debug!("Unknown session {:08x} from {}. Not replying", spi, sender);
            return Ok(());
        };
        tunnel.handle_datagram(data, sender)
    }

    /// Pump every tunnel once. Returns true if any acted.
    pub fn event_pump(&self) -> bool {
        let tunnels: Vec<_> = self.tunnels.lock().values().cloned().collect();
        let mut acted = false;
        for tunnel in tunnels {
            acted |= tunnel.event_pump();
        }
        acted
    }

    /// Dispatcher loop: process each datagram to completion until `stop`
    /// is raised. The socket's read timeout bounds how long a stop takes.
    pub fn run(&self, socket: &UdpSocket, stop: &AtomicBool) -> io::Result<()> {
        if socket.read_timeout()?.is_none() {
            socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        }
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        while !stop.load(Ordering::Relaxed) {
            let (len, sender) = match socket.recv_from(&mut buffer) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = self.handle_datagram(&buffer[..len], sender) {
                log_dropped(&e, sender);
            }
        }
        Ok(())
    }

    /// Start the periodic ticker thread, idling `interval` (normally
    /// [`TunnelSettings::event_pump_interval`]) between ticks that did
    /// nothing. Ticks stop when the returned handle is stopped or dropped.
    ///
    /// [`TunnelSettings::event_pump_interval`]: crate::config::TunnelSettings
    pub fn spawn_event_pump(self: &Arc<Self>, interval: Duration) -> io::Result<EventPumpHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let gateway = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("esp-event-pump".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    if !gateway.event_pump() {
                        thread::sleep(interval);
                    }
                }
                debug!("Event pump stopped");
            })?;
        Ok(EventPumpHandle {
            stop,
            thread: Some(thread),
        })
    }
}

fn log_dropped(e: &TunnelError, sender: SocketAddr) {
    match e {
        TunnelError::StaleSequence { .. } => {
            debug!("Dropped datagram from {}: {}", sender, e)
        }
        _ => warn!("Dropped datagram from {}: {}", sender, e),
    }
}

/// Owner of the event-pump ticker thread.
pub struct EventPumpHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPumpHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Event pump thread panicked");
            }
        }
    }
}

impl Drop for EventPumpHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
