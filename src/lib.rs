//! ESP tunnel termination core for a user-space IPsec gateway.
//!
//! Decrypts IPv4 packets arriving inside ESP datagrams, answers ICMP echo,
//! and emulates the responding side of TCP for addresses that only exist
//! inside the tunnel, relaying each flow to a local byte stream.
//! Key exchange happens elsewhere; this crate starts from negotiated SPIs
//! and keys.

pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod packet;
pub mod selector;
pub mod session_table;
pub mod tcp;
pub mod transport;
pub mod tunnel;

pub use config::TunnelSettings;
pub use crypto::{AesCbcHmacSha256, EspCrypto};
pub use error::{TcpError, TunnelError};
pub use gateway::{EspGateway, EventPumpHandle};
pub use packet::{EspPacket, IpV4Packet};
pub use selector::TrafficSelector;
pub use session_table::{FlowKey, SessionTable};
pub use tcp::{Disposition, TcpState, TunnelLink, VirtualTcpConnection};
pub use transport::{BackingConnector, BackingStream, LoopbackConnector, Transport};
pub use tunnel::{SaParams, TunnelSession};

use once_cell::sync::OnceCell;
use std::panic;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the platform log backend (Android only; elsewhere the host
/// process owns the `log` backend) and route panics to `log::error!`.
pub fn init_logging() {
    INIT.get_or_init(|| {
        #[cfg(target_os = "android")]
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Debug)
                .with_tag("espvpn-core"),
        );

        panic::set_hook(Box::new(|panic_info| {
            let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            let location = if let Some(loc) = panic_info.location() {
                format!("{}:{}:{}", loc.file(), loc.line(), loc.column())
            } else {
                "unknown location".to_string()
            };

            log::error!("RUST PANIC: {} at {}", msg, location);
        }));

        log::info!("ESP tunnel core initialized");
    });
}
