//! Wire shapes read and written at the tunnel boundary.
//!
//! Header marshalling is delegated to etherparse. Every decode here checks
//! lengths and reports truncation as an error instead of handing back a
//! partially filled structure.

use std::net::Ipv4Addr;

use etherparse::{IcmpEchoHeader, Icmpv4Header, Icmpv4Type, IpNumber, Ipv4Header};

use crate::error::{Result, TunnelError};

/// IP protocol numbers the dispatcher distinguishes.
pub mod protocol {
    pub const ICMP: u8 = 1;
    /// IPv4-in-IP; the next-header value ESP declares for a tunnelled IPv4 packet.
    pub const IPV4: u8 = 4;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const GRE: u8 = 47;
    pub const ESP: u8 = 50;
    pub const AH: u8 = 51;
    pub const VRRP: u8 = 112;
    pub const L2TP: u8 = 115;
    pub const MPLS_IN_IP: u8 = 137;
    pub const WESP: u8 = 141;

    /// Protocols that mean another VPN-like tunnel was nested inside ours.
    pub fn is_tunnel_like(protocol: u8) -> bool {
        matches!(
            protocol,
            AH | ESP | GRE | VRRP | L2TP | MPLS_IN_IP | WESP
        )
    }
}

/// Time-to-live for every packet this crate originates.
pub const DEFAULT_TTL: u8 = 64;

/// An IPv4 packet: header plus the payload bounded by the header's total length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpV4Packet {
    pub header: Ipv4Header,
    pub payload: Vec<u8>,
}

impl IpV4Packet {
    pub fn new(header: Ipv4Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, rest) =
            Ipv4Header::from_slice(bytes).map_err(|_| TunnelError::Malformed("IPv4 header"))?;

        let payload_len = usize::from(header.total_len)
            .checked_sub(header.header_len())
            .ok_or(TunnelError::Malformed("IPv4 total length"))?;
        if rest.len() < payload_len {
            return Err(TunnelError::Malformed("IPv4 payload truncated"));
        }

        Ok(Self {
            payload: rest[..payload_len].to_vec(),
            header,
        })
    }

    /// Serialize as-is. The header checksum is not recomputed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header.to_bytes();
        let mut out = Vec::with_capacity(header.len() + self.payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn protocol(&self) -> u8 {
        self.header.protocol.0
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.header.source)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.header.destination)
    }
}

/// Build the IPv4 header for a locally originated packet: TTL 64,
/// don't-fragment, the given packet id, checksum already written.
pub fn ipv4_header(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: IpNumber,
    payload_len: usize,
    packet_id: u16,
) -> Result<Ipv4Header> {
    let payload_len =
        u16::try_from(payload_len).map_err(|_| TunnelError::Malformed("oversized IPv4 payload"))?;
    let mut header = Ipv4Header::new(
        payload_len,
        DEFAULT_TTL,
        protocol,
        source.octets(),
        destination.octets(),
    )
    .map_err(|_| TunnelError::Malformed("oversized IPv4 payload"))?;

    header.identification = packet_id;
    header.dont_fragment = true;
    header.header_checksum = header.calc_header_checksum();
    Ok(header)
}

/// ESP datagram framing: `SPI | Sequence | payload | ICV`.
///
/// The payload is opaque here (IV and ciphertext); the ICV is checked by the
/// crypto context over the whole datagram and is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspPacket {
    pub spi: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl EspPacket {
    pub const HEADER_LEN: usize = 8;

    pub fn from_bytes(data: &[u8], icv_len: usize) -> Result<Self> {
        if data.len() < Self::HEADER_LEN + icv_len {
            return Err(TunnelError::Truncated(data.len()));
        }
        let spi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let payload = data[Self::HEADER_LEN..data.len() - icv_len].to_vec();
        Ok(Self {
            spi,
            sequence,
            payload,
        })
    }

    /// Serialize without the ICV; the caller appends it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.spi.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// The ICMP message carried by an IPv4 packet.
pub fn read_icmp(packet: &IpV4Packet) -> Result<(Icmpv4Header, &[u8])> {
    Icmpv4Header::from_slice(&packet.payload).map_err(|_| TunnelError::Malformed("ICMP header"))
}

/// Echo-Reply answering `request`: addresses swapped, identifier, sequence
/// and payload echoed, checksum computed over the reply with the checksum
/// field zeroed.
pub fn icmp_echo_reply(
    request: &IpV4Packet,
    echo: IcmpEchoHeader,
    data: &[u8],
    packet_id: u16,
) -> Result<IpV4Packet> {
    let icmp = Icmpv4Header::with_checksum(Icmpv4Type::EchoReply(echo), data);
    icmp_packet(request.destination(), request.source(), icmp, data, packet_id)
}

/// A bare Echo-Request (identifier 0, sequence 0, no data).
pub fn icmp_echo_request(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    packet_id: u16,
) -> Result<IpV4Packet> {
    let echo = IcmpEchoHeader { id: 0, seq: 0 };
    let icmp = Icmpv4Header::with_checksum(Icmpv4Type::EchoRequest(echo), &[]);
    icmp_packet(source, destination, icmp, &[], packet_id)
}

fn icmp_packet(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    icmp: Icmpv4Header,
    data: &[u8],
    packet_id: u16,
) -> Result<IpV4Packet> {
    let mut payload = Vec::with_capacity(icmp.header_len() + data.len());
    payload.extend_from_slice(&icmp.to_bytes());
    payload.extend_from_slice(data);

    let header = ipv4_header(source, destination, IpNumber::ICMP, payload.len(), packet_id)?;
    Ok(IpV4Packet::new(header, payload))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// RFC 1071 sum over `data`; a message with a correct checksum sums to 0xFFFF.
    pub(crate) fn ones_complement_sum(data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        for chunk in data.chunks(2) {
            let word = if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_be_bytes([chunk[0], 0])
            };
            sum += u32::from(word);
        }
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }

    fn ping(payload: &[u8]) -> IpV4Packet {
        let echo = IcmpEchoHeader { id: 0x1234, seq: 7 };
        let icmp = Icmpv4Header::with_checksum(Icmpv4Type::EchoRequest(echo), payload);
        let mut body = icmp.to_bytes().to_vec();
        body.extend_from_slice(payload);
        let header = ipv4_header(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(55, 55, 55, 55),
            IpNumber::ICMP,
            body.len(),
            99,
        )
        .unwrap();
        IpV4Packet::new(header, body)
    }

    #[test]
    fn ipv4_packet_survives_serialization() {
        let packet = ping(b"abcdefgh");
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 20 + 8 + 8);
        assert_eq!(IpV4Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn ipv4_trailing_bytes_are_ignored() {
        let packet = ping(b"xy");
        let mut bytes = packet.to_bytes();
        bytes.extend_from_slice(&[0, 0, 0]);
        assert_eq!(IpV4Packet::from_bytes(&bytes).unwrap().payload, packet.payload);
    }

    #[test]
    fn truncated_ipv4_is_malformed() {
        let bytes = ping(b"abcdefgh").to_bytes();
        assert!(matches!(
            IpV4Packet::from_bytes(&bytes[..bytes.len() - 1]),
            Err(TunnelError::Malformed(_))
        ));
        assert!(matches!(
            IpV4Packet::from_bytes(&bytes[..10]),
            Err(TunnelError::Malformed(_))
        ));
    }

    #[test]
    fn generated_header_has_valid_checksum() {
        let header = ipv4_header(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            IpNumber::TCP,
            40,
            0x4242,
        )
        .unwrap();
        assert_eq!(header.time_to_live, DEFAULT_TTL);
        assert!(header.dont_fragment);
        assert_eq!(header.identification, 0x4242);
        assert_eq!(ones_complement_sum(&header.to_bytes()), 0xFFFF);
    }

    #[test]
    fn echo_reply_swaps_roles_and_checksums() {
        let request = ping(b"ping-data");
        let (icmp, data) = read_icmp(&request).unwrap();
        let Icmpv4Type::EchoRequest(echo) = icmp.icmp_type else {
            panic!("expected echo request");
        };

        let reply = icmp_echo_reply(&request, echo, data, 7).unwrap();
        assert_eq!(reply.source(), request.destination());
        assert_eq!(reply.destination(), request.source());
        assert_eq!(reply.protocol(), protocol::ICMP);

        // type 0 (echo reply), code 0
        assert_eq!(reply.payload[0], 0);
        assert_eq!(reply.payload[1], 0);
        assert_eq!(&reply.payload[4..8], &[0x12, 0x34, 0x00, 0x07]);
        assert_eq!(&reply.payload[8..], b"ping-data");
        assert_eq!(ones_complement_sum(&reply.payload), 0xFFFF);
    }

    #[test]
    fn esp_framing_splits_header_and_icv() {
        let esp = EspPacket {
            spi: 0xCAFE_BABE,
            sequence: 3,
            payload: vec![1, 2, 3, 4],
        };
        let mut bytes = esp.to_bytes();
        assert_eq!(&bytes[..8], &[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 3]);
        bytes.extend_from_slice(&[0xEE; 16]);

        assert_eq!(EspPacket::from_bytes(&bytes, 16).unwrap(), esp);
        assert!(matches!(
            EspPacket::from_bytes(&bytes[..20], 16),
            Err(TunnelError::Truncated(20))
        ));
    }

    #[test]
    fn tunnel_like_protocols() {
        assert!(protocol::is_tunnel_like(protocol::GRE));
        assert!(protocol::is_tunnel_like(protocol::WESP));
        assert!(!protocol::is_tunnel_like(protocol::UDP));
        assert!(!protocol::is_tunnel_like(protocol::TCP));
    }
}
