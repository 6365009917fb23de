//! Structural decode of captured frames for console display.
//!
//! Walks the layers pnet can parse and reports the innermost protocol name,
//! a one-line summary and a per-layer field dump. Anything deeper than the
//! transport layer is left as opaque payload.

use pnet::packet::arp::ArpPacket;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::error::CaptureError;

/// Result of decoding one captured frame.
#[derive(Debug)]
pub struct DecodedPacket {
    /// Innermost decoded protocol name.
    pub protocol: &'static str,
    /// One-line rendering of the interesting addresses and ports.
    pub summary: String,
    /// Per-layer field dump, one line per entry.
    pub fields: Vec<String>,
}

/// Decode a raw link-layer frame. Fails on frames too short to carry the
/// headers their type fields promise.
pub fn decode(data: &[u8]) -> Result<DecodedPacket, CaptureError> {
    let eth = EthernetPacket::new(data)
        .ok_or_else(|| CaptureError::Decode("truncated ethernet frame".into()))?;

    let mut fields = vec![format!(
        "Ethernet  dst={} src={} type={:#06x}",
        eth.get_destination(),
        eth.get_source(),
        eth.get_ethertype().0
    )];

    match eth.get_ethertype() {
        EtherTypes::Ipv4 => decode_ipv4(eth.payload(), fields),
        EtherTypes::Ipv6 => decode_ipv6(eth.payload(), fields),
        EtherTypes::Arp => decode_arp(eth.payload(), fields),
        other => Ok(DecodedPacket {
            protocol: "Ethernet",
            summary: format!(
                "Ethernet {} > {} type={:#06x}",
                eth.get_source(),
                eth.get_destination(),
                other.0
            ),
            fields,
        }),
    }
}

fn decode_ipv4(data: &[u8], mut fields: Vec<String>) -> Result<DecodedPacket, CaptureError> {
    let ip = Ipv4Packet::new(data)
        .ok_or_else(|| CaptureError::Decode("truncated IPv4 header".into()))?;

    fields.push(format!(
        "IPv4      src={} dst={} ttl={} proto={}",
        ip.get_source(),
        ip.get_destination(),
        ip.get_ttl(),
        ip.get_next_level_protocol().0
    ));

    decode_transport(
        ip.get_next_level_protocol(),
        ip.payload(),
        &ip.get_source().to_string(),
        &ip.get_destination().to_string(),
        "IPv4",
        fields,
    )
}

fn decode_ipv6(data: &[u8], mut fields: Vec<String>) -> Result<DecodedPacket, CaptureError> {
    let ip = Ipv6Packet::new(data)
        .ok_or_else(|| CaptureError::Decode("truncated IPv6 header".into()))?;

    fields.push(format!(
        "IPv6      src={} dst={} hlim={} next={}",
        ip.get_source(),
        ip.get_destination(),
        ip.get_hop_limit(),
        ip.get_next_header().0
    ));

    decode_transport(
        ip.get_next_header(),
        ip.payload(),
        &ip.get_source().to_string(),
        &ip.get_destination().to_string(),
        "IPv6",
        fields,
    )
}

fn decode_arp(data: &[u8], mut fields: Vec<String>) -> Result<DecodedPacket, CaptureError> {
    let arp =
        ArpPacket::new(data).ok_or_else(|| CaptureError::Decode("truncated ARP packet".into()))?;

    fields.push(format!(
        "ARP       op={} sender={} target={}",
        arp.get_operation().0,
        arp.get_sender_proto_addr(),
        arp.get_target_proto_addr()
    ));

    Ok(DecodedPacket {
        protocol: "ARP",
        summary: format!(
            "ARP who-has {} tell {}",
            arp.get_target_proto_addr(),
            arp.get_sender_proto_addr()
        ),
        fields,
    })
}

fn decode_transport(
    proto: IpNextHeaderProtocol,
    data: &[u8],
    src: &str,
    dst: &str,
    net_name: &'static str,
    mut fields: Vec<String>,
) -> Result<DecodedPacket, CaptureError> {
    match proto {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(data)
                .ok_or_else(|| CaptureError::Decode("truncated TCP header".into()))?;
            fields.push(format!(
                "TCP       sport={} dport={} seq={} ack={} flags={:#04x}",
                tcp.get_source(),
                tcp.get_destination(),
                tcp.get_sequence(),
                tcp.get_acknowledgement(),
                tcp.get_flags()
            ));
            push_payload(&mut fields, tcp.payload());

            Ok(DecodedPacket {
                protocol: "TCP",
                summary: format!(
                    "TCP {}:{} > {}:{} flags={:#04x} len={}",
                    src,
                    tcp.get_source(),
                    dst,
                    tcp.get_destination(),
                    tcp.get_flags(),
                    tcp.payload().len()
                ),
                fields,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(data)
                .ok_or_else(|| CaptureError::Decode("truncated UDP header".into()))?;
            fields.push(format!(
                "UDP       sport={} dport={} len={}",
                udp.get_source(),
                udp.get_destination(),
                udp.get_length()
            ));
            push_payload(&mut fields, udp.payload());

            Ok(DecodedPacket {
                protocol: "UDP",
                summary: format!(
                    "UDP {}:{} > {}:{} len={}",
                    src,
                    udp.get_source(),
                    dst,
                    udp.get_destination(),
                    udp.payload().len()
                ),
                fields,
            })
        }
        IpNextHeaderProtocols::Icmp => {
            let icmp = IcmpPacket::new(data)
                .ok_or_else(|| CaptureError::Decode("truncated ICMP packet".into()))?;
            fields.push(format!(
                "ICMP      type={} code={}",
                icmp.get_icmp_type().0,
                icmp.get_icmp_code().0
            ));

            Ok(DecodedPacket {
                protocol: "ICMP",
                summary: format!(
                    "ICMP {} > {} type={}",
                    src,
                    dst,
                    icmp.get_icmp_type().0
                ),
                fields,
            })
        }
        other => Ok(DecodedPacket {
            protocol: net_name,
            summary: format!("{net_name} {src} > {dst} proto={}", other.0),
            fields,
        }),
    }
}

fn push_payload(fields: &mut Vec<String>, payload: &[u8]) {
    if !payload.is_empty() {
        fields.push(format!("Payload   {} bytes", payload.len()));
    }
}
