use std::net::IpAddr;

use chrono::{DateTime, Utc};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use serde::{Deserialize, Serialize};

// TCP flag bits
const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;
const URG: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    fn from_next_header(proto: IpNextHeaderProtocol) -> Self {
        match proto {
            IpNextHeaderProtocols::Tcp => Protocol::Tcp,
            IpNextHeaderProtocols::Udp => Protocol::Udp,
            IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => Protocol::Icmp,
            other => Protocol::Other(other.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_bits(flags: u8) -> Self {
        Self {
            syn: flags & SYN != 0,
            ack: flags & ACK != 0,
            fin: flags & FIN != 0,
            rst: flags & RST != 0,
            psh: flags & PSH != 0,
            urg: flags & URG != 0,
        }
    }

    pub fn syn_only() -> Self {
        Self::from_bits(SYN)
    }
}

/// One captured packet, reduced to what feature extraction needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub length: usize,
    pub protocol: Protocol,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<TcpFlags>,
}

impl PacketRecord {
    pub fn tcp(
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        length: usize,
        flags: TcpFlags,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            length,
            protocol: Protocol::Tcp,
            src_ip: Some(src),
            dst_ip: Some(dst),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            tcp_flags: Some(flags),
        }
    }

    pub fn udp(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, length: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            length,
            protocol: Protocol::Udp,
            src_ip: Some(src),
            dst_ip: Some(dst),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            tcp_flags: None,
        }
    }

    pub fn icmp(src: IpAddr, dst: IpAddr, length: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            length,
            protocol: Protocol::Icmp,
            src_ip: Some(src),
            dst_ip: Some(dst),
            src_port: None,
            dst_port: None,
            tcp_flags: None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }
}

/// Decode an Ethernet frame. Returns `None` for frames that carry no IP packet.
pub fn parse_frame(frame: &[u8]) -> Option<PacketRecord> {
    let ethernet = EthernetPacket::new(frame)?;
    let timestamp = Utc::now();

    let (src_ip, dst_ip, next_header, payload): (IpAddr, IpAddr, IpNextHeaderProtocol, Vec<u8>) =
        match ethernet.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ipv4 = Ipv4Packet::new(ethernet.payload())?;
                (
                    IpAddr::V4(ipv4.get_source()),
                    IpAddr::V4(ipv4.get_destination()),
                    ipv4.get_next_level_protocol(),
                    ipv4.payload().to_vec(),
                )
            }
            EtherTypes::Ipv6 => {
                let ipv6 = Ipv6Packet::new(ethernet.payload())?;
                (
                    IpAddr::V6(ipv6.get_source()),
                    IpAddr::V6(ipv6.get_destination()),
                    ipv6.get_next_header(),
                    ipv6.payload().to_vec(),
                )
            }
            _ => return None,
        };

    let protocol = Protocol::from_next_header(next_header);
    let mut record = PacketRecord {
        timestamp,
        length: frame.len(),
        protocol,
        src_ip: Some(src_ip),
        dst_ip: Some(dst_ip),
        src_port: None,
        dst_port: None,
        tcp_flags: None,
    };

    match protocol {
        Protocol::Tcp => {
            if let Some(tcp) = TcpPacket::new(&payload) {
                record.src_port = Some(tcp.get_source());
                record.dst_port = Some(tcp.get_destination());
                record.tcp_flags = Some(TcpFlags::from_bits(tcp.get_flags()));
            }
        }
        Protocol::Udp => {
            if let Some(udp) = UdpPacket::new(&payload) {
                record.src_port = Some(udp.get_source());
                record.dst_port = Some(udp.get_destination());
            }
        }
        _ => {}
    }

    Some(record)
}
