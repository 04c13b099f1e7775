// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use super::options::{Dhcp4Options, DHO_MESSAGE_TYPE, DHO_OPTION_OVERLOAD};
use crate::{
    buffer::{Buffer, BufferMut},
    iface::BROADCAST_MAC_ADDRESS,
    DhcpError, ErrorContext, ErrorKind,
};

pub(crate) const CLIENT_PORT: u16 = 68;
pub(crate) const SERVER_PORT: u16 = 67;

const DEFAULT_TTL: u8 = 128;

pub(crate) const BOOTREQUEST: u8 = 1;
pub(crate) const BOOTREPLY: u8 = 2;

/// Minimum length of a BOOTP datagram; shorter transmissions are padded.
pub(crate) const BOOTP_MIN_LEN: usize = 300;

/// BROADCAST bit in the BOOTP flags field.
pub(crate) const BOOTP_BROADCAST: u16 = 0x8000;

const MAX_CHADDR_LEN: usize = 16;
const MAX_SNAME_LEN: usize = 64;
const MAX_FILE_LEN: usize = 128;

const DHCP_MAGIC_COOKIE: [u8; 4] = [99u8, 130, 83, 99];

// Option overload destinations, RFC 2132 9.3.
const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum Dhcp4MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl std::fmt::Display for Dhcp4MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DHCPDISCOVER"),
            Self::Offer => write!(f, "DHCPOFFER"),
            Self::Request => write!(f, "DHCPREQUEST"),
            Self::Decline => write!(f, "DHCPDECLINE"),
            Self::Ack => write!(f, "DHCPACK"),
            Self::Nak => write!(f, "DHCPNAK"),
            Self::Release => write!(f, "DHCPRELEASE"),
            Self::Inform => write!(f, "DHCPINFORM"),
        }
    }
}

impl std::convert::TryFrom<u8> for Dhcp4MessageType {
    type Error = DhcpError;

    fn try_from(d: u8) -> Result<Self, DhcpError> {
        match d {
            d if d == Self::Discover as u8 => Ok(Self::Discover),
            d if d == Self::Offer as u8 => Ok(Self::Offer),
            d if d == Self::Request as u8 => Ok(Self::Request),
            d if d == Self::Decline as u8 => Ok(Self::Decline),
            d if d == Self::Ack as u8 => Ok(Self::Ack),
            d if d == Self::Nak as u8 => Ok(Self::Nak),
            d if d == Self::Release as u8 => Ok(Self::Release),
            d if d == Self::Inform as u8 => Ok(Self::Inform),
            _ => Err(DhcpError::new(
                ErrorKind::NotSupported,
                format!("DHCPv4 message type {d} is not supported"),
            )),
        }
    }
}

/// A BOOTP/DHCP datagram: the fixed header plus parsed options.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Dhcp4Packet {
    /// BOOTREQUEST or BOOTREPLY.
    pub op: u8,
    /// Hardware address type.
    pub htype: u8,
    /// Hardware address length.
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID.
    pub xid: u32,
    /// Seconds elapsed since the client began acquisition or renewal.
    pub secs: u16,
    pub flags: u16,
    /// Client IP address, filled when the client can answer ARP.
    pub ciaddr: Ipv4Addr,
    /// 'your' (client) address, assigned by the server.
    pub yiaddr: Ipv4Addr,
    /// Next-server address for the bootstrap phase.
    pub siaddr: Ipv4Addr,
    /// Relay agent address.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; MAX_CHADDR_LEN],
    pub(crate) sname: [u8; MAX_SNAME_LEN],
    pub(crate) file: [u8; MAX_FILE_LEN],
    pub options: Dhcp4Options,
}

impl Default for Dhcp4Packet {
    fn default() -> Self {
        Self {
            op: BOOTREQUEST,
            htype: 0,
            hlen: 0,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0u8; MAX_CHADDR_LEN],
            sname: [0u8; MAX_SNAME_LEN],
            file: [0u8; MAX_FILE_LEN],
            options: Dhcp4Options::default(),
        }
    }
}

impl Dhcp4Packet {
    // Fixed header plus magic cookie.
    const MIN_LEN: usize = 240;

    /// Parse a raw datagram with UDP and lower headers already removed.
    /// Honors the option-overload byte redirecting option parsing into
    /// the `file` and/or `sname` fields.
    pub fn parse(raw: &[u8]) -> Result<Self, DhcpError> {
        if raw.len() < Self::MIN_LEN {
            return Err(DhcpError::new(
                ErrorKind::InvalidDhcpMessage,
                format!(
                    "RAW data length({}) is less than minimum DHCP \
                     message size {}",
                    raw.len(),
                    Self::MIN_LEN
                ),
            ));
        }
        let mut buf = Buffer::new(raw);

        let mut ret = Self {
            op: buf.get_u8().context("Invalid DHCPv4 header field 'op'")?,
            htype: buf
                .get_u8()
                .context("Invalid DHCPv4 header field 'htype'")?,
            hlen: buf
                .get_u8()
                .context("Invalid DHCPv4 header field 'hlen'")?,
            hops: buf
                .get_u8()
                .context("Invalid DHCPv4 header field 'hops'")?,
            xid: buf
                .get_u32_be()
                .context("Invalid DHCPv4 header field 'xid'")?,
            secs: buf
                .get_u16_be()
                .context("Invalid DHCPv4 header field 'secs'")?,
            flags: buf
                .get_u16_be()
                .context("Invalid DHCPv4 header field 'flags'")?,
            ciaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'ciaddr'")?,
            yiaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'yiaddr'")?,
            siaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'siaddr'")?,
            giaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'giaddr'")?,
            chaddr: {
                let mut chaddr = [0u8; MAX_CHADDR_LEN];
                chaddr.copy_from_slice(
                    buf.get_bytes(MAX_CHADDR_LEN)
                        .context("Invalid DHCPv4 header field 'chaddr'")?,
                );
                chaddr
            },
            sname: {
                let mut sname = [0u8; MAX_SNAME_LEN];
                sname.copy_from_slice(
                    buf.get_bytes(MAX_SNAME_LEN)
                        .context("Invalid DHCPv4 header field 'sname'")?,
                );
                sname
            },
            file: {
                let mut file = [0u8; MAX_FILE_LEN];
                file.copy_from_slice(
                    buf.get_bytes(MAX_FILE_LEN)
                        .context("Invalid DHCPv4 header field 'file'")?,
                );
                file
            },
            options: Dhcp4Options::default(),
        };

        let magic_cookie =
            buf.get_bytes(4).context("Invalid DHCP magic cookie")?;
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(DhcpError::new(
                ErrorKind::InvalidDhcpMessage,
                format!(
                    "DHCPv4 magic cookie not match, expected {:?}, got {:?}",
                    DHCP_MAGIC_COOKIE, magic_cookie
                ),
            ));
        }

        let (mut options, overload) = Dhcp4Options::parse(buf.get_remains())?;
        let mut ignored = 0u8;
        if overload & OVERLOAD_FILE != 0 {
            options.parse_area(&ret.file, &mut ignored)?;
        }
        if overload & OVERLOAD_SNAME != 0 {
            options.parse_area(&ret.sname, &mut ignored)?;
        }
        ret.options = options;

        log::trace!("Parsed DHCP message {ret:?}");
        Ok(ret)
    }

    /// Parse from a full ethernet frame, also returning the IPv4 source
    /// address for server-reject matching.
    pub(crate) fn parse_eth(
        raw: &[u8],
    ) -> Result<(Self, Ipv4Addr), DhcpError> {
        let packet = match etherparse::SlicedPacket::from_ethernet(raw) {
            Err(error) => {
                return Err(DhcpError::new(
                    ErrorKind::InvalidDhcpMessage,
                    format!(
                        "Failed to parse ethernet packet to DHCP message: \
                         {error}"
                    ),
                ));
            }
            Ok(v) => v,
        };
        let src_ip = match &packet.net {
            Some(etherparse::NetSlice::Ipv4(ip)) => {
                Ipv4Addr::from(ip.header().source())
            }
            _ => {
                return Err(DhcpError::new(
                    ErrorKind::InvalidDhcpMessage,
                    "Failed to parse ethernet packet to DHCP message: \
                     not IPv4"
                        .to_string(),
                ));
            }
        };
        if let Some(etherparse::TransportSlice::Udp(udp_packet)) =
            packet.transport
        {
            Ok((Self::parse(udp_packet.payload())?, src_ip))
        } else {
            Err(DhcpError::new(
                ErrorKind::InvalidDhcpMessage,
                "Failed to parse ethernet packet to DHCP message: not UDP \
                 payload"
                    .to_string(),
            ))
        }
    }

    /// The DHCP message-type byte, or zero for a plain BOOTP reply.
    pub fn packet_type(&self) -> u8 {
        self.options
            .evaluate_dhcp(DHO_MESSAGE_TYPE)
            .and_then(|d| d.first().copied())
            .unwrap_or(0)
    }

    fn overload(&self) -> u8 {
        self.options
            .evaluate_dhcp(DHO_OPTION_OVERLOAD)
            .and_then(|d| d.first().copied())
            .unwrap_or(0)
    }

    /// The server-name header field, unless the overload option
    /// claimed it for option data.
    pub(crate) fn server_name(&self) -> Option<String> {
        if self.overload() & OVERLOAD_SNAME != 0 {
            None
        } else {
            field_string(&self.sname)
        }
    }

    /// The boot-file header field, unless the overload option claimed
    /// it for option data.
    pub(crate) fn boot_file(&self) -> Option<String> {
        if self.overload() & OVERLOAD_FILE != 0 {
            None
        } else {
            field_string(&self.file)
        }
    }

    /// Serialize the datagram, padded to the BOOTP minimum length.
    pub fn emit(&self) -> Vec<u8> {
        let mut buf = BufferMut::new(BOOTP_MIN_LEN);
        buf.write_u8(self.op);
        buf.write_u8(self.htype);
        buf.write_u8(self.hlen);
        buf.write_u8(self.hops);
        buf.write_u32_be(self.xid);
        buf.write_u16_be(self.secs);
        buf.write_u16_be(self.flags);
        buf.write_ipv4(self.ciaddr);
        buf.write_ipv4(self.yiaddr);
        buf.write_ipv4(self.siaddr);
        buf.write_ipv4(self.giaddr);
        buf.write_bytes(&self.chaddr);
        buf.write_bytes(&self.sname);
        buf.write_bytes(&self.file);
        buf.write_bytes(&DHCP_MAGIC_COOKIE);
        self.options.emit(&mut buf);
        while buf.len() < BOOTP_MIN_LEN {
            buf.write_u8(0);
        }
        buf.data
    }

    /// Wrap the datagram in Ethernet/IPv4/UDP headers for the
    /// all-stations broadcast transmission.
    pub(crate) fn to_eth_broadcast(&self) -> Result<Vec<u8>, DhcpError> {
        let payload = self.emit();
        let src_mac = eth_mac(&self.chaddr[..self.hlen as usize]);

        let builder = etherparse::PacketBuilder::ethernet2(
            src_mac,
            BROADCAST_MAC_ADDRESS,
        )
        .ipv4(
            Ipv4Addr::UNSPECIFIED.octets(),
            Ipv4Addr::BROADCAST.octets(),
            DEFAULT_TTL,
        )
        .udp(CLIENT_PORT, SERVER_PORT);

        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, &payload).map_err(|e| {
            DhcpError::new(
                ErrorKind::Bug,
                format!("Failed to generate ethernet packet: {e}"),
            )
        })?;
        Ok(packet)
    }
}

fn eth_mac(bytes: &[u8]) -> [u8; 6] {
    let mut mac = [0u8; 6];
    let len = bytes.len().min(6);
    mac[..len].copy_from_slice(&bytes[..len]);
    mac
}

fn field_string(field: &[u8]) -> Option<String> {
    let len = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    if len == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&field[..len]).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcpv4::options::{
        OptionValue, Universe, DHO_LEASE_TIME, DHO_OPTION_OVERLOAD,
        DHO_SERVER_IDENTIFIER,
    };

    fn reply_with_options(opts: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; 236];
        raw[0] = BOOTREPLY;
        raw[1] = 1;
        raw[2] = 6;
        raw[4..8].copy_from_slice(&0x01020304u32.to_be_bytes());
        raw.extend_from_slice(&DHCP_MAGIC_COOKIE);
        raw.extend_from_slice(opts);
        while raw.len() < BOOTP_MIN_LEN {
            raw.push(0);
        }
        raw
    }

    #[test]
    fn test_parse_bootp_reply_has_type_zero() {
        let raw = reply_with_options(&[255]);
        let packet = Dhcp4Packet::parse(&raw).unwrap();
        assert_eq!(packet.packet_type(), 0);
        assert_eq!(packet.xid, 0x01020304);
    }

    #[test]
    fn test_parse_honors_option_overload() {
        let mut raw = vec![0u8; 236];
        raw[0] = BOOTREPLY;
        raw[1] = 1;
        raw[2] = 6;
        // lease-time hidden in the sname field.
        raw[44] = DHO_LEASE_TIME;
        raw[45] = 4;
        raw[46..50].copy_from_slice(&600u32.to_be_bytes());
        raw[50] = 255;
        // server-identifier hidden in the file field.
        raw[108] = DHO_SERVER_IDENTIFIER;
        raw[109] = 4;
        raw[110..114].copy_from_slice(&[192, 0, 2, 1]);
        raw[114] = 255;
        raw.extend_from_slice(&DHCP_MAGIC_COOKIE);
        raw.extend_from_slice(&[DHO_OPTION_OVERLOAD, 1, 3, 255]);

        let packet = Dhcp4Packet::parse(&raw).unwrap();
        assert_eq!(packet.options.u32_dhcp(DHO_LEASE_TIME), Some(600));
        assert_eq!(
            packet.options.ipv4_dhcp(DHO_SERVER_IDENTIFIER),
            Some(Ipv4Addr::new(192, 0, 2, 1))
        );
        // Overloaded fields must not be misread as names.
        assert_eq!(packet.server_name(), None);
    }

    #[test]
    fn test_emit_pads_to_bootp_min_len() {
        let mut packet = Dhcp4Packet {
            htype: 1,
            hlen: 6,
            xid: 42,
            ..Default::default()
        };
        packet.options.save(
            Universe::Dhcp,
            DHO_LEASE_TIME,
            OptionValue::Raw(600u32.to_be_bytes().to_vec()),
        );
        let raw = packet.emit();
        assert_eq!(raw.len(), BOOTP_MIN_LEN);
        let parsed = Dhcp4Packet::parse(&raw).unwrap();
        assert_eq!(parsed.xid, 42);
        assert_eq!(parsed.options.u32_dhcp(DHO_LEASE_TIME), Some(600));
    }

    #[test]
    fn test_parse_too_short_rejected() {
        assert!(Dhcp4Packet::parse(&[0u8; 100]).is_err());
    }
}
