// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::{buffer::BufferMut, DhcpError, ErrorKind};

/// Option namespaces. Most traffic lives in the base DHCP universe;
/// vendor universes are keyed by the space name from the configuration.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub enum Universe {
    Dhcp,
    Fqdn,
    Vendor(String),
}

impl std::fmt::Display for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dhcp => write!(f, "dhcp"),
            Self::Fqdn => write!(f, "fqdn"),
            Self::Vendor(name) => write!(f, "{name}"),
        }
    }
}

/// Wire formats the pretty printer and the text parser understand.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum OptFormat {
    Ip,
    IpList,
    U8,
    U16,
    U32,
    I32,
    Text,
    Bytes,
}

pub(crate) struct OptionDef {
    pub(crate) code: u8,
    pub(crate) name: &'static str,
    pub(crate) format: OptFormat,
}

pub(crate) const DHO_SUBNET_MASK: u8 = 1;
pub(crate) const DHO_TIME_OFFSET: u8 = 2;
pub(crate) const DHO_ROUTERS: u8 = 3;
pub(crate) const DHO_TIME_SERVERS: u8 = 4;
pub(crate) const DHO_DOMAIN_NAME_SERVERS: u8 = 6;
pub(crate) const DHO_HOST_NAME: u8 = 12;
pub(crate) const DHO_DOMAIN_NAME: u8 = 15;
pub(crate) const DHO_INTERFACE_MTU: u8 = 26;
pub(crate) const DHO_BROADCAST_ADDRESS: u8 = 28;
pub(crate) const DHO_STATIC_ROUTES: u8 = 33;
pub(crate) const DHO_NIS_DOMAIN: u8 = 40;
pub(crate) const DHO_NIS_SERVERS: u8 = 41;
pub(crate) const DHO_NTP_SERVERS: u8 = 42;
pub(crate) const DHO_VENDOR_ENCAPSULATED_OPTIONS: u8 = 43;
pub(crate) const DHO_NETBIOS_NAME_SERVERS: u8 = 44;
pub(crate) const DHO_NETBIOS_SCOPE: u8 = 47;
pub(crate) const DHO_REQUESTED_ADDRESS: u8 = 50;
pub(crate) const DHO_LEASE_TIME: u8 = 51;
pub(crate) const DHO_OPTION_OVERLOAD: u8 = 52;
pub(crate) const DHO_MESSAGE_TYPE: u8 = 53;
pub(crate) const DHO_SERVER_IDENTIFIER: u8 = 54;
pub(crate) const DHO_PARAMETER_REQUEST_LIST: u8 = 55;
pub(crate) const DHO_MESSAGE: u8 = 56;
pub(crate) const DHO_MAX_MESSAGE_SIZE: u8 = 57;
pub(crate) const DHO_RENEWAL_TIME: u8 = 58;
pub(crate) const DHO_REBINDING_TIME: u8 = 59;
pub(crate) const DHO_VENDOR_CLASS_IDENTIFIER: u8 = 60;
pub(crate) const DHO_CLIENT_IDENTIFIER: u8 = 61;
pub(crate) const DHO_TFTP_SERVER_NAME: u8 = 66;
pub(crate) const DHO_BOOTFILE_NAME: u8 = 67;
pub(crate) const DHO_DOMAIN_SEARCH: u8 = 119;
pub(crate) const DHO_CLASSLESS_STATIC_ROUTES: u8 = 121;

pub(crate) const OPT_PAD: u8 = 0;
pub(crate) const OPT_END: u8 = 255;

static DHCP_OPTION_DEFS: &[OptionDef] = &[
    OptionDef {
        code: DHO_SUBNET_MASK,
        name: "subnet-mask",
        format: OptFormat::Ip,
    },
    OptionDef {
        code: DHO_TIME_OFFSET,
        name: "time-offset",
        format: OptFormat::I32,
    },
    OptionDef {
        code: DHO_ROUTERS,
        name: "routers",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_TIME_SERVERS,
        name: "time-servers",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_DOMAIN_NAME_SERVERS,
        name: "domain-name-servers",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_HOST_NAME,
        name: "host-name",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_DOMAIN_NAME,
        name: "domain-name",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_INTERFACE_MTU,
        name: "interface-mtu",
        format: OptFormat::U16,
    },
    OptionDef {
        code: DHO_BROADCAST_ADDRESS,
        name: "broadcast-address",
        format: OptFormat::Ip,
    },
    OptionDef {
        code: DHO_STATIC_ROUTES,
        name: "static-routes",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_NIS_DOMAIN,
        name: "nis-domain",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_NIS_SERVERS,
        name: "nis-servers",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_NTP_SERVERS,
        name: "ntp-servers",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_VENDOR_ENCAPSULATED_OPTIONS,
        name: "vendor-encapsulated-options",
        format: OptFormat::Bytes,
    },
    OptionDef {
        code: DHO_NETBIOS_NAME_SERVERS,
        name: "netbios-name-servers",
        format: OptFormat::IpList,
    },
    OptionDef {
        code: DHO_NETBIOS_SCOPE,
        name: "netbios-scope",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_REQUESTED_ADDRESS,
        name: "dhcp-requested-address",
        format: OptFormat::Ip,
    },
    OptionDef {
        code: DHO_LEASE_TIME,
        name: "dhcp-lease-time",
        format: OptFormat::U32,
    },
    OptionDef {
        code: DHO_OPTION_OVERLOAD,
        name: "dhcp-option-overload",
        format: OptFormat::U8,
    },
    OptionDef {
        code: DHO_MESSAGE_TYPE,
        name: "dhcp-message-type",
        format: OptFormat::U8,
    },
    OptionDef {
        code: DHO_SERVER_IDENTIFIER,
        name: "dhcp-server-identifier",
        format: OptFormat::Ip,
    },
    OptionDef {
        code: DHO_PARAMETER_REQUEST_LIST,
        name: "dhcp-parameter-request-list",
        format: OptFormat::Bytes,
    },
    OptionDef {
        code: DHO_MESSAGE,
        name: "dhcp-message",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_MAX_MESSAGE_SIZE,
        name: "dhcp-max-message-size",
        format: OptFormat::U16,
    },
    OptionDef {
        code: DHO_RENEWAL_TIME,
        name: "dhcp-renewal-time",
        format: OptFormat::U32,
    },
    OptionDef {
        code: DHO_REBINDING_TIME,
        name: "dhcp-rebinding-time",
        format: OptFormat::U32,
    },
    OptionDef {
        code: DHO_VENDOR_CLASS_IDENTIFIER,
        name: "vendor-class-identifier",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_CLIENT_IDENTIFIER,
        name: "dhcp-client-identifier",
        format: OptFormat::Bytes,
    },
    OptionDef {
        code: DHO_TFTP_SERVER_NAME,
        name: "tftp-server-name",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_BOOTFILE_NAME,
        name: "bootfile-name",
        format: OptFormat::Text,
    },
    OptionDef {
        code: DHO_DOMAIN_SEARCH,
        name: "domain-search",
        format: OptFormat::Bytes,
    },
    OptionDef {
        code: DHO_CLASSLESS_STATIC_ROUTES,
        name: "rfc3442-classless-static-routes",
        format: OptFormat::Bytes,
    },
];

pub(crate) fn def_by_code(code: u8) -> Option<&'static OptionDef> {
    DHCP_OPTION_DEFS.iter().find(|d| d.code == code)
}

pub(crate) fn def_by_name(name: &str) -> Option<&'static OptionDef> {
    DHCP_OPTION_DEFS.iter().find(|d| d.name == name)
}

/// Canonical name of a DHCP option, `unknown-<code>` when we carry no
/// definition for it.
pub(crate) fn option_name(code: u8) -> String {
    match def_by_code(code) {
        Some(def) => def.name.to_string(),
        None => format!("unknown-{code}"),
    }
}

/// Environment-variable name for an option: dashes become underscores,
/// and options outside the base universe get the universe name prefixed.
pub(crate) fn option_env_name(universe: &Universe, code: u8) -> String {
    let name = match universe {
        Universe::Dhcp => option_name(code),
        other => format!("{}_{}", other, option_name(code)),
    };
    name.replace('-', "_")
}

/// A stored option value. Values received off the wire are concrete
/// bytes; values sourced from configuration text stay symbolic until
/// evaluated against the option's wire format.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OptionValue {
    Raw(Vec<u8>),
    Text(String),
}

impl OptionValue {
    pub(crate) fn evaluate(&self, code: u8) -> Result<Vec<u8>, DhcpError> {
        match self {
            Self::Raw(data) => Ok(data.clone()),
            Self::Text(text) => {
                let format = def_by_code(code)
                    .map(|d| d.format)
                    .unwrap_or(OptFormat::Bytes);
                parse_option_text(format, text)
            }
        }
    }
}

/// Keyed map of (universe, code) to option value with lookup,
/// evaluation, and per-universe iteration.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Dhcp4Options {
    data: BTreeMap<(Universe, u8), OptionValue>,
}

impl Dhcp4Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn save(&mut self, universe: Universe, code: u8, value: OptionValue) {
        self.data.insert((universe, code), value);
    }

    pub(crate) fn save_dhcp_raw(&mut self, code: u8, data: &[u8]) {
        self.save(Universe::Dhcp, code, OptionValue::Raw(data.to_vec()));
    }

    pub fn lookup(&self, universe: &Universe, code: u8) -> Option<&OptionValue> {
        self.data.get(&(universe.clone(), code))
    }

    pub fn lookup_dhcp(&self, code: u8) -> Option<&OptionValue> {
        self.lookup(&Universe::Dhcp, code)
    }

    pub fn contains_dhcp(&self, code: u8) -> bool {
        self.lookup_dhcp(code).is_some()
    }

    /// Produce the concrete byte string of an option, evaluating
    /// config-sourced text values against the option's wire format.
    pub fn evaluate(&self, universe: &Universe, code: u8) -> Option<Vec<u8>> {
        let value = self.lookup(universe, code)?;
        match value.evaluate(code) {
            Ok(data) => Some(data),
            Err(e) => {
                log::error!(
                    "Failed to evaluate option {} in universe {}: {}",
                    code,
                    universe,
                    e
                );
                None
            }
        }
    }

    pub fn evaluate_dhcp(&self, code: u8) -> Option<Vec<u8>> {
        self.evaluate(&Universe::Dhcp, code)
    }

    pub fn iter_universe<'a>(
        &'a self,
        universe: &Universe,
    ) -> impl Iterator<Item = (u8, &'a OptionValue)> + 'a {
        let universe = universe.clone();
        self.data
            .iter()
            .filter(move |((u, _), _)| *u == universe)
            .map(|((_, code), value)| (*code, value))
    }

    pub(crate) fn u32_dhcp(&self, code: u8) -> Option<u32> {
        let data = self.evaluate_dhcp(code)?;
        if data.len() >= 4 {
            Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
        } else {
            None
        }
    }

    pub(crate) fn ipv4_dhcp(&self, code: u8) -> Option<Ipv4Addr> {
        let data = self.evaluate_dhcp(code)?;
        if data.len() >= 4 {
            Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
        } else {
            None
        }
    }

    /// Parse a raw DHCP options area (magic cookie already consumed).
    /// Returns the parsed store and the overload byte, if present.
    pub(crate) fn parse(raw: &[u8]) -> Result<(Self, u8), DhcpError> {
        let mut ret = Self::new();
        let mut overload = 0u8;
        ret.parse_area(raw, &mut overload)?;
        Ok((ret, overload))
    }

    pub(crate) fn parse_area(
        &mut self,
        raw: &[u8],
        overload: &mut u8,
    ) -> Result<(), DhcpError> {
        let mut i = 0usize;
        while i < raw.len() {
            let code = raw[i];
            i += 1;
            if code == OPT_PAD {
                continue;
            }
            if code == OPT_END {
                break;
            }
            if i >= raw.len() {
                return Err(DhcpError::new(
                    ErrorKind::InvalidDhcpMessage,
                    format!("DHCP option {code} is missing its length byte"),
                ));
            }
            let len = raw[i] as usize;
            i += 1;
            if i + len > raw.len() {
                return Err(DhcpError::new(
                    ErrorKind::InvalidDhcpMessage,
                    format!(
                        "DHCP option {} length {} exceeds remaining {} bytes",
                        code,
                        len,
                        raw.len() - i
                    ),
                ));
            }
            let data = &raw[i..i + len];
            i += len;
            if code == DHO_OPTION_OVERLOAD && !data.is_empty() {
                *overload = data[0];
            }
            // Later instances win, matching server behavior of splitting
            // an oversized option across instances being unsupported.
            self.save_dhcp_raw(code, data);
        }
        Ok(())
    }

    /// Emit the base-universe options followed by the END marker.
    pub(crate) fn emit(&self, buf: &mut BufferMut) {
        for (code, value) in self.iter_universe(&Universe::Dhcp) {
            if let Ok(data) = value.evaluate(code) {
                buf.write_u8(code);
                buf.write_u8(data.len() as u8);
                buf.write_bytes(&data);
            }
        }
        buf.write_u8(OPT_END);
    }
}

/// Render an option value for humans, the lease database, and the
/// script environment. The lease database wants comma separators on
/// lists; the script contract wants spaces.
pub(crate) fn pretty_print_option(
    code: u8,
    data: &[u8],
    emit_commas: bool,
) -> String {
    let format = def_by_code(code)
        .map(|d| d.format)
        .unwrap_or(OptFormat::Bytes);
    let sep = if emit_commas { "," } else { " " };
    match format {
        OptFormat::Ip | OptFormat::IpList => {
            let strs: Vec<String> = data
                .chunks_exact(4)
                .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]).to_string())
                .collect();
            strs.join(sep)
        }
        OptFormat::U8 => data
            .first()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        OptFormat::U16 => {
            if data.len() >= 2 {
                u16::from_be_bytes([data[0], data[1]]).to_string()
            } else {
                String::new()
            }
        }
        OptFormat::U32 => {
            if data.len() >= 4 {
                u32::from_be_bytes([data[0], data[1], data[2], data[3]])
                    .to_string()
            } else {
                String::new()
            }
        }
        OptFormat::I32 => {
            if data.len() >= 4 {
                i32::from_be_bytes([data[0], data[1], data[2], data[3]])
                    .to_string()
            } else {
                String::new()
            }
        }
        OptFormat::Text => String::from_utf8_lossy(data).to_string(),
        OptFormat::Bytes => {
            let strs: Vec<String> =
                data.iter().map(|b| format!("{b:02x}")).collect();
            strs.join(":")
        }
    }
}

/// Parse the textual form produced by [pretty_print_option] back into
/// wire bytes. Accepts both comma and whitespace list separators.
pub(crate) fn parse_option_text(
    format: OptFormat,
    text: &str,
) -> Result<Vec<u8>, DhcpError> {
    let bad = |msg: String| DhcpError::new(ErrorKind::InvalidArgument, msg);
    match format {
        OptFormat::Ip | OptFormat::IpList => {
            let mut ret = Vec::new();
            for word in text.split(|c: char| c == ',' || c.is_whitespace()) {
                if word.is_empty() {
                    continue;
                }
                let ip = Ipv4Addr::from_str(word).map_err(|e| {
                    bad(format!("Invalid IPv4 address {word}: {e}"))
                })?;
                ret.extend_from_slice(&ip.octets());
            }
            if ret.is_empty() {
                Err(bad(format!("No IPv4 address in {text}")))
            } else {
                Ok(ret)
            }
        }
        OptFormat::U8 => Ok(vec![text
            .trim()
            .parse::<u8>()
            .map_err(|e| bad(format!("Invalid u8 {text}: {e}")))?]),
        OptFormat::U16 => Ok(text
            .trim()
            .parse::<u16>()
            .map_err(|e| bad(format!("Invalid u16 {text}: {e}")))?
            .to_be_bytes()
            .to_vec()),
        OptFormat::U32 => Ok(text
            .trim()
            .parse::<u32>()
            .map_err(|e| bad(format!("Invalid u32 {text}: {e}")))?
            .to_be_bytes()
            .to_vec()),
        OptFormat::I32 => Ok(text
            .trim()
            .parse::<i32>()
            .map_err(|e| bad(format!("Invalid i32 {text}: {e}")))?
            .to_be_bytes()
            .to_vec()),
        OptFormat::Text => Ok(text.as_bytes().to_vec()),
        OptFormat::Bytes => {
            let mut ret = Vec::new();
            for word in text.split(':') {
                if word.is_empty() {
                    continue;
                }
                ret.push(u8::from_str_radix(word, 16).map_err(|e| {
                    bad(format!("Invalid hex byte {word}: {e}"))
                })?);
            }
            Ok(ret)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options_area() {
        // message-type ACK, lease-time 600, server-id 192.0.2.1
        let raw = [
            53, 1, 5, 51, 4, 0, 0, 2, 88, 54, 4, 192, 0, 2, 1, 255,
        ];
        let (opts, overload) = Dhcp4Options::parse(&raw).unwrap();
        assert_eq!(overload, 0);
        assert_eq!(opts.u32_dhcp(DHO_LEASE_TIME), Some(600));
        assert_eq!(
            opts.ipv4_dhcp(DHO_SERVER_IDENTIFIER),
            Some(Ipv4Addr::new(192, 0, 2, 1))
        );
    }

    #[test]
    fn test_parse_truncated_option_rejected() {
        let raw = [51, 4, 0, 0];
        assert!(Dhcp4Options::parse(&raw).is_err());
    }

    #[test]
    fn test_text_value_evaluates_via_format() {
        let mut opts = Dhcp4Options::new();
        opts.save(
            Universe::Dhcp,
            DHO_SUBNET_MASK,
            OptionValue::Text("255.255.255.0".to_string()),
        );
        assert_eq!(
            opts.evaluate_dhcp(DHO_SUBNET_MASK),
            Some(vec![255, 255, 255, 0])
        );
    }

    #[test]
    fn test_pretty_print_list_separators() {
        let data = [192, 0, 2, 1, 192, 0, 2, 2];
        assert_eq!(
            pretty_print_option(DHO_DOMAIN_NAME_SERVERS, &data, true),
            "192.0.2.1,192.0.2.2"
        );
        assert_eq!(
            pretty_print_option(DHO_DOMAIN_NAME_SERVERS, &data, false),
            "192.0.2.1 192.0.2.2"
        );
    }

    #[test]
    fn test_option_env_name() {
        assert_eq!(
            option_env_name(&Universe::Dhcp, DHO_DOMAIN_NAME_SERVERS),
            "domain_name_servers"
        );
        assert_eq!(
            option_env_name(&Universe::Vendor("acme".to_string()), 1),
            "acme_subnet_mask"
        );
        assert_eq!(option_env_name(&Universe::Dhcp, 250), "unknown_250");
    }

    #[test]
    fn test_value_text_round_trip() {
        for (code, text) in [
            (DHO_ROUTERS, "192.0.2.1,192.0.2.254"),
            (DHO_LEASE_TIME, "600"),
            (DHO_CLIENT_IDENTIFIER, "01:00:23:45:67:89:1a"),
        ] {
            let format = def_by_code(code).unwrap().format;
            let bytes = parse_option_text(format, text).unwrap();
            assert_eq!(pretty_print_option(code, &bytes, true), text);
        }
    }
}
