// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime};

use crate::{buffer::BufferMut, iface::HwAddr, DhcpError, ErrorKind};

const DUID_TYPE_LLT: u16 = 1;
const DUID_TYPE_LL: u16 = 3;

// RFC 8415 11.2: the DUID-LLT time is seconds since midnight (UTC)
// January 1, 2000.
const BASE_TIME: Duration = Duration::new(946684800, 0);

/// DHCP Unique Identifier, RFC 3315. Treated as an opaque byte string
/// for comparison; only formed as LLT or LL from the interface hardware
/// address, and persisted in the lease database.
#[derive(Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Duid {
    /// Link-layer address plus time.
    LinkLayerAddrPlusTime(Vec<u8>),
    /// Link-layer address only.
    LinkLayerAddr(Vec<u8>),
    /// Anything recovered from the lease database that we do not
    /// reinterpret.
    Raw(Vec<u8>),
}

impl Duid {
    pub fn new_llt(hw: &HwAddr) -> Self {
        let time: u32 = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .ok()
            .and_then(|s| s.checked_sub(BASE_TIME))
            .map(|t| t.as_secs() as u32)
            .unwrap_or_default();
        let mut buf = BufferMut::new(8 + hw.bytes.len());
        buf.write_u16_be(DUID_TYPE_LLT);
        buf.write_u16_be(hw.htype as u16);
        buf.write_u32_be(time);
        buf.write_bytes(hw.bytes.as_slice());
        Self::LinkLayerAddrPlusTime(buf.data)
    }

    pub fn new_ll(hw: &HwAddr) -> Self {
        let mut buf = BufferMut::new(4 + hw.bytes.len());
        buf.write_u16_be(DUID_TYPE_LL);
        buf.write_u16_be(hw.htype as u16);
        buf.write_bytes(hw.bytes.as_slice());
        Self::LinkLayerAddr(buf.data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::LinkLayerAddrPlusTime(data)
            | Self::LinkLayerAddr(data)
            | Self::Raw(data) => data.as_slice(),
        }
    }

    pub(crate) fn from_bytes(data: Vec<u8>) -> Self {
        if data.len() >= 2 {
            match u16::from_be_bytes([data[0], data[1]]) {
                DUID_TYPE_LLT => return Self::LinkLayerAddrPlusTime(data),
                DUID_TYPE_LL => return Self::LinkLayerAddr(data),
                _ => (),
            }
        }
        Self::Raw(data)
    }

    /// Colon-separated hex, the form written to the lease database.
    pub fn to_hex(&self) -> String {
        let strs: Vec<String> = self
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        strs.join(":")
    }

    pub(crate) fn from_hex(text: &str) -> Result<Self, DhcpError> {
        let mut data = Vec::new();
        for word in text.split(':') {
            if word.is_empty() {
                continue;
            }
            data.push(u8::from_str_radix(word, 16).map_err(|e| {
                DhcpError::new(
                    ErrorKind::InvalidLeaseFile,
                    format!("Invalid DUID hex byte {word}: {e}"),
                )
            })?);
        }
        if data.is_empty() {
            return Err(DhcpError::new(
                ErrorKind::InvalidLeaseFile,
                format!("Empty DUID {text}"),
            ));
        }
        Ok(Self::from_bytes(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llt_layout() {
        let hw =
            HwAddr::new_ethernet([0x00, 0x23, 0x45, 0x67, 0x89, 0x1a]);
        let duid = Duid::new_llt(&hw);
        let data = duid.as_bytes();
        assert_eq!(data.len(), 14);
        assert_eq!(&data[..2], &[0, 1]);
        assert_eq!(&data[2..4], &[0, 1]);
        assert_eq!(&data[8..], &hw.bytes[..]);
    }

    #[test]
    fn test_hex_round_trip() {
        let hw =
            HwAddr::new_ethernet([0x00, 0x23, 0x45, 0x67, 0x89, 0x1a]);
        let duid = Duid::new_ll(&hw);
        let parsed = Duid::from_hex(&duid.to_hex()).unwrap();
        assert_eq!(parsed, duid);
        assert!(matches!(parsed, Duid::LinkLayerAddr(_)));
    }
}
