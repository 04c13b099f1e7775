// SPDX-License-Identifier: Apache-2.0

use std::ffi::CString;

use crate::{DhcpError, ErrorKind};

pub(crate) const BROADCAST_MAC_ADDRESS: [u8; 6] = [u8::MAX; 6];
pub(crate) const ARP_HW_TYPE_ETHERNET: u8 = 1;

/// Link-layer address with its ARP hardware type. The wire format of
/// `chaddr` carries only the address bytes; the type byte travels in the
/// BOOTP `htype` field.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct HwAddr {
    pub htype: u8,
    pub bytes: Vec<u8>,
}

impl HwAddr {
    pub fn new_ethernet(bytes: [u8; 6]) -> Self {
        Self {
            htype: ARP_HW_TYPE_ETHERNET,
            bytes: bytes.to_vec(),
        }
    }
}

impl std::fmt::Display for HwAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strs: Vec<String> =
            self.bytes.iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "{}", strs.join(":"))
    }
}

/// A network device the client operates on.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Iface {
    pub name: String,
    pub index: u32,
    pub hw: HwAddr,
    /// Named on the command line.
    pub requested: bool,
    /// Picked up automatically rather than explicitly requested.
    pub automatic: bool,
    pub running: bool,
}

impl Iface {
    /// Resolve interface index and hardware address from the kernel.
    pub fn probe(name: &str) -> Result<Self, DhcpError> {
        let name_cstr = CString::new(name)?;
        let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
        if index == 0 {
            return Err(DhcpError::new(
                ErrorKind::InvalidArgument,
                format!("Interface {name} not found"),
            ));
        }
        let hw = get_hw_addr(&name_cstr, name)?;
        log::debug!("Interface {name} index {index} hwaddr {hw}");
        Ok(Self {
            name: name.to_string(),
            index,
            hw,
            requested: false,
            automatic: false,
            running: true,
        })
    }
}

fn get_hw_addr(name_cstr: &CString, name: &str) -> Result<HwAddr, DhcpError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(DhcpError::new(
            ErrorKind::Bug,
            "libc::socket() failed with -1".to_string(),
        ));
    }

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    let name_bytes = name_cstr.as_bytes_with_nul();
    if name_bytes.len() > req.ifr_name.len() {
        unsafe { libc::close(fd) };
        return Err(DhcpError::new(
            ErrorKind::InvalidArgument,
            format!("Interface name {name} exceeds IFNAMSIZ"),
        ));
    }
    for (i, b) in name_bytes.iter().enumerate() {
        req.ifr_name[i] = *b as libc::c_char;
    }

    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };
    unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(DhcpError::new(
            ErrorKind::Bug,
            format!("Failed to read hardware address of {name}: ioctl {rc}"),
        ));
    }

    let sa = unsafe { req.ifr_ifru.ifru_hwaddr };
    let mut bytes = [0u8; 6];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = sa.sa_data[i] as u8;
    }
    Ok(HwAddr {
        htype: sa.sa_family as u8,
        bytes: bytes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_addr_display() {
        let hw = HwAddr::new_ethernet([0x00, 0x23, 0x45, 0x67, 0x89, 0x1a]);
        assert_eq!(hw.to_string(), "00:23:45:67:89:1a");
        assert_eq!(hw.htype, ARP_HW_TYPE_ETHERNET);
    }
}
