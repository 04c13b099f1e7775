// SPDX-License-Identifier: Apache-2.0

use crate::{DhcpError, ErrorKind};

const fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt: 0, jf: 0, k }
}

const fn jeq(jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code: 0x15, // jump if accumulator equals k
        jt,
        jf,
        k,
    }
}

// Classic BPF for "IPv4, UDP, unfragmented, destination port 68".
// Anything else is cut off at the socket so the dispatcher only ever
// wakes up for frames that can hold a reply to this client.
const DHCP_REPLY_FILTER: [libc::sock_filter; 11] = [
    stmt(0x28, 12),      // A <- ethertype
    jeq(0, 8, 0x0800),   // not IPv4: reject
    stmt(0x30, 23),      // A <- IP protocol
    jeq(0, 6, 17),       // not UDP: reject
    stmt(0x28, 20),      // A <- flags and fragment offset
    libc::sock_filter {
        code: 0x45, // jump if any fragment-offset bit is set
        jt: 4,
        jf: 0,
        k: 0x1fff,
    },
    stmt(0xb1, 14),      // X <- IP header length
    stmt(0x48, 16),      // A <- UDP destination port (at X + 16)
    jeq(0, 1, 68),       // not the DHCP client port: reject
    stmt(0x06, 0x40000), // accept, full snap length
    stmt(0x06, 0),       // reject
];

/// Attach the DHCP reply filter to a raw packet socket.
pub(crate) fn attach_dhcp_filter(fd: libc::c_int) -> Result<(), DhcpError> {
    let prog = libc::sock_fprog {
        len: DHCP_REPLY_FILTER.len() as u16,
        filter: DHCP_REPLY_FILTER.as_ptr() as *mut _,
    };

    unsafe {
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            (&prog as *const _) as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(DhcpError::new(
                ErrorKind::Bug,
                format!("Failed to attach socket BPF filter, error: {rc}"),
            ));
        }
    }
    Ok(())
}
