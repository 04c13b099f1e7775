// SPDX-License-Identifier: Apache-2.0

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;

use crate::{
    bpf::attach_dhcp_filter,
    dhcpv4::packet::{CLIENT_PORT, SERVER_PORT},
    iface::{Iface, BROADCAST_MAC_ADDRESS},
    DhcpError, ErrorKind,
};

const PACKET_HOST: u8 = 0; // a packet addressed to the local host

const RECV_BUFFER_LEN: usize = 1500;

/// Where the state machine puts packets on the wire. Broadcast frames
/// go out raw on the interface; unicast renewals use the fallback UDP
/// socket once an address is installed.
pub trait Transport {
    /// Transmit a complete ethernet frame to the all-stations address.
    fn send_broadcast(&mut self, frame: &[u8]) -> Result<(), DhcpError>;
    /// Transmit a bare DHCP datagram to a known server.
    fn send_unicast(
        &mut self,
        from: Ipv4Addr,
        to: Ipv4Addr,
        payload: &[u8],
    ) -> Result<(), DhcpError>;
}

/// AF_PACKET socket bound to one interface with the DHCP BPF filter
/// attached; sees every broadcast reply before the interface has an
/// address.
#[derive(Debug)]
pub(crate) struct RawSocket {
    raw_fd: libc::c_int,
    iface_index: u32,
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd as RawFd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        if self.raw_fd >= 0 {
            unsafe {
                libc::close(self.raw_fd);
            }
        }
    }
}

impl RawSocket {
    pub(crate) fn new(iface: &Iface) -> Result<Self, DhcpError> {
        let eth_protocol = libc::ETH_P_ALL;
        let raw_fd = unsafe {
            match libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (eth_protocol as libc::c_int).to_be(),
            ) {
                -1 => {
                    return Err(DhcpError::new(
                        ErrorKind::Bug,
                        "libc::socket() failed with -1".to_string(),
                    ));
                }
                fd => fd,
            }
        };

        bind_raw_socket(raw_fd, eth_protocol, iface)?;
        attach_dhcp_filter(raw_fd)?;
        log::debug!("Raw socket created {raw_fd} on {}", iface.name);
        Ok(Self {
            raw_fd,
            iface_index: iface.index,
        })
    }

    pub(crate) fn send(&self, eth_pkg: &[u8]) -> Result<(), DhcpError> {
        let mut dst_addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        dst_addr.sll_halen = libc::ETH_ALEN as u8;
        dst_addr.sll_addr[..libc::ETH_ALEN as usize]
            .clone_from_slice(&BROADCAST_MAC_ADDRESS);
        dst_addr.sll_ifindex = self.iface_index as i32;
        let addr_buffer_size: libc::socklen_t =
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

        unsafe {
            let sent_bytes = libc::sendto(
                self.raw_fd,
                eth_pkg.as_ptr() as *const libc::c_void,
                eth_pkg.len(),
                0, // flags
                &dst_addr as *const libc::sockaddr_ll
                    as *const libc::sockaddr,
                addr_buffer_size,
            );
            if sent_bytes <= 0 {
                let e = DhcpError::new(
                    ErrorKind::Bug,
                    format!(
                        "Failed to send {} bytes to raw socket {}: {}",
                        eth_pkg.len(),
                        self.raw_fd,
                        Errno::last(),
                    ),
                );
                log::error!("{e}");
                return Err(e);
            }
            log::debug!("Raw socket sent {sent_bytes} bytes");
        }
        Ok(())
    }

    pub(crate) fn recv(&self) -> Result<Vec<u8>, DhcpError> {
        let mut buffer = [0u8; RECV_BUFFER_LEN];
        unsafe {
            let rc = libc::recv(
                self.raw_fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0, // flags
            );
            if rc <= 0 {
                let errno = Errno::last();
                let e = if errno == Errno::EAGAIN {
                    DhcpError::new(
                        ErrorKind::Timeout,
                        "Timeout on receiving data from socket".to_string(),
                    )
                } else {
                    DhcpError::new(
                        ErrorKind::Bug,
                        format!(
                            "Failed to recv from socket {}: {}",
                            self.raw_fd, errno
                        ),
                    )
                };
                return Err(e);
            }
            Ok(buffer[..rc as usize].to_vec())
        }
    }
}

fn bind_raw_socket(
    fd: libc::c_int,
    eth_protocol: libc::c_int,
    iface: &Iface,
) -> Result<(), DhcpError> {
    let mut sll_addr: [libc::c_uchar; 8] = [0; 8];
    let hw_len = iface.hw.bytes.len().min(libc::ETH_ALEN as usize);
    sll_addr[..hw_len].clone_from_slice(&iface.hw.bytes[..hw_len]);

    let socket_addr = libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as libc::c_ushort,
        sll_protocol: (eth_protocol as libc::c_ushort).to_be(),
        sll_ifindex: iface.index as libc::c_int,
        sll_hatype: libc::ARPHRD_ETHER as libc::c_ushort,
        sll_pkttype: PACKET_HOST as libc::c_uchar,
        sll_halen: libc::ETH_ALEN as libc::c_uchar,
        sll_addr,
    };
    unsafe {
        match libc::bind(
            fd,
            &socket_addr as *const libc::sockaddr_ll
                as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        ) {
            0 => Ok(()),
            rc => {
                libc::close(fd);
                Err(DhcpError::new(
                    ErrorKind::Bug,
                    format!("Failed to bind socket: {rc}"),
                ))
            }
        }
    }
}

/// The per-interface transport: raw socket for broadcast, shared
/// fallback UDP socket (bound to the client port) for unicast
/// renewals and their replies.
#[derive(Debug)]
pub struct NetTransport {
    raw: RawSocket,
    fallback: UdpSocket,
}

impl NetTransport {
    pub fn new(iface: &Iface) -> Result<Self, DhcpError> {
        let raw = RawSocket::new(iface)?;
        let fallback = UdpSocket::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            CLIENT_PORT,
        ))
        .map_err(|e| {
            DhcpError::new(
                ErrorKind::Fatal,
                format!(
                    "Failed to bind fallback UDP socket to port \
                     {CLIENT_PORT}: {e}"
                ),
            )
        })?;
        fallback.set_nonblocking(true)?;
        Ok(Self { raw, fallback })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.raw.as_raw_fd()
    }

    pub(crate) fn fallback_fd(&self) -> RawFd {
        self.fallback.as_raw_fd()
    }

    pub(crate) fn recv_raw(&self) -> Result<Vec<u8>, DhcpError> {
        self.raw.recv()
    }

    /// Receive one datagram from the fallback socket, with the sender
    /// address.
    pub(crate) fn recv_fallback(
        &self,
    ) -> Result<(Vec<u8>, Ipv4Addr), DhcpError> {
        let mut buffer = [0u8; RECV_BUFFER_LEN];
        let (len, from) = self.fallback.recv_from(&mut buffer)?;
        let from_ip = match from {
            std::net::SocketAddr::V4(v4) => *v4.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        };
        Ok((buffer[..len].to_vec(), from_ip))
    }
}

impl Transport for NetTransport {
    fn send_broadcast(&mut self, frame: &[u8]) -> Result<(), DhcpError> {
        self.raw.send(frame)
    }

    fn send_unicast(
        &mut self,
        _from: Ipv4Addr,
        to: Ipv4Addr,
        payload: &[u8],
    ) -> Result<(), DhcpError> {
        self.fallback
            .send_to(payload, SocketAddrV4::new(to, SERVER_PORT))
            .map_err(|e| {
                DhcpError::new(
                    ErrorKind::Bug,
                    format!("Failed to send unicast to {to}: {e}"),
                )
            })?;
        Ok(())
    }
}
