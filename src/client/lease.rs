// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use rand::Rng;

use crate::{
    dhcpv4::options::{
        Dhcp4Options, DHO_LEASE_TIME, DHO_REBINDING_TIME, DHO_RENEWAL_TIME,
        DHO_SERVER_IDENTIFIER, DHO_SUBNET_MASK,
    },
    dhcpv4::Dhcp4Packet,
    time::{clamped_add, TIME_MAX},
    DhcpError, ErrorKind,
};

// Synthetic timers for leases acquired through plain BOOTP replies,
// which carry no timing options at all.
const BOOTP_EXPIRY_OFFSET: i64 = 12000;
const BOOTP_RENEWAL_OFFSET: i64 = 8000;
const BOOTP_REBIND_OFFSET: i64 = 10000;

/// One address binding as the client holds it: the assigned address,
/// the server's option set retained verbatim, and the three absolute
/// deadlines that drive the state machine.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClientLease {
    pub address: Ipv4Addr,
    pub next_server: Ipv4Addr,
    pub options: Dhcp4Options,
    pub server_name: Option<String>,
    pub filename: Option<String>,
    /// Acquired through a BOOTREPLY without DHCP options.
    pub is_bootp: bool,
    /// Originated from configuration, not from a server; such fallback
    /// leases are preserved across dynamic supersessions and never
    /// written to the lease database.
    pub is_static: bool,
    pub medium: Option<String>,
    /// Absolute seconds.
    pub expiry: i64,
    /// T1, absolute seconds.
    pub renewal: i64,
    /// T2, absolute seconds.
    pub rebind: i64,
}

impl Default for ClientLease {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            next_server: Ipv4Addr::UNSPECIFIED,
            options: Dhcp4Options::default(),
            server_name: None,
            filename: None,
            is_bootp: false,
            is_static: false,
            medium: None,
            expiry: 0,
            renewal: 0,
            rebind: 0,
        }
    }
}

impl ClientLease {
    /// Build a lease skeleton from an OFFER or ACK. Timing fields stay
    /// zero until [ClientLease::compute_times] or the BOOTP synthesis
    /// fills them; the codec already withholds overloaded sname/file
    /// fields.
    pub(crate) fn from_packet(packet: &Dhcp4Packet) -> Self {
        Self {
            address: packet.yiaddr,
            next_server: packet.siaddr,
            options: packet.options.clone(),
            server_name: packet.server_name(),
            filename: packet.boot_file(),
            is_bootp: packet.packet_type() == 0,
            ..Default::default()
        }
    }

    pub(crate) fn server_id(&self) -> Option<Ipv4Addr> {
        self.options.ipv4_dhcp(DHO_SERVER_IDENTIFIER)
    }

    pub(crate) fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.options.ipv4_dhcp(DHO_SUBNET_MASK)
    }

    /// Synthesize expiry/renewal/rebind for a BOOTP lease.
    pub(crate) fn set_bootp_times(&mut self, now: i64) {
        self.expiry = clamped_add(now, BOOTP_EXPIRY_OFFSET);
        self.renewal = clamped_add(now, BOOTP_RENEWAL_OFFSET);
        self.rebind = clamped_add(now, BOOTP_REBIND_OFFSET);
    }

    /// Derive the absolute lease deadlines from the ACK options.
    ///
    /// A missing or zero lease time rejects the lease. The renewal time
    /// defaults to half the lease plus one and gets randomized to
    /// desynchronize clients sharing a server; the rebind time defaults
    /// to 7/8 of the lease. All offsets are clamped against overflow
    /// before and after conversion to absolute time.
    pub(crate) fn compute_times(
        &mut self,
        now: i64,
    ) -> Result<(), DhcpError> {
        let expiry = i64::from(
            self.options.u32_dhcp(DHO_LEASE_TIME).unwrap_or(0),
        );
        if expiry == 0 {
            return Err(DhcpError::new(
                ErrorKind::InvalidDhcpMessage,
                "no expiry time on offered lease".to_string(),
            ));
        }

        let mut renewal = i64::from(
            self.options.u32_dhcp(DHO_RENEWAL_TIME).unwrap_or(0),
        );
        if renewal == 0 {
            renewal = expiry / 2 + 1;
        }
        if renewal <= (TIME_MAX / 3) - 3 {
            renewal = ((renewal * 3) + 3) / 4
                + (rand::thread_rng().gen_range(0..renewal) + 3) / 4;
        }

        let mut rebind = i64::from(
            self.options.u32_dhcp(DHO_REBINDING_TIME).unwrap_or(0),
        );
        if rebind == 0 {
            rebind = if expiry <= TIME_MAX / 7 {
                expiry * 7 / 8
            } else {
                expiry / 8 * 7
            };
        }

        // The randomization above must not push renewal past rebind.
        if renewal > rebind {
            renewal = if rebind <= TIME_MAX / 3 {
                rebind * 3 / 4
            } else {
                rebind / 4 * 3
            };
        }

        self.expiry = clamped_add(now, expiry);
        self.renewal = clamped_add(now, renewal);
        self.rebind = clamped_add(now, rebind);
        Ok(())
    }

    /// `renewal <= rebind <= expiry` must hold for any committed lease.
    pub(crate) fn times_ordered(&self) -> bool {
        self.renewal <= self.rebind && self.rebind <= self.expiry
    }
}
