// SPDX-License-Identifier: Apache-2.0

use super::lease::ClientLease;

/// Protocol state of one client, RFC 2131 figure 5. States that hold
/// an address carry it as payload, so a BOUND client without a lease
/// cannot be expressed.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub enum ClientState {
    /// No lease and nothing in flight yet.
    #[default]
    Init,
    /// DHCPDISCOVER sent, collecting offers. Head of the list is the
    /// preferred offer.
    Selecting { offered: Vec<ClientLease> },
    /// DHCPREQUEST sent for the chosen offer, awaiting the ACK.
    Requesting { lease: ClientLease },
    /// Verifying a remembered lease from the database at startup.
    Rebooting { lease: ClientLease },
    /// The lease is installed; waiting for T1.
    Bound { lease: ClientLease },
    /// T1 passed, unicasting renewal requests to the leasing server.
    Renewing { lease: ClientLease },
    /// T2 passed, broadcasting renewal requests to any server.
    Rebinding { lease: ClientLease },
    /// The script reported an address collision; a DHCPDECLINE went
    /// out and INIT re-entry is pending.
    Declining,
    /// Released or shut down; no timers, no transmissions.
    Stopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Selecting { .. } => write!(f, "SELECTING"),
            Self::Requesting { .. } => write!(f, "REQUESTING"),
            Self::Rebooting { .. } => write!(f, "REBOOTING"),
            Self::Bound { lease } => write!(f, "BOUND({})", lease.address),
            Self::Renewing { .. } => write!(f, "RENEWING"),
            Self::Rebinding { .. } => write!(f, "REBINDING"),
            Self::Declining => write!(f, "DECLINING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl ClientState {
    /// The lease installed on the interface, when this state has one.
    /// The REBOOTING lease is remembered rather than installed; the
    /// REQUESTING payload is only a chosen offer. Neither counts.
    pub fn active_lease(&self) -> Option<&ClientLease> {
        match self {
            Self::Bound { lease }
            | Self::Renewing { lease }
            | Self::Rebinding { lease } => Some(lease),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound { .. })
    }

    /// States in which a DHCPACK or DHCPNAK is acceptable; anywhere
    /// else the packet is silently discarded.
    pub(crate) fn expects_ack(&self) -> bool {
        matches!(
            self,
            Self::Rebooting { .. }
                | Self::Requesting { .. }
                | Self::Renewing { .. }
                | Self::Rebinding { .. }
        )
    }
}
