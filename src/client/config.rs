// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use super::lease::ClientLease;
use crate::dhcpv4::options::{
    DHO_BROADCAST_ADDRESS, DHO_DOMAIN_NAME, DHO_DOMAIN_NAME_SERVERS,
    DHO_HOST_NAME, DHO_ROUTERS, DHO_SUBNET_MASK, DHO_TIME_OFFSET,
};

const DEFAULT_TIMEOUT: i64 = 60;
const DEFAULT_INITIAL_INTERVAL: i64 = 10;
const DEFAULT_SELECT_INTERVAL: i64 = 0;
const DEFAULT_REBOOT_TIMEOUT: i64 = 10;
const DEFAULT_BACKOFF_CUTOFF: i64 = 15;
const DEFAULT_RETRY_INTERVAL: i64 = 300;
// RFC 2131 3.1.5: a client SHOULD wait a minimum of ten seconds before
// restarting configuration after a decline.
const DEFAULT_DECLINE_WAIT: i64 = 10;

const DEFAULT_SCRIPT_PATH: &str = "/sbin/dhclient-script";

/// Per-client knobs, normally filled in by the configuration-file
/// parser, which is an external collaborator.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Name of the client config block, if any; exported to the script
    /// as `client`.
    pub(crate) client_name: Option<String>,
    /// Panic deadline: give up on the current wait state this many
    /// seconds after the first transmission.
    pub(crate) timeout: i64,
    pub(crate) initial_interval: i64,
    /// How long to keep collecting offers after the first DISCOVER.
    pub(crate) select_interval: i64,
    pub(crate) reboot_timeout: i64,
    pub(crate) backoff_cutoff: i64,
    pub(crate) retry_interval: i64,
    pub(crate) decline_wait: i64,
    /// Parameter-request list sent to servers.
    pub(crate) requested_options: Vec<u8>,
    /// Offers missing any of these options are ignored.
    pub(crate) required_options: Vec<u8>,
    pub(crate) requested_address: Option<Ipv4Addr>,
    pub(crate) host_name: Option<String>,
    /// RFC 2132 9.14 client identifier, type byte included.
    pub(crate) client_id: Option<Vec<u8>>,
    /// Media settings to cycle through while no offer arrives.
    pub(crate) media: Vec<String>,
    /// Give up (exit code 2) instead of retrying forever.
    pub(crate) onetry: bool,
    /// The interface can receive unicast before it is configured, so
    /// replies need not be broadcast.
    pub(crate) can_receive_unicast: bool,
    /// Servers to ignore, as address/mask pairs.
    pub(crate) reject_list: Vec<(Ipv4Addr, Ipv4Addr)>,
    /// Fallback leases from the configuration file.
    pub(crate) static_leases: Vec<ClientLease>,
    pub(crate) script_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            timeout: DEFAULT_TIMEOUT,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            select_interval: DEFAULT_SELECT_INTERVAL,
            reboot_timeout: DEFAULT_REBOOT_TIMEOUT,
            backoff_cutoff: DEFAULT_BACKOFF_CUTOFF,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            decline_wait: DEFAULT_DECLINE_WAIT,
            requested_options: vec![
                DHO_SUBNET_MASK,
                DHO_BROADCAST_ADDRESS,
                DHO_TIME_OFFSET,
                DHO_ROUTERS,
                DHO_DOMAIN_NAME,
                DHO_DOMAIN_NAME_SERVERS,
                DHO_HOST_NAME,
            ],
            required_options: Vec::new(),
            requested_address: None,
            host_name: None,
            client_id: None,
            media: Vec::new(),
            onetry: false,
            can_receive_unicast: false,
            reject_list: Vec::new(),
            static_leases: Vec::new(),
            script_path: DEFAULT_SCRIPT_PATH.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timeout(&mut self, timeout: i64) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_select_interval(&mut self, interval: i64) -> &mut Self {
        self.select_interval = interval;
        self
    }

    pub fn set_host_name(&mut self, host_name: &str) -> &mut Self {
        self.host_name = Some(host_name.to_string());
        self
    }

    pub fn set_client_id(
        &mut self,
        client_id_type: u8,
        client_id: &[u8],
    ) -> &mut Self {
        let mut data = vec![client_id_type];
        data.extend_from_slice(client_id);
        self.client_id = Some(data);
        self
    }

    pub fn set_requested_address(&mut self, address: Ipv4Addr) -> &mut Self {
        self.requested_address = Some(address);
        self
    }

    pub fn set_onetry(&mut self, onetry: bool) -> &mut Self {
        self.onetry = onetry;
        self
    }

    pub fn set_client_name(&mut self, name: &str) -> &mut Self {
        self.client_name = Some(name.to_string());
        self
    }

    /// Append a medium setting to cycle through while discovery gets
    /// no offers.
    pub fn add_medium(&mut self, medium: &str) -> &mut Self {
        self.media.push(medium.to_string());
        self
    }

    pub fn set_script_path(&mut self, path: &str) -> &mut Self {
        self.script_path = path.to_string();
        self
    }

    pub fn add_required_option(&mut self, code: u8) -> &mut Self {
        self.required_options.push(code);
        self
    }

    pub fn add_static_lease(&mut self, mut lease: ClientLease) -> &mut Self {
        lease.is_static = true;
        self.static_leases.push(lease);
        self
    }

    pub fn add_reject(&mut self, address: Ipv4Addr, mask: Ipv4Addr) {
        self.reject_list.push((address, mask));
    }

    pub(crate) fn is_rejected(&self, address: Ipv4Addr) -> bool {
        self.reject_list.iter().any(|(addr, mask)| {
            u32::from(address) & u32::from(*mask)
                == u32::from(*addr) & u32::from(*mask)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_list_match() {
        let mut config = ClientConfig::new();
        config.add_reject(
            Ipv4Addr::new(192, 0, 2, 7),
            Ipv4Addr::new(255, 255, 255, 255),
        );
        config.add_reject(
            Ipv4Addr::new(198, 51, 100, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert!(config.is_rejected(Ipv4Addr::new(192, 0, 2, 7)));
        assert!(!config.is_rejected(Ipv4Addr::new(192, 0, 2, 8)));
        assert!(config.is_rejected(Ipv4Addr::new(198, 51, 100, 200)));
    }
}
