// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use crate::{
    client::ClientLease,
    dhcpv4::options::{
        option_env_name, pretty_print_option, DHO_BROADCAST_ADDRESS,
        DHO_DOMAIN_NAME, DHO_DOMAIN_SEARCH, DHO_HOST_NAME, DHO_NETBIOS_SCOPE,
        DHO_NIS_DOMAIN, DHO_SUBNET_MASK, Universe,
    },
    DhcpError, ErrorKind,
};

const SCRIPT_PATH_ENV: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Why the external script is being invoked. The string form is the
/// `reason` variable of the script contract.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ScriptReason {
    Bound,
    Renew,
    Rebind,
    Reboot,
    Expire,
    Fail,
    /// No broadcast interfaces were found at startup.
    Nbi,
    Preinit,
    Medium,
    Release,
    Stop,
    Timeout,
}

impl std::fmt::Display for ScriptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Bound => "BOUND",
                Self::Renew => "RENEW",
                Self::Rebind => "REBIND",
                Self::Reboot => "REBOOT",
                Self::Expire => "EXPIRE",
                Self::Fail => "FAIL",
                Self::Nbi => "NBI",
                Self::Preinit => "PREINIT",
                Self::Medium => "MEDIUM",
                Self::Release => "RELEASE",
                Self::Stop => "STOP",
                Self::Timeout => "TIMEOUT",
            }
        )
    }
}

/// The set of named parameters handed to one script invocation.
/// Construction mirrors the acquisition flow: the common variables
/// first, then one `write_params` call per lease role prefix.
#[derive(Debug, Clone, Default)]
pub struct ScriptEnv {
    vars: Vec<(String, String)>,
}

impl ScriptEnv {
    pub fn new(
        reason: ScriptReason,
        iface: &str,
        client: Option<&str>,
        medium: Option<&str>,
    ) -> Self {
        let mut env = Self { vars: Vec::new() };
        env.add("", "interface", iface);
        if let Some(client) = client {
            env.add("", "client", client);
        }
        if let Some(medium) = medium {
            env.add("", "medium", medium);
        }
        env.add("", "reason", reason.to_string().as_str());
        env.add("", "pid", std::process::id().to_string().as_str());
        env
    }

    fn add(&mut self, prefix: &str, name: &str, value: &str) {
        self.vars
            .push((format!("{prefix}{name}"), value.to_string()));
    }

    pub fn vars(&self) -> &[(String, String)] {
        self.vars.as_slice()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Add the details of one lease under a role prefix (`new_`,
    /// `old_`, `alias_`, `requested_`). Computed values cover what the
    /// script cannot derive itself: the network number and the
    /// all-ones broadcast address from the subnet mask.
    pub fn write_params(&mut self, prefix: &str, lease: &ClientLease) {
        self.add(prefix, "ip_address", lease.address.to_string().as_str());

        if lease.next_server != Ipv4Addr::UNSPECIFIED {
            self.add(
                prefix,
                "next_server",
                lease.next_server.to_string().as_str(),
            );
        }

        if let Some(mask) = lease.subnet_mask() {
            let subnet = Ipv4Addr::from(
                u32::from(lease.address) & u32::from(mask),
            );
            self.add(prefix, "network_number", subnet.to_string().as_str());
            if lease
                .options
                .evaluate_dhcp(DHO_BROADCAST_ADDRESS)
                .is_none()
            {
                let broadcast =
                    Ipv4Addr::from(u32::from(subnet) | !u32::from(mask));
                self.add(
                    prefix,
                    "broadcast_address",
                    broadcast.to_string().as_str(),
                );
            }
        }

        if let Some(filename) = lease.filename.as_ref() {
            if check_path_value(filename) {
                self.add(prefix, "filename", filename);
            } else {
                log::error!("suspect value in filename option - discarded");
            }
        }
        if let Some(server_name) = lease.server_name.as_ref() {
            if check_domain_name(server_name) {
                self.add(prefix, "server_name", server_name);
            } else {
                log::error!(
                    "suspect value in server-name option - discarded"
                );
            }
        }

        for (code, value) in lease.options.iter_universe(&Universe::Dhcp) {
            let data = match value.evaluate(code) {
                Ok(d) if !d.is_empty() => d,
                _ => continue,
            };
            let printed = pretty_print_option(code, &data, false);
            if !check_option_value(code, &printed) {
                log::error!(
                    "suspect value in {} option - discarded",
                    option_env_name(&Universe::Dhcp, code)
                );
                continue;
            }
            self.add(
                prefix,
                option_env_name(&Universe::Dhcp, code).as_str(),
                printed.as_str(),
            );
        }

        self.add(prefix, "expiry", lease.expiry.to_string().as_str());
    }

    /// One `requested_<name>=1` variable per entry of the configured
    /// parameter-request list.
    pub fn write_requested(&mut self, requested_options: &[u8]) {
        for code in requested_options {
            self.add(
                "requested_",
                option_env_name(&Universe::Dhcp, *code).as_str(),
                "1",
            );
        }
    }
}

/// Options whose values end up in shell context must stay inside a
/// conservative character set.
fn check_option_value(code: u8, value: &str) -> bool {
    match code {
        DHO_DOMAIN_NAME | DHO_DOMAIN_SEARCH => check_domain_name_list(value),
        DHO_HOST_NAME | DHO_NIS_DOMAIN | DHO_NETBIOS_SCOPE => {
            check_domain_name(value)
        }
        _ => true,
    }
}

/// RFC 952/1123-shaped label check: 1-63 characters, alphanumerics plus
/// `-` and `_`, no leading or trailing `-`/`_`, optional trailing dot.
pub(crate) fn check_domain_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return false;
    }
    name.split('.').all(|label| {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return false;
        }
        let first = label.chars().next().unwrap_or('-');
        let last = label.chars().last().unwrap_or('-');
        !matches!(first, '-' | '_') && !matches!(last, '-' | '_')
    })
}

pub(crate) fn check_domain_name_list(list: &str) -> bool {
    let mut any = false;
    for name in list.split_whitespace() {
        if !check_domain_name(name) {
            return false;
        }
        any = true;
    }
    any
}

/// Character set for path-like values (boot file names).
pub(crate) fn check_path_value(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(
                    c,
                    '#' | '%' | '+' | '-' | '_' | ':' | '.' | ','
                        | '@' | '~' | '\\' | '/' | '[' | ']' | '=' | ' '
                )
        })
}

/// Invokes the external program that installs and removes addresses.
/// The call blocks on purpose: the dispatcher must not race the script
/// that is still configuring the interface.
pub trait ScriptRunner: std::fmt::Debug {
    /// Returns the child's exit status, or minus the signal number if
    /// it was terminated by a signal.
    fn run(&self, env: &ScriptEnv) -> Result<i32, DhcpError>;
}

#[derive(Debug, Clone)]
pub struct ExecScript {
    path: String,
}

impl ExecScript {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

impl ScriptRunner for ExecScript {
    fn run(&self, env: &ScriptEnv) -> Result<i32, DhcpError> {
        let mut cmd = Command::new(self.path.as_str());
        cmd.env_clear();
        cmd.env("PATH", SCRIPT_PATH_ENV);
        for (key, value) in env.vars() {
            cmd.env(key, value);
        }
        let status = cmd.status().map_err(|e| {
            let e = DhcpError::new(
                ErrorKind::ScriptFailed,
                format!("Failed to execute {}: {e}", self.path),
            );
            log::error!("{e}");
            e
        })?;
        match status.code() {
            Some(code) => Ok(code),
            None => Ok(-status.signal().unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcpv4::options::{
        DHO_DOMAIN_NAME_SERVERS, DHO_LEASE_TIME, DHO_ROUTERS,
    };

    fn sample_lease() -> ClientLease {
        let mut lease = ClientLease {
            address: Ipv4Addr::new(192, 0, 2, 50),
            next_server: Ipv4Addr::new(192, 0, 2, 2),
            expiry: 1_700_000_600,
            ..Default::default()
        };
        lease
            .options
            .save_dhcp_raw(DHO_SUBNET_MASK, &[255, 255, 255, 224]);
        lease
            .options
            .save_dhcp_raw(DHO_ROUTERS, &[192, 0, 2, 33]);
        lease.options.save_dhcp_raw(
            DHO_DOMAIN_NAME_SERVERS,
            &[192, 0, 2, 53, 192, 0, 2, 54],
        );
        lease
            .options
            .save_dhcp_raw(DHO_LEASE_TIME, &600u32.to_be_bytes());
        lease
    }

    #[test]
    fn test_env_common_vars() {
        let env = ScriptEnv::new(
            ScriptReason::Bound,
            "eth0",
            None,
            Some("media ethernet"),
        );
        assert_eq!(env.get("reason"), Some("BOUND"));
        assert_eq!(env.get("interface"), Some("eth0"));
        assert_eq!(env.get("medium"), Some("media ethernet"));
        assert!(env.get("pid").is_some());
    }

    #[test]
    fn test_write_params_computed_values() {
        let mut env = ScriptEnv::new(ScriptReason::Bound, "eth0", None, None);
        env.write_params("new_", &sample_lease());
        assert_eq!(env.get("new_ip_address"), Some("192.0.2.50"));
        assert_eq!(env.get("new_next_server"), Some("192.0.2.2"));
        assert_eq!(env.get("new_network_number"), Some("192.0.2.32"));
        assert_eq!(env.get("new_broadcast_address"), Some("192.0.2.63"));
        assert_eq!(env.get("new_subnet_mask"), Some("255.255.255.224"));
        assert_eq!(
            env.get("new_domain_name_servers"),
            Some("192.0.2.53 192.0.2.54")
        );
        assert_eq!(env.get("new_expiry"), Some("1700000600"));
    }

    #[test]
    fn test_explicit_broadcast_option_wins() {
        let mut lease = sample_lease();
        lease
            .options
            .save_dhcp_raw(DHO_BROADCAST_ADDRESS, &[192, 0, 2, 63]);
        let mut env = ScriptEnv::new(ScriptReason::Bound, "eth0", None, None);
        env.write_params("new_", &lease);
        // The computed value defers to the server-provided option.
        assert_eq!(env.get("new_broadcast_address"), Some("192.0.2.63"));
    }

    #[test]
    fn test_write_requested() {
        let mut env = ScriptEnv::new(ScriptReason::Bound, "eth0", None, None);
        env.write_requested(&[DHO_SUBNET_MASK, DHO_DOMAIN_NAME_SERVERS]);
        assert_eq!(env.get("requested_subnet_mask"), Some("1"));
        assert_eq!(env.get("requested_domain_name_servers"), Some("1"));
    }

    #[test]
    fn test_suspect_domain_name_discarded() {
        let mut lease = sample_lease();
        lease
            .options
            .save_dhcp_raw(DHO_DOMAIN_NAME, b"evil.example; rm -rf /");
        let mut env = ScriptEnv::new(ScriptReason::Bound, "eth0", None, None);
        env.write_params("new_", &lease);
        assert_eq!(env.get("new_domain_name"), None);
    }

    #[test]
    fn test_check_domain_name() {
        assert!(check_domain_name("example.org"));
        assert!(check_domain_name("example.org."));
        assert!(check_domain_name("host_1.example"));
        assert!(!check_domain_name(""));
        assert!(!check_domain_name("-leading.example"));
        assert!(!check_domain_name("trailing-.example"));
        assert!(!check_domain_name("bad..example"));
        assert!(!check_domain_name("label!.example"));
        let long = "a".repeat(64);
        assert!(!check_domain_name(&format!("{long}.example")));
    }

    #[test]
    fn test_check_path_value() {
        assert!(check_path_value("/pxe/loader-1.0_x86"));
        assert!(!check_path_value("/pxe/$(reboot)"));
        assert!(!check_path_value(""));
    }
}
