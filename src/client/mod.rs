// SPDX-License-Identifier: Apache-2.0

mod client;
mod config;
mod lease;
mod state;

#[cfg(test)]
mod scenario_tests;

pub use self::client::{ClientCtx, Dhcp4Client, TimerEvent, TimerToken};
pub use self::config::ClientConfig;
pub use self::lease::ClientLease;
pub use self::state::ClientState;
