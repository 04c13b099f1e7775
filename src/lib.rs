// SPDX-License-Identifier: Apache-2.0

mod bpf;
mod buffer;
mod client;
mod dhcpv4;
mod dispatch;
mod duid;
mod error;
mod iface;
mod journal;
mod net;
mod script;
mod time;
mod timer;

pub use crate::client::{
    ClientConfig, ClientCtx, ClientLease, ClientState, Dhcp4Client,
    TimerEvent, TimerToken,
};
pub use crate::dhcpv4::{
    Dhcp4MessageType, Dhcp4Options, Dhcp4Packet, OptionValue, Universe,
};
pub use crate::dispatch::{
    install_signal_handlers, request_shutdown, Dispatcher,
};
pub use crate::duid::Duid;
pub use crate::error::{DhcpError, ErrorKind};
pub(crate) use crate::error::ErrorContext;
pub use crate::iface::{HwAddr, Iface};
pub use crate::journal::{JournalEntry, LeaseJournal};
pub use crate::net::{NetTransport, Transport};
pub use crate::script::{ExecScript, ScriptEnv, ScriptReason, ScriptRunner};
pub use crate::timer::{TimerHandle, TimerWheel};
