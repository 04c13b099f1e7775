// SPDX-License-Identifier: Apache-2.0

pub(crate) mod options;
pub(crate) mod packet;

pub use self::options::{Dhcp4Options, OptionValue, Universe};
pub use self::packet::{Dhcp4MessageType, Dhcp4Packet};
