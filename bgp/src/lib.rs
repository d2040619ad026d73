// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod aspath;
pub mod attributes;
pub mod capability;
pub mod clock;
pub mod community;
pub mod config;
pub mod connection;
pub mod connection_tcp;
pub mod dispatcher;
pub mod error;
pub mod log;
pub mod messages;
pub mod neighbor;
pub mod server;
pub mod session;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
pub mod connection_channel;

use std::net::IpAddr;
use std::time::Duration;

pub const BGP_PORT: u16 = 179;
pub const COMPONENT_BGP: &str = "bgp";
pub const MOD_SERVER: &str = "server";
pub const MOD_NEIGHBOR: &str = "neighbor";
pub const MOD_CLOCK: &str = "clock";

/// How long blocking receives wait before re-checking their stop flag.
pub const IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Depth of each FSM event queue.
pub const EVENT_QUEUE_SIZE: usize = 1024;

/// Depth of each outbound message queue.
pub const SEND_QUEUE_SIZE: usize = 1024;

/// Hold time proposed when a neighbor has none configured.
pub const DEFAULT_HOLD_TIME: u16 = 90;

pub const DEFAULT_CONNECT_RETRY_TIME: Duration = Duration::from_secs(3);

/// Delay before an FSM that fell back to idle starts itself again.
pub const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(1);

pub const DEFAULT_GR_RESTART_TIME: u16 = 120;
pub const DEFAULT_GR_STALE_PATH_TIME: u16 = 360;

/// Map IPv4-mapped IPv6 addresses back onto plain IPv4 so a peer is found
/// under the address it was configured with.
pub fn to_canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        v4 => v4,
    }
}
