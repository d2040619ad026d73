// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::capability::AfiSafi;
use crate::{
    BGP_PORT, DEFAULT_CONNECT_RETRY_TIME, DEFAULT_GR_RESTART_TIME,
    DEFAULT_GR_STALE_PATH_TIME,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Local autonomous system number.
    #[serde(default)]
    pub asn: u32,

    #[serde(default)]
    pub router_id: Option<Ipv4Addr>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Address the dispatcher listens on.
    #[serde(default = "default_listen")]
    pub listen: IpAddr,

    #[serde(default)]
    pub graceful_restart: bool,

    /// Seconds.
    #[serde(default = "default_restart_time")]
    pub restart_time: u16,

    /// Seconds.
    #[serde(default = "default_stale_path_time")]
    pub stale_path_time: u16,

    #[serde(default)]
    pub neighbors: Vec<NeighborConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            asn: 0,
            router_id: None,
            port: BGP_PORT,
            listen: default_listen(),
            graceful_restart: false,
            restart_time: DEFAULT_GR_RESTART_TIME,
            stale_path_time: DEFAULT_GR_STALE_PATH_TIME,
            neighbors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NeighborConfig {
    pub address: IpAddr,

    #[serde(default)]
    pub remote_as: Option<u32>,

    /// Address families such as `"ipv4-unicast"`.
    #[serde(default)]
    pub afi_safi: Vec<AfiSafi>,

    /// Wait for the peer to connect instead of connecting out.
    #[serde(default)]
    pub passive: bool,

    #[serde(default)]
    pub reflector_client: bool,

    /// Hold time proposed in our OPEN, in seconds. Falls back to 90.
    #[serde(default)]
    pub hold_time: Option<u16>,

    /// Seconds between connection attempts.
    #[serde(default = "default_connect_retry_time")]
    pub connect_retry_time: u64,

    /// Peer's BGP port.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub dont_cap_all: bool,

    #[serde(default)]
    pub dont_cap_4as: bool,

    #[serde(default)]
    pub dont_cap_refresh: bool,
}

impl NeighborConfig {
    pub fn connect_retry_time(&self) -> Duration {
        Duration::from_secs(self.connect_retry_time)
    }
}

fn default_port() -> u16 {
    BGP_PORT
}

fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_restart_time() -> u16 {
    DEFAULT_GR_RESTART_TIME
}

fn default_stale_path_time() -> u16 {
    DEFAULT_GR_STALE_PATH_TIME
}

fn default_connect_retry_time() -> u64 {
    DEFAULT_CONNECT_RETRY_TIME.as_secs()
}
