// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::capability::{
    AfiSafi, Capability, GracefulRestartTuple, GR_FORWARDING_PRESERVED,
    GR_RESTART_FLAG,
};
use crate::error::Error;
use crate::messages::{MessageType, OpenMessage};
use crate::session::FsmStateKind;
use crate::{
    BGP_PORT, DEFAULT_CONNECT_RETRY_TIME, DEFAULT_GR_RESTART_TIME,
    DEFAULT_GR_STALE_PATH_TIME, DEFAULT_HOLD_TIME,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use speaker_common::lock;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Server wide graceful restart settings (RFC 4724).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GracefulRestart {
    pub enabled: bool,
    pub restart_time: u16,
    pub stale_path_time: u16,

    /// Set while this speaker is itself restarting.
    pub restarting: bool,

    /// Forwarding state was kept across the restart.
    pub preserved: bool,
}

impl Default for GracefulRestart {
    fn default() -> Self {
        Self {
            enabled: false,
            restart_time: DEFAULT_GR_RESTART_TIME,
            stale_path_time: DEFAULT_GR_STALE_PATH_TIME,
            restarting: false,
            preserved: false,
        }
    }
}

/// What an FSM needs to know about the local speaker.
#[derive(Debug, Clone)]
pub struct LocalSpeaker {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub graceful_restart: Arc<Mutex<GracefulRestart>>,
}

/// Per-neighbor configuration. Written by the server's command thread,
/// read by the neighbor's FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSettings {
    pub remote_as: Option<u32>,
    pub afi_safi: BTreeSet<AfiSafi>,

    /// Wait for the peer to connect instead of connecting out.
    pub passive: bool,

    /// Hold time to propose. Unset means [`DEFAULT_HOLD_TIME`].
    pub hold_time: Option<u16>,
    pub connect_retry_time: Duration,
    pub port: u16,
    pub reflector_client: bool,
    pub dont_cap_all: bool,
    pub dont_cap_4as: bool,
    pub dont_cap_refresh: bool,
}

impl Default for NeighborSettings {
    fn default() -> Self {
        Self {
            remote_as: None,
            afi_safi: BTreeSet::new(),
            passive: false,
            hold_time: None,
            connect_retry_time: DEFAULT_CONNECT_RETRY_TIME,
            port: BGP_PORT,
            reflector_client: false,
            dont_cap_all: false,
            dont_cap_4as: false,
            dont_cap_refresh: false,
        }
    }
}

impl NeighborSettings {
    pub fn hold_time(&self) -> u16 {
        self.hold_time.unwrap_or(DEFAULT_HOLD_TIME)
    }

    /// A neighbor can start once it knows who it talks to and about what.
    pub fn is_runnable(&self) -> bool {
        self.remote_as.is_some() && !self.afi_safi.is_empty()
    }

    /// Capabilities advertised in our OPEN. One multiprotocol capability per
    /// configured address family, then 4-octet AS, route refresh and
    /// graceful restart unless suppressed.
    pub fn capabilities(
        &self,
        local_asn: u32,
        gr: &GracefulRestart,
    ) -> Vec<Capability> {
        if self.dont_cap_all {
            return Vec::new();
        }
        let mut caps: Vec<Capability> = self
            .afi_safi
            .iter()
            .map(|a| Capability::MultiProtocol {
                afi: a.afi as u16,
                safi: a.safi as u8,
            })
            .collect();
        if !self.dont_cap_4as {
            caps.push(Capability::FourOctetAs { asn: local_asn });
        }
        if !self.dont_cap_refresh {
            caps.push(Capability::RouteRefresh);
        }
        if gr.enabled {
            let tuple_flags = if gr.preserved {
                GR_FORWARDING_PRESERVED
            } else {
                0
            };
            caps.push(Capability::GracefulRestart {
                flags: if gr.restarting { GR_RESTART_FLAG } else { 0 },
                restart_time: gr.restart_time,
                tuples: self
                    .afi_safi
                    .iter()
                    .map(|a| GracefulRestartTuple {
                        afi: a.afi as u16,
                        safi: a.safi as u8,
                        flags: tuple_flags,
                    })
                    .collect(),
            });
        }
        caps
    }
}

/// Session status as last written by the FSM.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: FsmStateKind,

    /// Negotiated hold time, zero until an OPEN is processed.
    pub hold_time: u16,
    pub keepalive_time: u16,
    pub local_caps: Vec<Capability>,
    pub remote_caps: Vec<Capability>,
    pub remote_id: Option<Ipv4Addr>,
    pub remote_asn: Option<u32>,

    /// Last time the session came up, or when the neighbor was created.
    pub uptime: DateTime<Utc>,
    pub connect_retry_counter: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: FsmStateKind::Idle,
            hold_time: 0,
            keepalive_time: 0,
            local_caps: Vec::new(),
            remote_caps: Vec::new(),
            remote_id: None,
            remote_asn: None,
            uptime: Utc::now(),
            connect_retry_counter: 0,
        }
    }
}

/// Message counters for one direction of a session.
#[derive(Debug, Default)]
pub struct MessageCounters {
    pub open: AtomicU64,
    pub update: AtomicU64,
    pub keepalive: AtomicU64,
    pub notification: AtomicU64,
    pub refresh: AtomicU64,
    pub capability: AtomicU64,
    pub prefix: AtomicU64,
}

impl MessageCounters {
    pub fn count(&self, kind: MessageType) {
        let c = match kind {
            MessageType::Open => &self.open,
            MessageType::Update => &self.update,
            MessageType::KeepAlive => &self.keepalive,
            MessageType::Notification => &self.notification,
            MessageType::RouteRefresh | MessageType::RouteRefreshOld => {
                &self.refresh
            }
            MessageType::Capability => &self.capability,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_prefixes(&self, n: usize) {
        self.prefix.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> MessageCount {
        MessageCount {
            open: self.open.load(Ordering::Relaxed),
            update: self.update.load(Ordering::Relaxed),
            keepalive: self.keepalive.load(Ordering::Relaxed),
            notification: self.notification.load(Ordering::Relaxed),
            refresh: self.refresh.load(Ordering::Relaxed),
            capability: self.capability.load(Ordering::Relaxed),
            prefix: self.prefix.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageCount {
    pub open: u64,
    pub update: u64,
    pub keepalive: u64,
    pub notification: u64,
    pub refresh: u64,
    pub capability: u64,
    pub prefix: u64,
}

impl MessageCount {
    /// Total messages. Prefixes are not messages and are left out.
    pub fn sum(&self) -> u64 {
        self.open
            + self.update
            + self.keepalive
            + self.notification
            + self.refresh
            + self.capability
    }
}

pub struct Neighbor {
    pub addr: IpAddr,
    settings: Mutex<NeighborSettings>,
    session: Mutex<SessionStatus>,
    pub counters_in: MessageCounters,
    pub counters_out: MessageCounters,

    /// A start event has been issued to the current FSM.
    running: AtomicBool,
}

impl Neighbor {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            settings: Mutex::new(NeighborSettings::default()),
            session: Mutex::new(SessionStatus::default()),
            counters_in: MessageCounters::default(),
            counters_out: MessageCounters::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> NeighborSettings {
        lock!(self.settings).clone()
    }

    pub fn session(&self) -> SessionStatus {
        lock!(self.session).clone()
    }

    pub fn state(&self) -> FsmStateKind {
        lock!(self.session).state
    }

    pub fn is_runnable(&self) -> bool {
        lock!(self.settings).is_runnable()
    }

    pub fn set_remote_as(&self, asn: u32) -> Result<(), Error> {
        let mut s = lock!(self.settings);
        if s.remote_as.is_some() {
            return Err(Error::AsAlreadySet);
        }
        s.remote_as = Some(asn);
        Ok(())
    }

    pub fn add_afi_safi(&self, afi_safi: AfiSafi) -> Result<(), Error> {
        if !lock!(self.settings).afi_safi.insert(afi_safi) {
            return Err(Error::AfiSafiExists(afi_safi.to_string()));
        }
        Ok(())
    }

    /// Apply `f` to the settings.
    pub fn configure(&self, f: impl FnOnce(&mut NeighborSettings)) {
        f(&mut lock!(self.settings))
    }

    pub(crate) fn update_session(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut lock!(self.session))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Build our OPEN for this neighbor and remember what it advertised.
    pub fn open_message(&self, local: &LocalSpeaker) -> OpenMessage {
        let settings = self.settings();
        let gr = *lock!(local.graceful_restart);
        let caps = settings.capabilities(local.asn, &gr);
        self.update_session(|s| s.local_caps = caps.clone());
        OpenMessage::new(local.asn, settings.hold_time(), local.router_id, caps)
    }

    /// Status column of the summary: the state name, or the number of
    /// received prefixes once established.
    pub fn state_or_prefixes(&self) -> String {
        match self.state() {
            FsmStateKind::Established => {
                self.counters_in.prefix.load(Ordering::Relaxed).to_string()
            }
            other => other.to_string(),
        }
    }

    /// One row of `show ip bgp summary`.
    pub fn summary_row(&self, now: DateTime<Utc>) -> String {
        let session = self.session();
        format!(
            "{:<16}4{:>6}{:>8}{:>8}{:>9}{:>5}{:>5}{:>9} {}\n",
            self.addr.to_string(),
            self.settings().remote_as.unwrap_or(0),
            self.counters_in.get().sum(),
            self.counters_out.get().sum(),
            0,
            0,
            0,
            uptime_string(now - session.uptime),
            self.state_or_prefixes(),
        )
    }

    pub fn info(&self) -> NeighborInfo {
        let settings = self.settings();
        let session = self.session();
        NeighborInfo {
            addr: self.addr,
            remote_as: settings.remote_as,
            afi_safi: settings.afi_safi.into_iter().collect(),
            passive: settings.passive,
            reflector_client: settings.reflector_client,
            state: session.state.to_string(),
            hold_time: session.hold_time,
            keepalive_time: session.keepalive_time,
            uptime: session.uptime,
            received: self.counters_in.get(),
            sent: self.counters_out.get(),
        }
    }
}

/// Point in time view of a neighbor, as returned by a lookup.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborInfo {
    pub addr: IpAddr,
    pub remote_as: Option<u32>,
    pub afi_safi: Vec<AfiSafi>,
    pub passive: bool,
    pub reflector_client: bool,
    pub state: String,
    pub hold_time: u16,
    pub keepalive_time: u16,
    pub uptime: DateTime<Utc>,
    pub received: MessageCount,
    pub sent: MessageCount,
}

/// Format a session age the way router CLIs do: `hh:mm:ss` for the first
/// day, `NdHHhMMm` for the first week, `NNwNdHHh` after that.
pub fn uptime_string(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    let days = secs / 86400;
    let hours = secs / 3600 % 24;
    let mins = secs / 60 % 60;
    let secs = secs % 60;
    if days == 0 {
        format!("{hours:02}:{mins:02}:{secs:02}")
    } else if days < 7 {
        format!("{days}d{hours:02}h{mins:02}m")
    } else {
        format!("{:02}w{}d{hours:02}h", days / 7, days % 7)
    }
}
