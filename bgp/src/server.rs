// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The BGP server owns the neighbor table and every FSM. All configuration
//! changes run as commands on a single thread, one at a time, so the table
//! and the neighbors' settings only ever have one writer. Callers block until
//! their command has run and get its result back.

use crate::capability::AfiSafi;
use crate::config::{NeighborConfig, ServerConfig};
use crate::connection::{BgpConnection, BgpListener};
use crate::connection_tcp::{BgpConnectionTcp, BgpListenerTcp};
use crate::dispatcher::{Dispatcher, SessionMap};
use crate::error::Error;
use crate::log::server_log;
use crate::neighbor::{
    GracefulRestart, LocalSpeaker, Neighbor, NeighborInfo, NeighborSettings,
};
use crate::session::{Fsm, FsmEvent, FsmStateKind, SessionTiming};
use crate::{to_canonical, BGP_PORT, EVENT_QUEUE_SIZE};
use chrono::Utc;
use slog::Logger;
use speaker_common::lock;
use speaker_common::thread::StoppableThread;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

/// Server speaking over TCP.
pub type TcpServer = Server<BgpConnectionTcp, BgpListenerTcp>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Tear the session down and start it again.
    Hard,
    SoftBoth,
    SoftIn,
    SoftOut,
}

/// Which sessions a reset applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    All,
    Neighbor(IpAddr),
}

impl std::str::FromStr for ResetTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::All);
        }
        s.parse::<IpAddr>()
            .map(|a| Self::Neighbor(to_canonical(a)))
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}

type CommandFn<Cnx, L> = Box<dyn FnOnce(&mut ServerState<Cnx, L>) + Send>;

struct Command<Cnx: BgpConnection, L> {
    name: &'static str,
    run: CommandFn<Cnx, L>,
}

pub struct Server<Cnx: BgpConnection, L: BgpListener<Cnx>> {
    tx: SyncSender<Command<Cnx, L>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl<Cnx: BgpConnection, L: BgpListener<Cnx>> Server<Cnx, L> {
    /// Start a server for local AS `asn` that accepts connections on
    /// `listen`. Nothing runs until a router id is set.
    pub fn new(asn: u32, listen: IpAddr, log: Logger) -> Result<Self, Error> {
        Self::with_timing(asn, listen, SessionTiming::default(), log)
    }

    pub fn with_timing(
        asn: u32,
        listen: IpAddr,
        timing: SessionTiming,
        log: Logger,
    ) -> Result<Self, Error> {
        let (tx, rx) = sync_channel(EVENT_QUEUE_SIZE);
        let state = ServerState::<Cnx, L> {
            asn,
            router_id: None,
            listen,
            port: BGP_PORT,
            graceful_restart: Arc::default(),
            neighbors: BTreeMap::new(),
            sessions: Arc::default(),
            fsms: BTreeMap::new(),
            dispatcher: None,
            timing,
            reset_pending: false,
            exit: false,
            log: log.clone(),
            _listener: PhantomData,
        };
        let thread = Builder::new()
            .name("bgp-server".into())
            .spawn(move || command_loop(state, rx))?;
        server_log!(log, info, "server started";
            "asn" => asn,
            "listen" => listen.to_string()
        );
        Ok(Self {
            tx,
            thread: Mutex::new(Some(thread)),
            log,
        })
    }

    /// Run `f` on the command thread and wait for its result.
    fn call<T, F>(&self, name: &'static str, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut ServerState<Cnx, L>) -> Result<T, Error> + Send + 'static,
    {
        let (reply_tx, reply_rx) = sync_channel(1);
        let run: CommandFn<Cnx, L> = Box::new(move |state| {
            let result = f(state);
            // The caller sees the reset done, not pending.
            state.reset_if_pending();
            // The caller may have given up waiting.
            let _ = reply_tx.send(result);
        });
        self.tx
            .send(Command { name, run })
            .map_err(|_| Error::ServerGone)?;
        reply_rx.recv().map_err(|_| Error::ServerGone)?
    }

    /// Apply a whole configuration: router id first, then port, graceful
    /// restart and every neighbor in order.
    pub fn apply_config(&self, config: &ServerConfig) -> Result<(), Error> {
        if let Some(id) = config.router_id {
            self.router_id_set(IpAddr::V4(id))?;
        }
        self.port_set(config.port)?;
        if config.graceful_restart {
            self.graceful_restart_enable()?;
        }
        self.graceful_restart_time_set(
            config.restart_time,
            config.stale_path_time,
        )?;
        for n in &config.neighbors {
            self.neighbor_apply(n)?;
        }
        Ok(())
    }

    fn neighbor_apply(&self, n: &NeighborConfig) -> Result<(), Error> {
        self.neighbor_add(n.address)?;
        if let Some(asn) = n.remote_as {
            self.neighbor_remote_as_set(n.address, asn)?;
        }
        for afi_safi in &n.afi_safi {
            self.neighbor_afi_safi_set(n.address, *afi_safi)?;
        }
        let n = n.clone();
        self.neighbor_configure(n.address, move |s| {
            s.passive = n.passive;
            s.hold_time = n.hold_time;
            s.reflector_client = n.reflector_client;
            s.dont_cap_all = n.dont_cap_all;
            s.dont_cap_4as = n.dont_cap_4as;
            s.dont_cap_refresh = n.dont_cap_refresh;
            s.connect_retry_time = n.connect_retry_time();
            s.port = n.port;
        })
    }

    pub fn router_id_set(&self, id: IpAddr) -> Result<(), Error> {
        let id = match to_canonical(id) {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return Err(Error::InvalidRouterId(id.to_string())),
        };
        self.call("router id set", move |s| {
            if s.router_id == Some(id) {
                return Ok(());
            }
            server_log!(s.log, info, "router id {id}");
            s.router_id = Some(id);
            s.reset_pending = true;
            Ok(())
        })
    }

    pub fn router_id_unset(&self) -> Result<(), Error> {
        self.call("router id unset", |s| {
            if s.router_id.take().is_some() {
                server_log!(s.log, info, "router id cleared");
                s.reset_pending = true;
            }
            Ok(())
        })
    }

    /// Listen on `port`. The default port is the same as unsetting it.
    pub fn port_set(&self, port: u16) -> Result<(), Error> {
        self.call("port set", move |s| {
            if s.port != port {
                server_log!(s.log, info, "port {port}");
                s.port = port;
                s.reset_pending = true;
            }
            Ok(())
        })
    }

    pub fn port_unset(&self) -> Result<(), Error> {
        self.port_set(BGP_PORT)
    }

    pub fn neighbor_add(&self, addr: IpAddr) -> Result<(), Error> {
        let addr = to_canonical(addr);
        self.call("neighbor add", move |s| s.neighbor_add(addr))
    }

    pub fn neighbor_remote_as_set(
        &self,
        addr: IpAddr,
        asn: u32,
    ) -> Result<(), Error> {
        let addr = to_canonical(addr);
        self.call("neighbor remote-as set", move |s| {
            s.neighbor(addr)?.set_remote_as(asn)?;
            s.maybe_start(addr);
            Ok(())
        })
    }

    pub fn neighbor_afi_safi_set(
        &self,
        addr: IpAddr,
        afi_safi: AfiSafi,
    ) -> Result<(), Error> {
        let addr = to_canonical(addr);
        self.call("neighbor afi-safi set", move |s| {
            s.neighbor(addr)?.add_afi_safi(afi_safi)?;
            s.maybe_start(addr);
            Ok(())
        })
    }

    pub fn neighbor_reflector_client(
        &self,
        addr: IpAddr,
        enabled: bool,
    ) -> Result<(), Error> {
        self.neighbor_configure(addr, move |s| s.reflector_client = enabled)
    }

    /// Change settings that take effect the next time the session starts.
    pub fn neighbor_configure<F>(&self, addr: IpAddr, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut NeighborSettings) + Send + 'static,
    {
        let addr = to_canonical(addr);
        self.call("neighbor configure", move |s| {
            s.neighbor(addr)?.configure(f);
            s.maybe_start(addr);
            Ok(())
        })
    }

    pub fn neighbor_lookup(&self, addr: IpAddr) -> Result<NeighborInfo, Error> {
        let addr = to_canonical(addr);
        self.call("neighbor lookup", move |s| Ok(s.neighbor(addr)?.info()))
    }

    pub fn neighbor_list(&self) -> Result<Vec<NeighborInfo>, Error> {
        self.call("neighbor list", |s| {
            Ok(s.neighbors.values().map(|n| n.info()).collect())
        })
    }

    /// Shared handle on a neighbor, for watching its session.
    pub fn neighbor(&self, addr: IpAddr) -> Result<Arc<Neighbor>, Error> {
        let addr = to_canonical(addr);
        self.call("neighbor get", move |s| s.neighbor(addr).cloned())
    }

    pub fn graceful_restart_enable(&self) -> Result<(), Error> {
        self.graceful_restart_update("graceful restart enable", |gr| {
            gr.enabled = true
        })
    }

    pub fn graceful_restart_disable(&self) -> Result<(), Error> {
        self.graceful_restart_update("graceful restart disable", |gr| {
            gr.enabled = false
        })
    }

    pub fn graceful_restart_time_set(
        &self,
        restart_time: u16,
        stale_path_time: u16,
    ) -> Result<(), Error> {
        self.graceful_restart_update("graceful restart time set", move |gr| {
            gr.restart_time = restart_time;
            gr.stale_path_time = stale_path_time;
        })
    }

    /// Mark this speaker as restarting, and whether forwarding state
    /// survived, for the capabilities of sessions opened from now on.
    pub fn graceful_restart_status_set(
        &self,
        restarting: bool,
        preserved: bool,
    ) -> Result<(), Error> {
        self.graceful_restart_update("graceful restart status set", move |gr| {
            gr.restarting = restarting;
            gr.preserved = preserved;
        })
    }

    pub fn graceful_restart(&self) -> Result<GracefulRestart, Error> {
        self.call("graceful restart get", |s| {
            Ok(*lock!(s.graceful_restart))
        })
    }

    fn graceful_restart_update<F>(
        &self,
        name: &'static str,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut GracefulRestart) + Send + 'static,
    {
        self.call(name, move |s| {
            f(&mut lock!(s.graceful_restart));
            Ok(())
        })
    }

    pub fn reset(
        &self,
        target: ResetTarget,
        kind: ResetKind,
    ) -> Result<(), Error> {
        self.call("reset", move |s| s.reset(target, kind))
    }

    /// `show ip bgp summary`.
    pub fn show_summary(&self) -> Result<String, Error> {
        self.call("show summary", |s| Ok(s.summary()))
    }

    /// Stop every FSM and the dispatcher, then the command thread.
    pub fn shutdown(&self) -> Result<(), Error> {
        let result = self.call("shutdown", |s| {
            s.exit = true;
            Ok(())
        });
        if let Some(handle) = lock!(self.thread).take() {
            if handle.join().is_err() {
                server_log!(self.log, error, "command thread panicked");
            }
        }
        result
    }
}

impl<Cnx: BgpConnection, L: BgpListener<Cnx>> Drop for Server<Cnx, L> {
    fn drop(&mut self) {
        if lock!(self.thread).is_some() {
            // Already gone if the command thread died.
            let _ = self.shutdown();
        }
    }
}

fn command_loop<Cnx: BgpConnection, L: BgpListener<Cnx>>(
    mut state: ServerState<Cnx, L>,
    rx: Receiver<Command<Cnx, L>>,
) {
    while let Ok(cmd) = rx.recv() {
        server_log!(state.log, debug, "command {}", cmd.name);
        (cmd.run)(&mut state);
        if state.exit {
            break;
        }
    }
    state.stop_all();
    server_log!(state.log, info, "server stopped");
}

/// Everything the command thread owns.
struct ServerState<Cnx: BgpConnection, L> {
    asn: u32,
    router_id: Option<Ipv4Addr>,
    listen: IpAddr,
    port: u16,
    graceful_restart: Arc<Mutex<GracefulRestart>>,
    neighbors: BTreeMap<IpAddr, Arc<Neighbor>>,
    sessions: SessionMap<Cnx>,
    fsms: BTreeMap<IpAddr, StoppableThread>,
    dispatcher: Option<Dispatcher>,
    timing: SessionTiming,

    /// A global setting changed and every session has to start over.
    reset_pending: bool,
    exit: bool,
    log: Logger,
    _listener: PhantomData<fn() -> L>,
}

impl<Cnx: BgpConnection, L: BgpListener<Cnx>> ServerState<Cnx, L> {
    /// Sessions only run once the router id is known.
    fn is_runnable(&self) -> bool {
        self.router_id.is_some()
    }

    fn neighbor(&self, addr: IpAddr) -> Result<&Arc<Neighbor>, Error> {
        self.neighbors
            .get(&addr)
            .ok_or(Error::NeighborNotFound(addr))
    }

    fn local_speaker(&self) -> Option<LocalSpeaker> {
        Some(LocalSpeaker {
            asn: self.asn,
            router_id: self.router_id?,
            graceful_restart: self.graceful_restart.clone(),
        })
    }

    fn neighbor_add(&mut self, addr: IpAddr) -> Result<(), Error> {
        if self.neighbors.contains_key(&addr) {
            return Err(Error::NeighborExists(addr));
        }
        let neighbor = Arc::new(Neighbor::new(addr));
        self.neighbors.insert(addr, neighbor.clone());
        server_log!(self.log, info, "neighbor added";
            "peer" => addr.to_string()
        );
        if self.is_runnable() {
            self.spawn_fsm(&neighbor)?;
        }
        Ok(())
    }

    /// Create an FSM for `neighbor` and make it reachable for inbound
    /// connections. The FSM sits in Idle until it is sent a start event.
    fn spawn_fsm(&mut self, neighbor: &Arc<Neighbor>) -> Result<(), Error> {
        let local = self.local_speaker().ok_or_else(|| {
            Error::InvalidRouterId("router id not set".into())
        })?;
        let fsm = Fsm::<Cnx>::new(
            neighbor.clone(),
            local,
            self.timing,
            self.log.clone(),
        )?;
        lock!(self.sessions).insert(neighbor.addr, fsm.event_sender());
        let thread = StoppableThread::spawn(
            format!("bgp-fsm-{}", neighbor.addr),
            move |stop| fsm.run(stop),
        )?;
        self.fsms.insert(neighbor.addr, thread);
        neighbor.set_running(false);
        Ok(())
    }

    fn stop_fsm(&mut self, addr: IpAddr) {
        lock!(self.sessions).remove(&addr);
        if let Some(thread) = self.fsms.remove(&addr) {
            server_log!(self.log, debug, "stopping {}", thread.name());
            thread.stop();
        }
        if let Some(n) = self.neighbors.get(&addr) {
            n.set_running(false);
        }
    }

    /// Send the start event once the neighbor and the server are both ready
    /// and the FSM has not been started yet.
    fn maybe_start(&self, addr: IpAddr) {
        let Some(neighbor) = self.neighbors.get(&addr) else {
            return;
        };
        if !self.is_runnable() || !neighbor.is_runnable() || neighbor.is_running()
        {
            return;
        }
        let Some(tx) = lock!(self.sessions).get(&addr).cloned() else {
            return;
        };
        let event = if neighbor.settings().passive {
            FsmEvent::PassiveManualStart
        } else {
            FsmEvent::ManualStart
        };
        match tx.send(event) {
            Ok(()) => {
                server_log!(self.log, info, "neighbor started";
                    "peer" => addr.to_string()
                );
                neighbor.set_running(true);
            }
            Err(_) => server_log!(self.log, error, "fsm gone";
                "peer" => addr.to_string()
            ),
        }
    }

    fn start_dispatcher(&mut self) {
        let addr = SocketAddr::new(self.listen, self.port);
        match Dispatcher::spawn::<Cnx, L>(
            addr,
            self.sessions.clone(),
            self.log.clone(),
        ) {
            Ok(d) => self.dispatcher = Some(d),
            Err(e) => {
                server_log!(self.log, error, "listen on {addr}: {e}")
            }
        }
    }

    fn stop_all(&mut self) {
        // Let every FSM wind down at once before joining them one by one.
        for thread in self.fsms.values() {
            thread.signal();
        }
        let addrs: Vec<IpAddr> = self.fsms.keys().copied().collect();
        for addr in addrs {
            self.stop_fsm(addr);
        }
        if let Some(d) = self.dispatcher.take() {
            d.stop();
        }
    }

    fn reset_if_pending(&mut self) {
        if std::mem::take(&mut self.reset_pending) {
            self.reset_all();
        }
    }

    /// Stop everything, then bring back the dispatcher and every FSM if the
    /// server can run.
    fn reset_all(&mut self) {
        server_log!(self.log, info, "resetting all sessions");
        self.stop_all();
        if !self.is_runnable() {
            return;
        }
        self.start_dispatcher();
        let neighbors: Vec<Arc<Neighbor>> =
            self.neighbors.values().cloned().collect();
        for n in neighbors {
            self.restart(&n);
        }
    }

    fn restart(&mut self, neighbor: &Arc<Neighbor>) {
        self.stop_fsm(neighbor.addr);
        if let Err(e) = self.spawn_fsm(neighbor) {
            server_log!(self.log, error, "spawn fsm: {e}";
                "peer" => neighbor.addr.to_string()
            );
            return;
        }
        self.maybe_start(neighbor.addr);
    }

    fn reset(&mut self, target: ResetTarget, kind: ResetKind) -> Result<(), Error> {
        let targets: Vec<Arc<Neighbor>> = match target {
            ResetTarget::All => self.neighbors.values().cloned().collect(),
            ResetTarget::Neighbor(addr) => vec![self.neighbor(addr)?.clone()],
        };
        if kind != ResetKind::Hard {
            server_log!(self.log, info, "soft reset {:?}", kind;
                "neighbors" => targets.len()
            );
            return Ok(());
        }
        for n in targets {
            server_log!(self.log, info, "hard reset";
                "peer" => n.addr.to_string()
            );
            if self.is_runnable() {
                self.restart(&n);
            }
        }
        Ok(())
    }

    fn summary(&self) -> String {
        let id = self.router_id.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let capable = self
            .neighbors
            .values()
            .filter(|n| n.state() == FsmStateKind::Established)
            .count();
        let mut out = format!(
            "BGP summary information for VRF default, address family IPv4 Unicast\n\
             BGP router identifier {id}, local AS number {}\n\
             BGP table version is 1, IPv4 Unicast config peers {}, capable peers {capable}\n",
            self.asn,
            self.neighbors.len(),
        );
        out.push_str(
            "\nNeighbor        V    AS MsgRcvd MsgSent   TblVer  InQ OutQ  Up/Down State/PfxRcd\n",
        );
        let now = Utc::now();
        for n in self.neighbors.values() {
            if n.settings().afi_safi.contains(&AfiSafi::IPV4_UNICAST) {
                out.push_str(&n.summary_row(now));
            }
        }
        out
    }
}
