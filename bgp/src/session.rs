// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-neighbor finite state machine and the I/O pumps that feed it.
//!
//! Each FSM runs on its own thread and is the only writer of its state. Its
//! timers, its connect attempts and the reader/writer pumps of its live
//! connection talk to it exclusively through its bounded event queue.

use crate::clock::{Clock, ClockIntervals, ClockTimers};
use crate::connection::{BgpConnection, ConnectToken};
use crate::error::{Error, ProtocolError};
use crate::log::{connection_log, session_log};
use crate::messages::{
    decode_body, Header, Message, MessageType, NotificationMessage,
    OpenMessage, RouteRefreshMessage, UpdateMessage,
};
use crate::neighbor::{LocalSpeaker, Neighbor};
use crate::{EVENT_QUEUE_SIZE, IO_TIMEOUT, SEND_QUEUE_SIZE};
use chrono::Utc;
use slog::Logger;
use std::fmt::{self, Debug, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{
    sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError,
};
use std::sync::Arc;
use std::thread::{sleep, Builder, JoinHandle};
use std::time::Duration;

/// How long a pump waits before retrying a full event queue.
const QUEUE_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum FsmStateKind {
    /// Refuses connections. Starts again when the idle timer fires.
    #[default]
    Idle,

    /// Waiting for the outbound TCP connection to complete.
    Connect,

    /// Waiting for the connect retry timer after a failed connection.
    Active,

    /// Waiting for an OPEN from the peer.
    OpenSent,

    /// Waiting for a KEEPALIVE or NOTIFICATION from the peer.
    OpenConfirm,

    /// Able to exchange UPDATE, NOTIFICATION and KEEPALIVE messages.
    Established,
}

impl FsmStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connect => "Connect",
            Self::Active => "Active",
            Self::OpenSent => "OpenSent",
            Self::OpenConfirm => "OpenConfirm",
            Self::Established => "Established",
        }
    }
}

impl Display for FsmStateKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// FSM events, numbered as in RFC 4271 §8.1 plus two local extensions for
/// route refresh and dynamic capability messages.
pub enum FsmEvent<Cnx: BgpConnection> {
    /// Local system administrator manually starts the peer connection.
    ManualStart,

    /// Local system administrator manually stops the peer connection.
    ManualStop,

    /// Local system automatically starts the BGP connection.
    AutomaticStart,

    /// Manual start with passive TCP establishment: wait for the peer to
    /// connect.
    PassiveManualStart,

    /// Automatic start with passive TCP establishment.
    PassiveAutomaticStart,

    /// Automatic start with peer oscillation damping.
    DampedAutomaticStart,

    /// Automatic start with damping and passive TCP establishment.
    PassiveDampedAutomaticStart,

    /// Local system automatically stops the connection.
    AutomaticStop,

    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    DelayOpenTimerExpires,
    IdleHoldTimerExpires,

    /// A TCP connection request with a valid source and destination.
    TcpConnectionValid,

    /// A TCP connection request with an invalid source or destination.
    TcpConnectionInvalid,

    /// Our SYN was answered and the handshake completed.
    TcpConnectionAcked,

    /// A TCP connection to the peer is up. Carries the connection.
    TcpConnectionConfirmed(Cnx),

    /// The connection failed or the peer closed it.
    TcpConnectionFails,

    /// A valid OPEN arrived.
    BgpOpen(OpenMessage),

    /// A valid OPEN arrived while the delay open timer was running.
    DelayedBgpOpen(OpenMessage),

    /// A message header failed validation.
    BgpHeaderErr,

    /// An OPEN failed validation.
    BgpOpenMsgErr,

    /// A connection collision was detected while processing an OPEN.
    OpenCollisionDump,

    /// A NOTIFICATION with a version error arrived.
    NotifyMsgVerErr,

    /// A NOTIFICATION arrived.
    NotifyMsg(NotificationMessage),

    /// A KEEPALIVE arrived.
    KeepAliveMsg,

    /// A valid UPDATE arrived.
    UpdateMsg(UpdateMessage),

    /// An UPDATE failed validation.
    UpdateMsgErr,

    /// A ROUTE-REFRESH arrived.
    RouteRefreshMsg(RouteRefreshMessage),

    /// A dynamic capability message arrived.
    CapabilityMsg,
}

impl<Cnx: BgpConnection> FsmEvent<Cnx> {
    /// Event number.
    pub fn id(&self) -> u8 {
        match self {
            Self::ManualStart => 1,
            Self::ManualStop => 2,
            Self::AutomaticStart => 3,
            Self::PassiveManualStart => 4,
            Self::PassiveAutomaticStart => 5,
            Self::DampedAutomaticStart => 6,
            Self::PassiveDampedAutomaticStart => 7,
            Self::AutomaticStop => 8,
            Self::ConnectRetryTimerExpires => 9,
            Self::HoldTimerExpires => 10,
            Self::KeepaliveTimerExpires => 11,
            Self::DelayOpenTimerExpires => 12,
            Self::IdleHoldTimerExpires => 13,
            Self::TcpConnectionValid => 14,
            Self::TcpConnectionInvalid => 15,
            Self::TcpConnectionAcked => 16,
            Self::TcpConnectionConfirmed(_) => 17,
            Self::TcpConnectionFails => 18,
            Self::BgpOpen(_) => 19,
            Self::DelayedBgpOpen(_) => 20,
            Self::BgpHeaderErr => 21,
            Self::BgpOpenMsgErr => 22,
            Self::OpenCollisionDump => 23,
            Self::NotifyMsgVerErr => 24,
            Self::NotifyMsg(_) => 25,
            Self::KeepAliveMsg => 26,
            Self::UpdateMsg(_) => 27,
            Self::UpdateMsgErr => 28,
            Self::RouteRefreshMsg(_) => 29,
            Self::CapabilityMsg => 30,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ManualStart => "manual start",
            Self::ManualStop => "manual stop",
            Self::AutomaticStart => "automatic start",
            Self::PassiveManualStart => "passive manual start",
            Self::PassiveAutomaticStart => "passive automatic start",
            Self::DampedAutomaticStart => "damped automatic start",
            Self::PassiveDampedAutomaticStart => {
                "passive damped automatic start"
            }
            Self::AutomaticStop => "automatic stop",
            Self::ConnectRetryTimerExpires => "connect retry timer expires",
            Self::HoldTimerExpires => "hold timer expires",
            Self::KeepaliveTimerExpires => "keepalive timer expires",
            Self::DelayOpenTimerExpires => "delay open timer expires",
            Self::IdleHoldTimerExpires => "idle hold timer expires",
            Self::TcpConnectionValid => "tcp connection valid",
            Self::TcpConnectionInvalid => "tcp connection invalid",
            Self::TcpConnectionAcked => "tcp connection acked",
            Self::TcpConnectionConfirmed(_) => "tcp connection confirmed",
            Self::TcpConnectionFails => "tcp connection fails",
            Self::BgpOpen(_) => "bgp open",
            Self::DelayedBgpOpen(_) => "delayed bgp open",
            Self::BgpHeaderErr => "bgp header err",
            Self::BgpOpenMsgErr => "bgp open message error",
            Self::OpenCollisionDump => "open collision dump",
            Self::NotifyMsgVerErr => "notify msg ver error",
            Self::NotifyMsg(_) => "notify msg",
            Self::KeepAliveMsg => "keepalive msg",
            Self::UpdateMsg(_) => "update msg",
            Self::UpdateMsgErr => "update msg error",
            Self::RouteRefreshMsg(_) => "route refresh msg",
            Self::CapabilityMsg => "capability msg",
        }
    }

    /// Events that take an open or establishing session down to idle.
    fn is_session_failure(&self) -> bool {
        matches!(
            self,
            Self::NotifyMsg(_)
                | Self::TcpConnectionFails
                | Self::BgpHeaderErr
                | Self::BgpOpenMsgErr
                | Self::UpdateMsgErr
                | Self::AutomaticStop
        )
    }
}

impl<Cnx: BgpConnection> Debug for FsmEvent<Cnx> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TcpConnectionConfirmed(cnx) => {
                write!(f, "tcp connection confirmed ({})", cnx.peer())
            }
            Self::BgpOpen(m) | Self::DelayedBgpOpen(m) => {
                write!(f, "{} {m:?}", self.title())
            }
            Self::NotifyMsg(m) => write!(f, "notify msg {m}"),
            Self::UpdateMsg(m) => write!(f, "update msg {m:?}"),
            Self::RouteRefreshMsg(m) => write!(f, "route refresh msg {m:?}"),
            _ => write!(f, "{}", self.title()),
        }
    }
}

/// Timing knobs that are not per-neighbor configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Clock tick.
    pub resolution: Duration,

    /// How long an FSM stays idle before starting again.
    pub idle: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            resolution: IO_TIMEOUT,
            idle: crate::DEFAULT_IDLE_TIME,
        }
    }
}

/// Try to enqueue `event`, waiting while the queue is full. Gives up once
/// `abandoned` reports that the event is no longer wanted, so a producer
/// never blocks an FSM that is waiting to join it.
fn enqueue<Cnx: BgpConnection>(
    tx: &SyncSender<FsmEvent<Cnx>>,
    mut event: FsmEvent<Cnx>,
    abandoned: impl Fn() -> bool,
) -> bool {
    loop {
        if abandoned() {
            return false;
        }
        match tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(e)) => {
                event = e;
                sleep(QUEUE_RETRY);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

/// A connection with its reader and writer pumps running.
struct LiveConnection<Cnx: BgpConnection> {
    cnx: Cnx,
    dropped: Arc<AtomicBool>,
    send_tx: Option<SyncSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Everything a pump needs, cloned once per pump.
struct Pump<Cnx: BgpConnection> {
    cnx: Cnx,
    peer: SocketAddr,
    neighbor: Arc<Neighbor>,
    event_tx: SyncSender<FsmEvent<Cnx>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl<Cnx: BgpConnection> Pump<Cnx> {
    fn emit(&self, event: FsmEvent<Cnx>) -> bool {
        enqueue(&self.event_tx, event, || self.dropped.load(Ordering::Acquire))
    }

    /// Tell the peer what went wrong, close the connection and report
    /// `event` to the FSM.
    fn notify_and_fail(&mut self, err: &ProtocolError, event: FsmEvent<Cnx>) {
        connection_log!(self.log, self.peer, warn,
            "protocol error: {err}";
            "event" => event.title()
        );
        let msg = Message::Notification(err.to_notification());
        match msg.to_wire() {
            Ok(buf) => match self.cnx.write_all(&buf) {
                Ok(()) => self.neighbor.counters_out.count(MessageType::Notification),
                Err(e) => connection_log!(self.log, self.peer, debug,
                    "send notification: {e}"
                ),
            },
            Err(e) => connection_log!(self.log, self.peer, error,
                "serialize notification: {e}"
            ),
        }
        self.cnx.shutdown();
        self.emit(event);
    }

    fn io_failed(&self, e: std::io::Error) {
        if self.dropped.load(Ordering::Acquire) {
            return;
        }
        connection_log!(self.log, self.peer, info, "connection lost: {e}");
        self.emit(FsmEvent::TcpConnectionFails);
    }

    /// Read messages until the connection fails or is dropped.
    fn read_loop(mut self) {
        loop {
            let mut hbuf = [0u8; Header::WIRE_SIZE];
            if let Err(e) = self.cnx.read_exact(&mut hbuf) {
                return self.io_failed(e);
            }
            let header = match Header::from_wire(&hbuf) {
                Ok(h) => h,
                Err(e) => {
                    return self.notify_and_fail(&e, FsmEvent::BgpHeaderErr)
                }
            };

            let mut body = vec![0u8; header.body_length()];
            if let Err(e) = self.cnx.read_exact(&mut body) {
                return self.io_failed(e);
            }
            let msg = match decode_body(&header, &body) {
                Ok(m) => m,
                Err(e) => {
                    let event = match header.typ {
                        MessageType::Open => FsmEvent::BgpOpenMsgErr,
                        MessageType::Update => FsmEvent::UpdateMsgErr,
                        MessageType::Notification => FsmEvent::AutomaticStop,
                        _ => FsmEvent::TcpConnectionFails,
                    };
                    return self.notify_and_fail(&e, event);
                }
            };

            connection_log!(self.log, self.peer, trace,
                "recv {:?}", msg.kind();
                "length" => header.length
            );
            self.neighbor.counters_in.count(header.typ);
            let event = match msg {
                Message::Open(m) => FsmEvent::BgpOpen(m),
                Message::KeepAlive => FsmEvent::KeepAliveMsg,
                Message::Notification(m) => FsmEvent::NotifyMsg(m),
                Message::Update(m) => {
                    self.neighbor.counters_in.add_prefixes(m.nlri.len());
                    FsmEvent::UpdateMsg(m)
                }
                Message::RouteRefresh(m) => FsmEvent::RouteRefreshMsg(m),
                Message::Capability => FsmEvent::CapabilityMsg,
            };
            if !self.emit(event) {
                return;
            }
        }
    }

    /// Write queued messages until the queue closes or a write fails.
    fn write_loop(mut self, send_rx: Receiver<Message>) {
        loop {
            let msg = match send_rx.recv_timeout(IO_TIMEOUT) {
                Ok(m) => m,
                Err(RecvTimeoutError::Timeout) => {
                    if self.dropped.load(Ordering::Acquire) {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };
            let buf = match msg.to_wire() {
                Ok(b) => b,
                Err(e) => {
                    connection_log!(self.log, self.peer, error,
                        "serialize {:?}: {e}", msg.kind()
                    );
                    self.emit(FsmEvent::TcpConnectionFails);
                    return;
                }
            };
            if let Err(e) = self.cnx.write_all(&buf) {
                return self.io_failed(e);
            }
            connection_log!(self.log, self.peer, trace,
                "sent {:?}", msg.kind();
                "length" => buf.len()
            );
            self.neighbor.counters_out.count(msg.kind());
        }
    }
}

pub struct Fsm<Cnx: BgpConnection> {
    pub neighbor: Arc<Neighbor>,
    local: LocalSpeaker,
    state: FsmStateKind,
    clock: Clock,
    event_tx: SyncSender<FsmEvent<Cnx>>,
    event_rx: Receiver<FsmEvent<Cnx>>,
    conn: Option<LiveConnection<Cnx>>,
    connect: Option<ConnectToken>,
    hold_time: u16,
    keepalive_time: u16,
    log: Logger,
}

impl<Cnx: BgpConnection> Fsm<Cnx> {
    pub fn new(
        neighbor: Arc<Neighbor>,
        local: LocalSpeaker,
        timing: SessionTiming,
        log: Logger,
    ) -> Result<Self, Error> {
        let (event_tx, event_rx) = sync_channel(EVENT_QUEUE_SIZE);
        let settings = neighbor.settings();
        let hold = Duration::from_secs(settings.hold_time().into());
        let clock = Clock::new(
            ClockIntervals {
                resolution: timing.resolution,
                idle: timing.idle,
                connect_retry: settings.connect_retry_time,
                keepalive: hold / 3,
                hold,
                delay_open: Duration::ZERO,
            },
            event_tx.clone(),
            log.clone(),
        )?;
        neighbor.update_session(|s| s.state = FsmStateKind::Idle);
        Ok(Self {
            neighbor,
            local,
            state: FsmStateKind::Idle,
            clock,
            event_tx,
            event_rx,
            conn: None,
            connect: None,
            hold_time: 0,
            keepalive_time: 0,
            log,
        })
    }

    /// Handle used to feed events to this FSM.
    pub fn event_sender(&self) -> SyncSender<FsmEvent<Cnx>> {
        self.event_tx.clone()
    }

    pub fn timers(&self) -> Arc<ClockTimers> {
        self.clock.timers.clone()
    }

    /// Process events until `stop` is raised, then tear everything down.
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        session_log!(self, info, "fsm started");
        while !stop.load(Ordering::Relaxed) {
            match self.event_rx.recv_timeout(IO_TIMEOUT) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown();
        self.set_state(FsmStateKind::Idle);
        session_log!(self, info, "fsm stopped");
    }

    fn handle(&mut self, event: FsmEvent<Cnx>) {
        session_log!(self, debug, "event {}", event.title();
            "event_id" => event.id()
        );
        match self.state {
            FsmStateKind::Idle => self.on_idle(event),
            FsmStateKind::Connect => self.on_connect(event),
            FsmStateKind::Active => self.on_active(event),
            FsmStateKind::OpenSent => self.on_open_sent(event),
            FsmStateKind::OpenConfirm => self.on_open_confirm(event),
            FsmStateKind::Established => self.on_established(event),
        }
    }

    fn on_idle(&mut self, event: FsmEvent<Cnx>) {
        match event {
            FsmEvent::ManualStart | FsmEvent::AutomaticStart => {
                self.reset_retry_counter();
                self.tcp_connect();
                self.change_state(FsmStateKind::Connect);
            }
            FsmEvent::PassiveManualStart | FsmEvent::PassiveAutomaticStart => {
                self.reset_retry_counter();
                self.change_state(FsmStateKind::Active);
            }
            other => self.ignore(other),
        }
    }

    fn on_connect(&mut self, event: FsmEvent<Cnx>) {
        match event {
            FsmEvent::ManualStart | FsmEvent::AutomaticStart => {}
            FsmEvent::TcpConnectionConfirmed(cnx) => self.tcp_establish(cnx),
            FsmEvent::BgpOpen(open) => {
                self.open_process(&open);
                self.send_open();
                self.send(Message::KeepAlive);
                self.change_state(FsmStateKind::OpenConfirm);
            }
            FsmEvent::TcpConnectionFails => {
                // Both branches agree until delay open exists.
                self.change_state(FsmStateKind::Active);
                self.clock.timers.connect_retry.start();
            }
            e if e.is_session_failure() => {
                self.change_state(FsmStateKind::Idle)
            }
            other => self.ignore(other),
        }
    }

    fn on_active(&mut self, event: FsmEvent<Cnx>) {
        match event {
            FsmEvent::ConnectRetryTimerExpires => {
                self.tcp_connect();
                self.clock.timers.connect_retry.start();
                self.change_state(FsmStateKind::Connect);
            }
            FsmEvent::TcpConnectionFails => {
                self.change_state(FsmStateKind::Idle)
            }
            other => self.ignore(other),
        }
    }

    // An OPEN in this state is not acted on.
    fn on_open_sent(&mut self, event: FsmEvent<Cnx>) {
        match event {
            e if e.is_session_failure() => {
                self.change_state(FsmStateKind::Idle)
            }
            other => self.ignore(other),
        }
    }

    fn on_open_confirm(&mut self, event: FsmEvent<Cnx>) {
        match event {
            FsmEvent::KeepAliveMsg => {
                self.neighbor.update_session(|s| s.uptime = Utc::now());
                self.change_state(FsmStateKind::Established);
            }
            e if e.is_session_failure() => {
                self.change_state(FsmStateKind::Idle)
            }
            other => self.ignore(other),
        }
    }

    fn on_established(&mut self, event: FsmEvent<Cnx>) {
        match event {
            FsmEvent::KeepaliveTimerExpires => {
                self.send(Message::KeepAlive);
                self.clock.timers.keepalive.start();
            }
            // Route processing lives outside the session engine.
            FsmEvent::UpdateMsg(update) => {
                session_log!(self, debug, "update";
                    "nlri" => update.nlri.len(),
                    "withdrawn" => update.withdrawn.len()
                );
            }
            FsmEvent::RouteRefreshMsg(rr) => {
                session_log!(self, debug, "route refresh";
                    "afi" => rr.afi,
                    "safi" => rr.safi
                );
            }
            FsmEvent::KeepAliveMsg => {}
            e if e.is_session_failure() => {
                self.change_state(FsmStateKind::Idle)
            }
            other => self.ignore(other),
        }
    }

    fn ignore(&mut self, event: FsmEvent<Cnx>) {
        session_log!(self, warn, "ignoring {} in {}", event.title(), self.state;
            "event_id" => event.id()
        );
        if let FsmEvent::TcpConnectionConfirmed(cnx) = event {
            cnx.shutdown();
        }
    }

    fn set_state(&mut self, state: FsmStateKind) {
        self.state = state;
        self.neighbor.update_session(|s| s.state = state);
    }

    /// Move to `state` and run its entry actions.
    fn change_state(&mut self, state: FsmStateKind) {
        session_log!(self, info, "{} -> {}", self.state, state);
        self.set_state(state);
        let timers = self.clock.timers.clone();
        match state {
            FsmStateKind::Idle => {
                self.shutdown();
                timers
                    .idle_passive
                    .store(self.neighbor.settings().passive, Ordering::Relaxed);
                timers.idle.start();
            }
            FsmStateKind::Connect => {
                timers.idle.stop();
                timers.keepalive.stop();
            }
            FsmStateKind::Active => {
                self.tcp_drop();
                timers.idle.stop();
                timers.keepalive.stop();
            }
            FsmStateKind::OpenSent | FsmStateKind::OpenConfirm => {
                timers.idle.stop();
            }
            FsmStateKind::Established => {
                if self.keepalive_time != 0 {
                    timers.keepalive.start();
                } else {
                    timers.keepalive.stop();
                }
                timers.idle.stop();
                timers.connect_retry.stop();
            }
        }
    }

    /// Stop every timer, abandon any connect attempt and drop the
    /// connection.
    fn shutdown(&mut self) {
        let timers = &self.clock.timers;
        timers.idle.stop();
        timers.connect_retry.stop();
        timers.keepalive.stop();
        timers.hold.stop();
        timers.delay_open.stop();
        if let Some(token) = self.connect.take() {
            token.cancel();
        }
        self.tcp_drop();
    }

    fn reset_retry_counter(&self) {
        self.neighbor.update_session(|s| s.connect_retry_counter = 0);
    }

    fn delay_open_timer(&self) -> bool {
        false
    }

    /// Negotiate hold and keepalive times from the peer's OPEN.
    fn open_process(&mut self, open: &OpenMessage) {
        let local = self.neighbor.settings().hold_time();
        self.hold_time = local.min(open.hold_time);
        self.keepalive_time = self.hold_time / 3;
        self.clock
            .timers
            .keepalive
            .set_interval(Duration::from_secs(self.keepalive_time.into()));
        let (hold, keepalive) = (self.hold_time, self.keepalive_time);
        self.neighbor.update_session(|s| {
            s.hold_time = hold;
            s.keepalive_time = keepalive;
            s.remote_caps = open.capabilities();
            s.remote_id = Some(open.id);
            s.remote_asn = Some(open.peer_asn());
        });
        session_log!(self, info, "open from peer";
            "peer_asn" => open.peer_asn(),
            "peer_id" => open.id.to_string(),
            "hold_time" => hold,
            "keepalive_time" => keepalive,
            "delay_open" => self.delay_open_timer()
        );
    }

    fn send_open(&mut self) {
        let open = self.neighbor.open_message(&self.local);
        self.send(Message::Open(open));
    }

    fn send(&mut self, msg: Message) {
        let kind = msg.kind();
        if let Err(e) = self.queue(msg) {
            session_log!(self, warn, "dropping {:?}: {e}", kind);
        }
    }

    /// Queue `msg` on the live connection's writer.
    fn queue(&self, msg: Message) -> Result<(), Error> {
        let tx = self
            .conn
            .as_ref()
            .and_then(|c| c.send_tx.as_ref())
            .ok_or(Error::NotConnected)?;
        tx.send(msg)
            .map_err(|_| Error::InternalCommunication("writer gone".into()))
    }

    /// Start an outbound connection attempt, replacing any attempt still in
    /// flight.
    fn tcp_connect(&mut self) {
        if let Some(token) = self.connect.take() {
            session_log!(self, info, "cancelling connect in progress");
            token.cancel();
        }
        let token = ConnectToken::new();
        self.connect = Some(token.clone());

        let settings = self.neighbor.settings();
        let peer = SocketAddr::new(self.neighbor.addr, settings.port);
        let timeout = settings.connect_retry_time;
        let tx = self.event_tx.clone();
        let log = self.log.clone();

        let spawned = Builder::new()
            .name(format!("bgp-connect-{peer}"))
            .spawn(move || {
                let result = Cnx::connect(None, peer, timeout, &token);
                if token.is_cancelled() {
                    if let Ok(cnx) = result {
                        cnx.shutdown();
                    }
                    return;
                }
                let event = match result {
                    Ok(cnx) => FsmEvent::TcpConnectionConfirmed(cnx),
                    Err(e) => {
                        connection_log!(log, peer, info, "connect: {e}");
                        FsmEvent::TcpConnectionFails
                    }
                };
                enqueue(&tx, event, || token.is_cancelled());
            });
        if let Err(e) = spawned {
            session_log!(self, error, "spawn connect thread: {e}");
            self.requeue(FsmEvent::TcpConnectionFails);
        }
    }

    /// Start the reader and writer pumps on `cnx`. A connection that is
    /// already live is dropped first.
    fn tcp_establish(&mut self, cnx: Cnx) {
        if self.conn.is_some() {
            session_log!(self, warn, "replacing live connection");
            self.tcp_drop();
        }
        match self.start_pumps(cnx) {
            Ok(live) => {
                session_log!(self, info, "connection established";
                    "remote" => live.cnx.peer().to_string()
                );
                self.conn = Some(live);
            }
            Err(e) => {
                session_log!(self, error, "start pumps: {e}");
                self.requeue(FsmEvent::TcpConnectionFails);
            }
        }
    }

    /// Queue an event for this FSM from its own thread. Blocking here would
    /// wait on ourselves, so a full queue loses the event.
    fn requeue(&self, event: FsmEvent<Cnx>) {
        if let Err(e) = self.event_tx.try_send(event) {
            let (TrySendError::Full(event) | TrySendError::Disconnected(event)) =
                e;
            session_log!(self, error, "event queue full, lost {}", event.title();
                "event_id" => event.id()
            );
        }
    }

    fn start_pumps(&self, cnx: Cnx) -> Result<LiveConnection<Cnx>, Error> {
        let dropped = Arc::new(AtomicBool::new(false));
        let peer = cnx.peer();
        let pump = |cnx: Cnx| Pump {
            cnx,
            peer,
            neighbor: self.neighbor.clone(),
            event_tx: self.event_tx.clone(),
            dropped: dropped.clone(),
            log: self.log.clone(),
        };
        let reader = pump(cnx.try_clone()?);
        let writer = pump(cnx.try_clone()?);
        let (send_tx, send_rx) = sync_channel(SEND_QUEUE_SIZE);

        let mut live = LiveConnection {
            cnx,
            dropped,
            send_tx: Some(send_tx),
            reader: None,
            writer: None,
        };
        let spawn = |name: &str| Builder::new().name(format!("{name}-{peer}"));
        match spawn("bgp-reader").spawn(move || reader.read_loop()) {
            Ok(h) => live.reader = Some(h),
            Err(e) => {
                Self::drop_connection(live);
                return Err(e.into());
            }
        }
        match spawn("bgp-writer").spawn(move || writer.write_loop(send_rx)) {
            Ok(h) => live.writer = Some(h),
            Err(e) => {
                Self::drop_connection(live);
                return Err(e.into());
            }
        }
        Ok(live)
    }

    /// Stop both pumps of the live connection and wait for them to exit.
    fn tcp_drop(&mut self) {
        if let Some(live) = self.conn.take() {
            session_log!(self, debug, "dropping connection");
            Self::drop_connection(live);
        }
    }

    fn drop_connection(mut live: LiveConnection<Cnx>) {
        live.dropped.store(true, Ordering::Release);
        live.cnx.shutdown();
        live.send_tx.take();
        for handle in [live.reader.take(), live.writer.take()].into_iter().flatten() {
            // A pump that panicked has nothing left to clean up.
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AfiSafi;
    use crate::connection::BgpListener;
    use crate::connection_channel::{BgpConnectionChannel, BgpListenerChannel};
    use crate::messages::{
        CeaseErrorSubcode, ErrorCode, ErrorSubcode, HeaderErrorSubcode,
    };
    use pretty_assertions::assert_eq;
    use pretty_hex::*;
    use speaker_common::log::discard_logger;
    use speaker_common::thread::StoppableThread;
    use speaker_common::{ip, sockaddr, wait_for, wait_for_eq, wait_for_neq};
    use std::io::{Read, Write};

    type Event = FsmEvent<BgpConnectionChannel>;

    struct Harness {
        neighbor: Arc<Neighbor>,
        timers: Arc<ClockTimers>,
        tx: SyncSender<Event>,
        _thread: StoppableThread,
    }

    /// Spawn an FSM for a configured neighbor at `addr`.
    fn harness(addr: &str, connect_retry: Duration) -> Harness {
        let neighbor = Arc::new(Neighbor::new(ip!(addr)));
        neighbor.set_remote_as(65001).expect("remote as");
        neighbor.add_afi_safi(AfiSafi::IPV4_UNICAST).expect("afi safi");
        neighbor.configure(|s| s.connect_retry_time = connect_retry);
        let local = LocalSpeaker {
            asn: 65000,
            router_id: ip!("10.255.0.1"),
            graceful_restart: Arc::default(),
        };
        let timing = SessionTiming {
            resolution: Duration::from_millis(10),
            idle: Duration::from_secs(30),
        };
        let fsm = Fsm::<BgpConnectionChannel>::new(
            neighbor.clone(),
            local,
            timing,
            discard_logger(),
        )
        .expect("fsm");
        let timers = fsm.timers();
        let tx = fsm.event_sender();
        let thread = StoppableThread::spawn("fsm", move |stop| fsm.run(stop))
            .expect("spawn fsm");
        Harness {
            neighbor,
            timers,
            tx,
            _thread: thread,
        }
    }

    fn read_message(cnx: &mut BgpConnectionChannel) -> Message {
        let mut hbuf = [0u8; Header::WIRE_SIZE];
        cnx.read_exact(&mut hbuf).expect("read header");
        let header = Header::from_wire(&hbuf).expect("header");
        let mut body = vec![0u8; header.body_length()];
        cnx.read_exact(&mut body).expect("read body");
        decode_body(&header, &body).expect("decode body")
    }

    fn write_message(cnx: &mut BgpConnectionChannel, msg: Message) {
        let buf = msg.to_wire().expect("to wire");
        println!("buf: {}", buf.hex_dump());
        cnx.write_all(&buf).expect("write");
    }

    /// Start the FSM at `addr` and accept its connection, leaving it in
    /// Connect with pumps running.
    fn connected(addr: &str) -> (Harness, BgpConnectionChannel, BgpListenerChannel) {
        let listener = BgpListenerChannel::bind(SocketAddr::new(
            ip!(addr),
            crate::BGP_PORT,
        ))
        .expect("bind");
        let h = harness(addr, Duration::from_secs(30));
        h.tx.send(FsmEvent::ManualStart).expect("start");
        let peer = listener
            .accept(Duration::from_secs(5))
            .expect("accept")
            .expect("fsm connects");
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Connect);
        (h, peer, listener)
    }

    /// Drive a connected FSM to OpenConfirm with the peer proposing
    /// `hold_time`. Returns our OPEN as seen by the peer.
    fn open_confirm(
        peer: &mut BgpConnectionChannel,
        h: &Harness,
        hold_time: u16,
    ) -> OpenMessage {
        let open = OpenMessage::new(65001, hold_time, ip!("10.0.0.9"), vec![]);
        write_message(peer, Message::Open(open));
        let ours = match read_message(peer) {
            Message::Open(m) => m,
            other => panic!("expected open, got {other:?}"),
        };
        assert_eq!(read_message(peer), Message::KeepAlive);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::OpenConfirm);
        ours
    }

    #[test]
    fn event_numbers() {
        assert_eq!(Event::ManualStart.id(), 1);
        assert_eq!(Event::TcpConnectionFails.id(), 18);
        assert_eq!(Event::KeepAliveMsg.id(), 26);
        assert_eq!(Event::CapabilityMsg.id(), 30);
    }

    #[test]
    fn failed_connect_goes_active() {
        // Nothing listens here.
        let h = harness("10.1.0.2", Duration::from_secs(30));
        h.tx.send(FsmEvent::ManualStart).expect("start");
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Active);
        wait_for!(h.timers.connect_retry.enabled(), ==, true, 50, 100);
        assert!(!h.timers.idle.enabled());
    }

    #[test]
    fn connect_retry_expiry_reconnects() {
        let h = harness("10.1.0.3", Duration::from_millis(200));
        h.tx.send(FsmEvent::ManualStart).expect("start");
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Active);

        let listener = BgpListenerChannel::bind(sockaddr!("10.1.0.3:179"))
            .expect("bind");
        let conn = listener.accept(Duration::from_secs(5)).expect("accept");
        assert!(conn.is_some());
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Connect);
    }

    #[test]
    fn superseded_connect_never_arrives() {
        let listener = BgpListenerChannel::bind_with_delay(
            sockaddr!("10.1.0.5:179"),
            Duration::from_millis(800),
        )
        .expect("bind");
        let h = harness("10.1.0.5", Duration::from_secs(30));
        h.tx.send(FsmEvent::ManualStart).expect("start");
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Connect);

        // Start a second attempt while the first is still in its handshake.
        h.tx.send(FsmEvent::TcpConnectionFails).expect("fail");
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Active);
        h.tx.send(FsmEvent::ConnectRetryTimerExpires).expect("retry");
        wait_for_neq!(h.neighbor.state(), FsmStateKind::Active);

        assert!(listener
            .accept(Duration::from_secs(3))
            .expect("accept")
            .is_some());
        assert!(listener
            .accept(Duration::from_secs(1))
            .expect("accept")
            .is_none());
    }

    #[test]
    fn passive_start_waits_in_active() {
        let h = harness("10.1.0.4", Duration::from_millis(50));
        h.neighbor.configure(|s| s.passive = true);
        h.tx.send(FsmEvent::PassiveManualStart).expect("start");
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Active);
        sleep(Duration::from_millis(200));
        assert_eq!(h.neighbor.state(), FsmStateKind::Active);
        assert!(!h.timers.connect_retry.enabled());
    }

    #[test]
    fn open_negotiates_keepalive() {
        let (h, mut peer, _l) = connected("10.1.1.2");
        let ours = open_confirm(&mut peer, &h, 30);
        assert_eq!(ours.asn, 65000);
        assert_eq!(ours.hold_time, 90);
        assert_eq!(ours.id, "10.255.0.1".parse::<std::net::Ipv4Addr>().expect("ip"));

        let session = h.neighbor.session();
        assert_eq!(session.hold_time, 30);
        assert_eq!(session.keepalive_time, 10);
        assert_eq!(session.remote_id, Some(ip!("10.0.0.9")));
        assert_eq!(h.neighbor.counters_in.get().open, 1);
        wait_for_eq!(h.neighbor.counters_out.get().sum(), 2);
    }

    #[test]
    fn keepalive_establishes_session() {
        let (h, mut peer, _l) = connected("10.1.1.3");
        open_confirm(&mut peer, &h, 45);
        assert!(!h.timers.keepalive.enabled());

        write_message(&mut peer, Message::KeepAlive);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Established);
        assert!(h.timers.keepalive.enabled());
        assert_eq!(h.timers.keepalive.interval(), Duration::from_secs(15));
        assert!(!h.timers.connect_retry.enabled());
        assert_eq!(h.neighbor.counters_in.get().keepalive, 1);
    }

    #[test]
    fn keepalive_timer_keeps_sending() {
        let (h, mut peer, _l) = connected("10.1.1.6");
        // hold time 3 gives a one second keepalive
        open_confirm(&mut peer, &h, 3);
        write_message(&mut peer, Message::KeepAlive);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Established);

        for _ in 0..2 {
            assert_eq!(read_message(&mut peer), Message::KeepAlive);
        }
        assert_eq!(h.neighbor.state(), FsmStateKind::Established);
        wait_for!(h.neighbor.counters_out.get().keepalive, >=, 3, 50, 100);
    }

    #[test]
    fn zero_hold_time_disables_keepalive() {
        let (h, mut peer, _l) = connected("10.1.1.4");
        open_confirm(&mut peer, &h, 0);
        assert_eq!(h.neighbor.session().keepalive_time, 0);

        write_message(&mut peer, Message::KeepAlive);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Established);
        sleep(Duration::from_millis(100));
        assert!(!h.timers.keepalive.enabled());
    }

    #[test]
    fn update_counts_prefixes() {
        let (h, mut peer, _l) = connected("10.1.1.5");
        open_confirm(&mut peer, &h, 90);
        write_message(&mut peer, Message::KeepAlive);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Established);

        let update = UpdateMessage {
            nlri: vec![
                "198.51.100.0/24".parse().expect("prefix"),
                "203.0.113.0/24".parse().expect("prefix"),
            ],
            ..Default::default()
        };
        write_message(&mut peer, Message::Update(update));
        wait_for_eq!(h.neighbor.counters_in.get().prefix, 2);
        assert_eq!(h.neighbor.state_or_prefixes(), "2");
    }

    #[test]
    fn bad_marker_notifies_and_idles() {
        let (h, mut peer, _l) = connected("10.1.2.2");
        let mut buf = Message::KeepAlive.to_wire().expect("to wire");
        buf[0] = 0;
        peer.write_all(&buf).expect("write");

        let Message::Notification(n) = read_message(&mut peer) else {
            panic!("expected notification");
        };
        assert_eq!(n.error_code, ErrorCode::Header);
        assert_eq!(
            n.error_subcode,
            ErrorSubcode::from(HeaderErrorSubcode::ConnectionNotSynchronized)
        );
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Idle);
        assert!(h.timers.idle.enabled());
        assert_eq!(h.neighbor.counters_out.get().notification, 1);

        // The connection is gone.
        let mut rest = [0u8; 1];
        assert_eq!(peer.read(&mut rest).expect("read"), 0);
    }

    #[test]
    fn bad_open_hold_time_notifies() {
        let (h, mut peer, _l) = connected("10.1.2.3");
        let mut open = Message::Open(OpenMessage::new(
            65001,
            90,
            ip!("10.0.0.9"),
            vec![],
        ))
        .to_wire()
        .expect("to wire");
        // hold time lives at body offset 3
        open[Header::WIRE_SIZE + 3] = 0;
        open[Header::WIRE_SIZE + 4] = 2;
        peer.write_all(&open).expect("write");

        let Message::Notification(n) = read_message(&mut peer) else {
            panic!("expected notification");
        };
        assert_eq!(n.error_code, ErrorCode::Open);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Idle);
    }

    #[test]
    fn peer_notification_drops_session() {
        let (h, mut peer, _l) = connected("10.1.2.4");
        open_confirm(&mut peer, &h, 90);
        write_message(
            &mut peer,
            Message::Notification(NotificationMessage {
                error_code: ErrorCode::Cease,
                error_subcode: CeaseErrorSubcode::AdministrativeShutdown.into(),
                data: Vec::new(),
            }),
        );
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Idle);
        assert_eq!(h.neighbor.counters_in.get().notification, 1);
    }

    #[test]
    fn peer_close_in_established_idles() {
        let (h, mut peer, _l) = connected("10.1.2.5");
        open_confirm(&mut peer, &h, 90);
        write_message(&mut peer, Message::KeepAlive);
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Established);

        peer.shutdown();
        wait_for_eq!(h.neighbor.state(), FsmStateKind::Idle);
        assert!(!h.timers.keepalive.enabled());
        assert!(h.timers.idle.enabled());
    }

    #[test]
    fn connection_in_idle_is_refused() {
        let h = harness("10.1.3.2", Duration::from_secs(30));
        let listener = BgpListenerChannel::bind(sockaddr!("10.1.3.3:179"))
            .expect("bind");
        let ours = BgpConnectionChannel::connect(
            Some(ip!("10.1.3.2")),
            listener.local(),
            Duration::from_secs(1),
            &ConnectToken::new(),
        )
        .expect("connect");
        let mut theirs = listener
            .accept(Duration::from_secs(1))
            .expect("accept")
            .expect("connection");

        h.tx.send(FsmEvent::TcpConnectionConfirmed(ours)).expect("send");
        let mut buf = [0u8; 1];
        assert_eq!(theirs.read(&mut buf).expect("read"), 0);
        assert_eq!(h.neighbor.state(), FsmStateKind::Idle);
    }

    #[test]
    fn stop_tears_down_connection() {
        let (h, mut peer, _l) = connected("10.1.3.4");
        let Harness { neighbor, _thread, .. } = h;
        drop(_thread);
        assert_eq!(neighbor.state(), FsmStateKind::Idle);
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).expect("read"), 0);
    }

    /// An FSM that is not running, driven directly through `handle`.
    fn standalone(addr: &str) -> Fsm<BgpConnectionChannel> {
        let neighbor = Arc::new(Neighbor::new(ip!(addr)));
        let local = LocalSpeaker {
            asn: 65000,
            router_id: "10.255.0.1".parse().expect("ip"),
            graceful_restart: Arc::default(),
        };
        Fsm::new(neighbor, local, SessionTiming::default(), discard_logger())
            .expect("fsm")
    }

    #[test]
    fn open_sent_ignores_open() {
        let mut fsm = standalone("10.1.4.2");
        fsm.set_state(FsmStateKind::OpenSent);
        let open = OpenMessage::new(65001, 90, ip!("10.0.0.9"), vec![]);
        fsm.handle(FsmEvent::BgpOpen(open));
        assert_eq!(fsm.state, FsmStateKind::OpenSent);
        assert_eq!(fsm.hold_time, 0);
    }

    #[test]
    fn hold_timer_never_started() {
        let mut fsm = standalone("10.1.4.3");
        fsm.set_state(FsmStateKind::OpenConfirm);
        fsm.keepalive_time = 30;
        fsm.handle(FsmEvent::KeepAliveMsg);
        assert_eq!(fsm.state, FsmStateKind::Established);
        assert!(fsm.timers().keepalive.enabled());
        assert!(!fsm.timers().hold.enabled());

        // Expiry events for it are ignored like any other unexpected event.
        fsm.handle(FsmEvent::HoldTimerExpires);
        assert_eq!(fsm.state, FsmStateKind::Established);
        assert!(!fsm.delay_open_timer());
    }

    #[test]
    fn start_ignored_while_connecting() {
        let mut fsm = standalone("10.1.4.4");
        fsm.set_state(FsmStateKind::Connect);
        fsm.handle(FsmEvent::ManualStart);
        fsm.handle(FsmEvent::AutomaticStart);
        assert_eq!(fsm.state, FsmStateKind::Connect);
        assert!(fsm.connect.is_none());
    }

    #[test]
    fn active_connection_failure_idles() {
        let mut fsm = standalone("10.1.4.5");
        fsm.set_state(FsmStateKind::Active);
        fsm.handle(FsmEvent::TcpConnectionFails);
        assert_eq!(fsm.state, FsmStateKind::Idle);
        assert!(fsm.timers().idle.enabled());
        assert!(!fsm.timers().connect_retry.enabled());
    }
}
