// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::BgpConnection;
use crate::session::FsmEvent;
use slog::{debug, warn, Logger};
use speaker_common::lock;
use speaker_common::thread::StoppableThread;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

/// Intervals the clock starts out with.
#[derive(Debug, Clone, Copy)]
pub struct ClockIntervals {
    pub resolution: Duration,
    pub idle: Duration,
    pub connect_retry: Duration,
    pub keepalive: Duration,
    pub hold: Duration,
    pub delay_open: Duration,
}

/// Drives the timers of one FSM from a polling thread. Expired timers only
/// ever enqueue an event; all reactions happen on the FSM thread.
pub struct Clock {
    pub resolution: Duration,
    pub timers: Arc<ClockTimers>,
    _thread: StoppableThread,
}

pub struct ClockTimers {
    /// Restarts the FSM after it fell back to idle.
    pub idle: Timer,

    /// When set, the idle timer issues the passive start event.
    pub idle_passive: AtomicBool,

    /// How long to wait between connection attempts.
    pub connect_retry: Timer,

    /// Time between sending keepalive messages. The interval is replaced
    /// with the negotiated one when an OPEN arrives.
    pub keepalive: Timer,

    /// Present for completeness, nothing starts it.
    pub hold: Timer,

    pub delay_open: Timer,
}

impl Clock {
    pub fn new<Cnx: BgpConnection>(
        intervals: ClockIntervals,
        event_tx: SyncSender<FsmEvent<Cnx>>,
        log: Logger,
    ) -> std::io::Result<Self> {
        let timers = Arc::new(ClockTimers {
            idle: Timer::new(intervals.idle),
            idle_passive: AtomicBool::new(false),
            connect_retry: Timer::new(intervals.connect_retry),
            keepalive: Timer::new(intervals.keepalive),
            hold: Timer::new(intervals.hold),
            delay_open: Timer::new(intervals.delay_open),
        });
        let resolution = intervals.resolution;
        let t = timers.clone();
        let thread = StoppableThread::spawn("bgp-clock", move |stop| {
            while !stop.load(Ordering::Relaxed) {
                sleep(resolution);
                Self::step_all(resolution, &t, &event_tx, &log);
            }
        })?;
        Ok(Self {
            resolution,
            timers,
            _thread: thread,
        })
    }

    fn step_all<Cnx: BgpConnection>(
        resolution: Duration,
        timers: &ClockTimers,
        s: &SyncSender<FsmEvent<Cnx>>,
        log: &Logger,
    ) {
        Self::step(resolution, &timers.idle, s, log, || {
            if timers.idle_passive.load(Ordering::Relaxed) {
                FsmEvent::PassiveManualStart
            } else {
                FsmEvent::ManualStart
            }
        });
        Self::step(resolution, &timers.connect_retry, s, log, || {
            FsmEvent::ConnectRetryTimerExpires
        });
        Self::step(resolution, &timers.keepalive, s, log, || {
            FsmEvent::KeepaliveTimerExpires
        });
        Self::step(resolution, &timers.hold, s, log, || {
            FsmEvent::HoldTimerExpires
        });
        Self::step(resolution, &timers.delay_open, s, log, || {
            FsmEvent::DelayOpenTimerExpires
        });
    }

    fn step<Cnx: BgpConnection>(
        resolution: Duration,
        t: &Timer,
        s: &SyncSender<FsmEvent<Cnx>>,
        log: &Logger,
        event: impl FnOnce() -> FsmEvent<Cnx>,
    ) {
        if !t.tick(resolution) {
            return;
        }
        let event = event();
        let title = event.title();
        match s.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(log, "event queue full, dropping {title}";
                    "component" => crate::COMPONENT_BGP,
                    "module" => crate::MOD_CLOCK,
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(log, "fsm gone, dropping {title}";
                    "component" => crate::COMPONENT_BGP,
                    "module" => crate::MOD_CLOCK,
                );
            }
        }
    }
}

impl Debug for Clock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("resolution", &self.resolution)
            .field("idle", &self.timers.idle)
            .field("connect_retry", &self.timers.connect_retry)
            .field("keepalive", &self.timers.keepalive)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerState {
    enabled: bool,
    interval: Duration,
    remaining: Duration,
}

/// A one-shot countdown. Once it expires it disables itself and must be
/// started again.
pub struct Timer {
    value: Mutex<TimerState>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            value: Mutex::new(TimerState {
                enabled: false,
                interval,
                remaining: interval,
            }),
        }
    }

    /// Arm the timer with its full interval.
    pub fn start(&self) {
        let mut v = lock!(self.value);
        v.remaining = v.interval;
        v.enabled = true;
    }

    pub fn stop(&self) {
        lock!(self.value).enabled = false;
    }

    pub fn enabled(&self) -> bool {
        lock!(self.value).enabled
    }

    pub fn interval(&self) -> Duration {
        lock!(self.value).interval
    }

    /// Change the interval used by the next `start`.
    pub fn set_interval(&self, interval: Duration) {
        lock!(self.value).interval = interval;
    }

    /// Count down by `resolution`. Returns true exactly once per start,
    /// when the timer runs out, and leaves the timer disabled.
    pub fn tick(&self, resolution: Duration) -> bool {
        let mut v = lock!(self.value);
        if !v.enabled {
            return false;
        }
        v.remaining = v.remaining.saturating_sub(resolution);
        if v.remaining.is_zero() {
            v.enabled = false;
            return true;
        }
        false
    }
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let v = *lock!(self.value);
        write!(
            f,
            "{}/{:?}",
            if v.enabled { "on" } else { "off" },
            v.remaining
        )
    }
}
