// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{BgpConnection, BgpListener};
use crate::error::Error;
use crate::log::dispatcher_log;
use crate::session::FsmEvent;
use crate::{to_canonical, IO_TIMEOUT};
use slog::Logger;
use speaker_common::lock;
use speaker_common::thread::StoppableThread;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

/// Event queues of the FSMs that currently exist, by neighbor address.
pub type SessionMap<Cnx> = Arc<Mutex<BTreeMap<IpAddr, SyncSender<FsmEvent<Cnx>>>>>;

/// Accepts inbound connections and hands each one to the FSM of the
/// neighbor it came from. Connections from unknown addresses are closed.
pub struct Dispatcher {
    pub addr: SocketAddr,
    thread: StoppableThread,
}

impl Dispatcher {
    /// Bind `addr` and start accepting. Binding happens before this
    /// returns, so a busy port is reported to the caller.
    pub fn spawn<Cnx, Listener>(
        addr: SocketAddr,
        sessions: SessionMap<Cnx>,
        log: Logger,
    ) -> Result<Self, Error>
    where
        Cnx: BgpConnection,
        Listener: BgpListener<Cnx>,
    {
        let listener = Listener::bind(addr)?;
        let acceptor = Acceptor {
            addr,
            listener,
            sessions,
            log,
            _cnx: PhantomData,
        };
        dispatcher_log!(acceptor, info, "listening");
        let thread = StoppableThread::spawn("bgp-dispatcher", move |stop| {
            acceptor.run(stop)
        })?;
        Ok(Self { addr, thread })
    }

    /// Stop accepting and release the listening address.
    pub fn stop(&self) {
        self.thread.stop();
    }
}

struct Acceptor<Cnx: BgpConnection, Listener> {
    addr: SocketAddr,
    listener: Listener,
    sessions: SessionMap<Cnx>,
    log: Logger,
    _cnx: PhantomData<fn() -> Cnx>,
}

impl<Cnx, Listener> Acceptor<Cnx, Listener>
where
    Cnx: BgpConnection,
    Listener: BgpListener<Cnx>,
{
    fn run(self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept(IO_TIMEOUT) {
                Ok(Some(cnx)) => self.dispatch(cnx),
                Ok(None) => continue,
                Err(e) => {
                    dispatcher_log!(self, error, "accept: {e}");
                    std::thread::sleep(IO_TIMEOUT);
                }
            }
        }
        dispatcher_log!(self, info, "stopped");
    }

    fn dispatch(&self, cnx: Cnx) {
        let peer = to_canonical(cnx.peer().ip());
        let tx = match lock!(self.sessions).get(&peer) {
            Some(tx) => tx.clone(),
            None => {
                dispatcher_log!(self, info, "closing connection from unknown peer";
                    "remote" => peer.to_string()
                );
                cnx.shutdown();
                return;
            }
        };
        dispatcher_log!(self, debug, "accepted";
            "remote" => peer.to_string()
        );
        if let Err(e) = tx.try_send(FsmEvent::TcpConnectionConfirmed(cnx)) {
            let (TrySendError::Full(event) | TrySendError::Disconnected(event)) =
                e;
            dispatcher_log!(self, warn, "session not taking connections";
                "remote" => peer.to_string()
            );
            if let FsmEvent::TcpConnectionConfirmed(cnx) = event {
                cnx.shutdown();
            }
        }
    }
}
