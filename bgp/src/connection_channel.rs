// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory network for tests. Connections are pairs of byte pipes, so
//! the FSM and its I/O pumps run exactly the code they run over TCP, just
//! without sockets. Only compiled for tests.

use crate::connection::{
    BgpConnection, BgpListener, ConnectToken, CONNECT_POLL,
};
use crate::error::Error;
use speaker_common::lock;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Source ports handed out to connecting endpoints.
static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

lazy_static! {
    static ref NET: Network = Network::new();
}

/// A bound address: the queue its listener accepts from and how long a
/// handshake with it takes.
struct Listening {
    tx: Sender<BgpConnectionChannel>,
    delay: Duration,
}

/// Maps listening addresses to the queue their listener accepts from.
struct Network {
    listeners: Mutex<HashMap<SocketAddr, Listening>>,
}

impl Network {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn bind(
        &self,
        addr: SocketAddr,
        delay: Duration,
    ) -> Result<Receiver<BgpConnectionChannel>, Error> {
        let mut listeners = lock!(self.listeners);
        if listeners.contains_key(&addr) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                addr.to_string(),
            )));
        }
        let (tx, rx) = channel();
        listeners.insert(addr, Listening { tx, delay });
        Ok(rx)
    }

    fn unbind(&self, addr: SocketAddr) {
        lock!(self.listeners).remove(&addr);
    }

    fn delay(&self, to: SocketAddr) -> Result<Duration, Error> {
        lock!(self.listeners)
            .get(&to)
            .map(|l| l.delay)
            .ok_or_else(|| Error::ConnectionRefused(to.to_string()))
    }

    /// Connect after the listener's handshake delay. Nothing reaches the
    /// listener when `token` is cancelled first.
    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        timeout: Duration,
        token: &ConnectToken,
    ) -> Result<BgpConnectionChannel, Error> {
        let delay = self.delay(to)?;
        if delay > timeout {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {to}"),
            )));
        }
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if token.is_cancelled() {
                return Err(Error::ConnectCancelled(to.to_string()));
            }
            sleep(CONNECT_POLL);
        }
        if token.is_cancelled() {
            return Err(Error::ConnectCancelled(to.to_string()));
        }

        let listeners = lock!(self.listeners);
        let listening = listeners
            .get(&to)
            .ok_or_else(|| Error::ConnectionRefused(to.to_string()))?;
        let (local, remote) = BgpConnectionChannel::pair(from, to);
        listening
            .tx
            .send(remote)
            .map_err(|_| Error::ConnectionRefused(to.to_string()))?;
        Ok(local)
    }
}

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

/// One direction of a connection.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn close(&self) {
        lock!(self.state).closed = true;
        self.ready.notify_all();
    }
}

pub struct BgpListenerChannel {
    addr: SocketAddr,
    rx: Receiver<BgpConnectionChannel>,
}

impl BgpListenerChannel {
    /// Listen on `addr` with every handshake taking `delay`.
    pub fn bind_with_delay(
        addr: SocketAddr,
        delay: Duration,
    ) -> Result<Self, Error> {
        let rx = NET.bind(addr, delay)?;
        Ok(Self { addr, rx })
    }
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn bind(addr: SocketAddr) -> Result<Self, Error> {
        Self::bind_with_delay(addr, Duration::ZERO)
    }

    fn accept(
        &self,
        timeout: Duration,
    ) -> Result<Option<BgpConnectionChannel>, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(conn) => Ok(Some(conn)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(
                Error::InternalCommunication(format!(
                    "listener {} unbound",
                    self.addr
                )),
            ),
        }
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for BgpListenerChannel {
    fn drop(&mut self) {
        NET.unbind(self.addr);
    }
}

pub struct BgpConnectionChannel {
    local: SocketAddr,
    peer: SocketAddr,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl BgpConnectionChannel {
    fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let ab = Arc::new(Pipe::default());
        let ba = Arc::new(Pipe::default());
        (
            Self {
                local: a,
                peer: b,
                rx: ba.clone(),
                tx: ab.clone(),
            },
            Self {
                local: b,
                peer: a,
                rx: ab,
                tx: ba,
            },
        )
    }
}

impl BgpConnection for BgpConnectionChannel {
    fn connect(
        source: Option<IpAddr>,
        peer: SocketAddr,
        timeout: Duration,
        token: &ConnectToken,
    ) -> Result<Self, Error> {
        let ip = source.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let from = SocketAddr::new(ip, NEXT_PORT.fetch_add(1, Ordering::Relaxed));
        NET.connect(from, peer, timeout, token)
    }

    fn try_clone(&self) -> Result<Self, Error> {
        Ok(Self {
            local: self.local,
            peer: self.peer,
            rx: self.rx.clone(),
            tx: self.tx.clone(),
        })
    }

    fn shutdown(&self) {
        self.rx.close();
        self.tx.close();
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

impl Read for BgpConnectionChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock!(self.rx.state);
        while state.data.is_empty() && !state.closed {
            state = self.rx.ready.wait(state).expect("lock mutex");
        }
        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for BgpConnectionChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock!(self.tx.state);
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ));
        }
        state.data.extend(buf);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use speaker_common::sockaddr;

    #[test]
    fn connect_and_exchange() {
        let listener =
            BgpListenerChannel::bind(sockaddr!("10.0.0.1:179")).expect("bind");
        let mut a = BgpConnectionChannel::connect(
            Some("10.0.0.2".parse().expect("ip")),
            listener.local(),
            Duration::from_secs(1),
            &ConnectToken::new(),
        )
        .expect("connect");
        let mut b = listener
            .accept(Duration::from_secs(1))
            .expect("accept")
            .expect("pending connection");
        assert_eq!(b.peer().ip(), "10.0.0.2".parse::<IpAddr>().expect("ip"));

        a.write_all(b"hello").expect("write");
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hello");

        let mut reader = a.try_clone().expect("clone");
        b.shutdown();
        assert_eq!(reader.read(&mut buf).expect("read"), 0);
        assert!(a.write_all(b"x").is_err());
    }

    #[test]
    fn refused_without_listener() {
        let r = BgpConnectionChannel::connect(
            None,
            sockaddr!("10.0.0.3:179"),
            Duration::from_secs(1),
            &ConnectToken::new(),
        );
        assert!(matches!(r, Err(Error::ConnectionRefused(_))));
    }

    #[test]
    fn rebind_after_drop() {
        let addr = sockaddr!("10.0.0.4:179");
        let first = BgpListenerChannel::bind(addr).expect("bind");
        assert!(BgpListenerChannel::bind(addr).is_err());
        drop(first);
        BgpListenerChannel::bind(addr).expect("rebind");
    }

    #[test]
    fn cancelled_handshake_never_arrives() {
        let listener = BgpListenerChannel::bind_with_delay(
            sockaddr!("10.0.0.5:179"),
            Duration::from_millis(300),
        )
        .expect("bind");
        let token = ConnectToken::new();
        let t = token.clone();
        let dialer = std::thread::spawn(move || {
            BgpConnectionChannel::connect(
                None,
                sockaddr!("10.0.0.5:179"),
                Duration::from_secs(1),
                &t,
            )
        });
        token.cancel();
        let r = dialer.join().expect("join");
        assert!(matches!(r, Err(Error::ConnectCancelled(_))));
        assert!(listener
            .accept(Duration::from_millis(500))
            .expect("accept")
            .is_none());
    }
}
