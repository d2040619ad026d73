// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{BgpConnection, BgpListener, ConnectToken, CONNECT_POLL};
use crate::error::Error;
use crate::to_canonical;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// How often a non-blocking accept is retried while waiting.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub struct BgpListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
    fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { addr, listener })
    }

    fn accept(
        &self,
        timeout: Duration,
    ) -> Result<Option<BgpConnectionTcp>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, mut peer)) => {
                    stream.set_nonblocking(false)?;
                    peer.set_ip(to_canonical(peer.ip()));
                    return Ok(Some(BgpConnectionTcp { peer, stream }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}

fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
        || e.kind() == io::ErrorKind::WouldBlock
}

fn connect_error(peer: SocketAddr, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => {
            Error::ConnectionRefused(peer.to_string())
        }
        _ => Error::Io(e),
    }
}

/// Wait for a non-blocking connect to finish. Dropping the socket on
/// cancellation or timeout aborts the handshake.
fn wait_connected(
    socket: &Socket,
    peer: SocketAddr,
    timeout: Duration,
    token: &ConnectToken,
) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(e) = socket.take_error()? {
            return Err(connect_error(peer, e));
        }
        // A peer address is only known once the handshake completed.
        if socket.peer_addr().is_ok() {
            return Ok(());
        }
        if token.is_cancelled() {
            return Err(Error::ConnectCancelled(peer.to_string()));
        }
        if Instant::now() >= deadline {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {peer}"),
            )));
        }
        sleep(CONNECT_POLL);
    }
}

pub struct BgpConnectionTcp {
    peer: SocketAddr,
    stream: TcpStream,
}

impl BgpConnection for BgpConnectionTcp {
    fn connect(
        source: Option<IpAddr>,
        peer: SocketAddr,
        timeout: Duration,
        token: &ConnectToken,
    ) -> Result<Self, Error> {
        let socket = Socket::new(
            Domain::for_address(peer),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        if let Some(ip) = source {
            socket.bind(&SocketAddr::new(ip, 0).into())?;
        }
        socket.set_nonblocking(true)?;
        match socket.connect(&peer.into()) {
            Ok(()) => {}
            Err(e) if in_progress(&e) => {
                wait_connected(&socket, peer, timeout, token)?
            }
            Err(e) => return Err(connect_error(peer, e)),
        }
        socket.set_nonblocking(false)?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(Self { peer, stream })
    }

    fn try_clone(&self) -> Result<Self, Error> {
        Ok(Self {
            peer: self.peer,
            stream: self.stream.try_clone()?,
        })
    }

    fn shutdown(&self) {
        // Fails with NotConnected once the peer is gone, which is the
        // outcome we want anyway.
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }
}

impl Read for BgpConnectionTcp {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for BgpConnectionTcp {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use speaker_common::sockaddr;

    #[test]
    fn connect_accept_and_shutdown() {
        let listener =
            BgpListenerTcp::bind(sockaddr!("127.0.0.1:0")).expect("bind");
        let addr = listener.listener.local_addr().expect("local addr");

        let mut client =
            BgpConnectionTcp::connect(
                None,
                addr,
                Duration::from_secs(1),
                &ConnectToken::new(),
            )
            .expect("connect");
        let mut server = listener
            .accept(Duration::from_secs(1))
            .expect("accept")
            .expect("connection before timeout");
        assert_eq!(server.peer().ip(), client.local().expect("local").ip());

        client.write_all(&[1, 2, 3]).expect("write");
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3]);

        let mut reader = server.try_clone().expect("clone");
        server.shutdown();
        assert_eq!(reader.read(&mut buf).expect("read after shutdown"), 0);
    }

    #[test]
    fn connect_from_source() {
        let listener =
            BgpListenerTcp::bind(sockaddr!("127.0.0.1:0")).expect("bind");
        let addr = listener.listener.local_addr().expect("local addr");
        let client = BgpConnectionTcp::connect(
            Some("127.0.0.1".parse().expect("ip")),
            addr,
            Duration::from_secs(1),
            &ConnectToken::new(),
        )
        .expect("connect");
        let local = client.local().expect("local");
        assert_eq!(local.ip(), "127.0.0.1".parse::<IpAddr>().expect("ip"));
        assert!(listener
            .accept(Duration::from_secs(1))
            .expect("accept")
            .is_some());
    }

    #[test]
    fn refused_when_nothing_listens() {
        let listener =
            BgpListenerTcp::bind(sockaddr!("127.0.0.1:0")).expect("bind");
        let addr = listener.listener.local_addr().expect("local addr");
        drop(listener);
        let r = BgpConnectionTcp::connect(
            None,
            addr,
            Duration::from_secs(1),
            &ConnectToken::new(),
        );
        assert!(matches!(r, Err(Error::ConnectionRefused(_))));
    }

    #[test]
    fn cancelled_connect_returns_early() {
        // TEST-NET-1 never answers, so the handshake stays pending.
        let token = ConnectToken::new();
        let t = token.clone();
        let canceller = std::thread::spawn(move || {
            sleep(Duration::from_millis(100));
            t.cancel();
        });
        let start = Instant::now();
        let r = BgpConnectionTcp::connect(
            None,
            sockaddr!("192.0.2.1:179"),
            Duration::from_secs(10),
            &token,
        );
        canceller.join().expect("join");
        match r {
            Err(Error::ConnectCancelled(_)) => {}
            // Hosts without a route fail before the cancel lands.
            Err(Error::Io(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("connected to a documentation address"),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn accept_times_out() {
        let listener =
            BgpListenerTcp::bind(sockaddr!("127.0.0.1:0")).expect("bind");
        let conn = listener
            .accept(Duration::from_millis(30))
            .expect("accept");
        assert!(conn.is_none());
    }
}
