// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Accepts inbound BGP connections.
pub trait BgpListener<Cnx: BgpConnection>: Send + Sized + 'static {
    fn bind(addr: SocketAddr) -> Result<Self, Error>;

    /// Wait up to `timeout` for a connection. Returns `Ok(None)` when nothing
    /// arrived in time.
    fn accept(&self, timeout: Duration) -> Result<Option<Cnx>, Error>;

    fn local(&self) -> SocketAddr;
}

/// A byte stream to a BGP peer. Handles are cheap to clone and every clone
/// refers to the same underlying connection, so the reader and writer pumps
/// each own one.
pub trait BgpConnection: Read + Write + Send + Sized + 'static {
    /// Open a connection to `peer`, optionally from a specific local
    /// address. The attempt is abandoned with [`Error::ConnectCancelled`] as
    /// soon as `token` is cancelled, and no connection is left behind.
    fn connect(
        source: Option<IpAddr>,
        peer: SocketAddr,
        timeout: Duration,
        token: &ConnectToken,
    ) -> Result<Self, Error>;

    fn try_clone(&self) -> Result<Self, Error>;

    /// Shut down both directions. Blocked reads on any clone return.
    fn shutdown(&self);

    fn peer(&self) -> SocketAddr;

    fn local(&self) -> Option<SocketAddr>;
}

/// How often a connect attempt in progress checks for cancellation.
pub const CONNECT_POLL: Duration = Duration::from_millis(10);

/// Cancellation handle for an outbound connect attempt.
#[derive(Clone, Debug, Default)]
pub struct ConnectToken(Arc<AtomicBool>);

impl ConnectToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
