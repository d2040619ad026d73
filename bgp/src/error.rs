// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::{ErrorCode, ErrorSubcode, NotificationMessage};
use std::net::IpAddr;

/// A protocol level error. Every malformation detected by the codec is
/// reported as one of these, carrying what is needed to build the
/// NOTIFICATION that tells the peer about it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({subcode})")]
pub struct ProtocolError {
    pub subcode: ErrorSubcode,
    pub data: Vec<u8>,
    pub message: String,
}

impl ProtocolError {
    pub fn new(
        subcode: impl Into<ErrorSubcode>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subcode: subcode.into(),
            data: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.subcode.code()
    }

    pub fn to_notification(&self) -> NotificationMessage {
        NotificationMessage {
            error_code: self.code(),
            error_subcode: self.subcode,
            data: self.data.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("message too large: {0}")]
    TooLarge(String),

    #[error("attempt to send a message when not connected")]
    NotConnected,

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("connect to {0} cancelled")]
    ConnectCancelled(String),

    #[error("neighbor {0} already exists")]
    NeighborExists(IpAddr),

    #[error("can't find neighbor {0}")]
    NeighborNotFound(IpAddr),

    #[error("AS already set")]
    AsAlreadySet,

    #[error("address family {0} already configured")]
    AfiSafiExists(String),

    #[error("invalid router id: {0}")]
    InvalidRouterId(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("server has shut down")]
    ServerGone,

    #[error("internal communication error: {0}")]
    InternalCommunication(String),
}
