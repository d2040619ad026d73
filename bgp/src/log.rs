// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-unit logging macros. Each one stamps the standard component, module
//! and unit keys onto the record so output from many sessions can be
//! filtered by peer or by subsystem.

pub const UNIT_FSM: &str = "fsm";
pub const UNIT_CONNECTION: &str = "connection";
pub const UNIT_SERVER: &str = "server";
pub const UNIT_DISPATCHER: &str = "dispatcher";

macro_rules! session_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_FSM,
            "peer" => $self.neighbor.addr.to_string(),
            "state" => $self.state.as_str(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_FSM,
            "peer" => $self.neighbor.addr.to_string(),
            "state" => $self.state.as_str(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_FSM,
            "peer" => $self.neighbor.addr.to_string(),
            "state" => $self.state.as_str(),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_FSM,
            "peer" => $self.neighbor.addr.to_string(),
            "state" => $self.state.as_str(),
        )
    };
}

// Used by the I/O pumps, which run outside the FSM and only have a logger
// and the peer address at hand.
macro_rules! connection_log {
    ($log:expr, $peer:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_CONNECTION,
            "peer" => $peer.to_string(),
            $($key => $value),*
        )
    };
    ($log:expr, $peer:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_CONNECTION,
            "peer" => $peer.to_string(),
            $($key => $value),*
        )
    };
    ($log:expr, $peer:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_CONNECTION,
            "peer" => $peer.to_string(),
        )
    };
    ($log:expr, $peer:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => crate::log::UNIT_CONNECTION,
            "peer" => $peer.to_string(),
        )
    };
}

macro_rules! server_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_SERVER,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_SERVER,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_SERVER,
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_SERVER,
        )
    };
}

macro_rules! dispatcher_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_DISPATCHER,
            "listen" => $self.addr.to_string(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_DISPATCHER,
            "listen" => $self.addr.to_string(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_DISPATCHER,
            "listen" => $self.addr.to_string(),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_SERVER,
            "unit" => crate::log::UNIT_DISPATCHER,
            "listen" => $self.addr.to_string(),
        )
    };
}

pub(crate) use {connection_log, dispatcher_log, server_log, session_log};
