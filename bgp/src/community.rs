// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! COMMUNITIES attribute values (RFC 1997).

use crate::error::Error;
use std::fmt::{self, Display, Formatter};

pub const INTERNET: u32 = 0x0000_0000;
pub const GRACEFUL_SHUTDOWN: u32 = 0xffff_0000;
pub const NO_EXPORT: u32 = 0xffff_ff01;
pub const NO_ADVERTISE: u32 = 0xffff_ff02;
pub const LOCAL_AS: u32 = 0xffff_ff03;
pub const NO_PEER: u32 = 0xffff_ff04;

const WELL_KNOWN: &[(u32, &str)] = &[
    (INTERNET, "internet"),
    (GRACEFUL_SHUTDOWN, "graceful-shutdown"),
    (NO_EXPORT, "no-export"),
    (NO_ADVERTISE, "no-advertise"),
    (LOCAL_AS, "local-AS"),
    (NO_PEER, "no-peer"),
];

/// Short spellings accepted on input.
const ALIASES: &[(&str, u32)] = &[("gshut", GRACEFUL_SHUTDOWN), ("nopeer", NO_PEER)];

fn well_known_name(value: u32) -> Option<&'static str> {
    WELL_KNOWN
        .iter()
        .find_map(|(v, name)| (*v == value).then_some(*name))
}

/// Parse one community: a well known name, `asn:value` with two 16 bit
/// halves, or a plain 32 bit number.
pub fn parse_value(s: &str) -> Result<u32, Error> {
    if let Some(v) = WELL_KNOWN
        .iter()
        .find_map(|(v, name)| (*name == s).then_some(*v))
        .or_else(|| ALIASES.iter().find_map(|(a, v)| (*a == s).then_some(*v)))
    {
        return Ok(v);
    }
    let bad = |e: std::num::ParseIntError| {
        Error::Parse(format!("community {s}: {e}"))
    };
    match s.split_once(':') {
        Some((hi, lo)) => {
            let hi: u16 = hi.parse().map_err(bad)?;
            let lo: u16 = lo.parse().map_err(bad)?;
            Ok(u32::from(hi) << 16 | u32::from(lo))
        }
        None => s.parse().map_err(bad),
    }
}

/// An ordered list of community values, as carried by one COMMUNITIES
/// attribute.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Communities(pub Vec<u32>);

impl Communities {
    /// Sort ascending and drop duplicates.
    pub fn sort_unique(mut self) -> Self {
        self.0.sort_unstable();
        self.0.dedup();
        self
    }

    pub fn contains(&self, value: u32) -> bool {
        self.0.contains(&value)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        self.0.iter().flat_map(|c| c.to_be_bytes()).collect()
    }
}

impl Display for Communities {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .0
            .iter()
            .map(|v| match well_known_name(*v) {
                Some(name) => name.to_string(),
                None => format!("{}:{}", v >> 16, v & 0xffff),
            })
            .collect();
        write!(f, "{}", items.join(" "))
    }
}

impl std::str::FromStr for Communities {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_whitespace()
            .map(parse_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Communities)
    }
}
