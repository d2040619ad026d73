// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OPEN optional parameters and the capabilities they carry (RFC 5492).

use crate::error::{Error, ProtocolError};
use crate::messages::{parse, HeaderErrorSubcode};
use nom::{bytes::complete::take, number::complete::be_u8};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Address family identifiers.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, TryFromPrimitive)]
#[repr(u16)]
pub enum Afi {
    Ip = 1,
    Ip6 = 2,
    L2vpn = 25,
    Ls = 16388,
    Opaque = 16397,
}

impl Afi {
    fn name(self) -> &'static str {
        match self {
            Self::Ip => "ipv4",
            Self::Ip6 => "ipv6",
            Self::L2vpn => "l2vpn",
            Self::Ls => "ls",
            Self::Opaque => "opaque",
        }
    }

    const ALL: [Afi; 5] =
        [Self::Ip, Self::Ip6, Self::L2vpn, Self::Ls, Self::Opaque];
}

/// Subsequent address family identifiers.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
    MplsLabel = 4,
    Encapsulation = 7,
    Vpls = 65,
    Evpn = 70,
    Ls = 71,
    LsVpn = 72,
    MplsVpn = 128,
    MplsVpnMulticast = 129,
    RtConstraints = 132,
    FlowSpecUnicast = 133,
    FlowSpecVpn = 134,
    KeyValue = 241,
}

impl Safi {
    fn name(self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Multicast => "multicast",
            Self::MplsLabel => "label",
            Self::Encapsulation => "encap",
            Self::Vpls => "vpls",
            Self::Evpn => "evpn",
            Self::Ls => "ls",
            Self::LsVpn => "ls-vpn",
            Self::MplsVpn => "vpn",
            Self::MplsVpnMulticast => "vpn-multicast",
            Self::RtConstraints => "rt-constraints",
            Self::FlowSpecUnicast => "flowspec-unicast",
            Self::FlowSpecVpn => "flowspec-vpn",
            Self::KeyValue => "key",
        }
    }

    const ALL: [Safi; 14] = [
        Self::Unicast,
        Self::Multicast,
        Self::MplsLabel,
        Self::Encapsulation,
        Self::Vpls,
        Self::Evpn,
        Self::Ls,
        Self::LsVpn,
        Self::MplsVpn,
        Self::MplsVpnMulticast,
        Self::RtConstraints,
        Self::FlowSpecUnicast,
        Self::FlowSpecVpn,
        Self::KeyValue,
    ];
}

/// An address family pair, written as `ipv4-unicast`, `l2vpn-evpn` and so
/// on.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize,
    Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct AfiSafi {
    pub afi: Afi,
    pub safi: Safi,
}

impl AfiSafi {
    pub const IPV4_UNICAST: AfiSafi = AfiSafi {
        afi: Afi::Ip,
        safi: Safi::Unicast,
    };

    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }
}

impl Display for AfiSafi {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.afi.name(), self.safi.name())
    }
}

impl std::str::FromStr for AfiSafi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::Parse(format!("address family {s}"));
        let (afi, safi) = s.split_once('-').ok_or_else(bad)?;
        let afi = Afi::ALL
            .into_iter()
            .find(|a| a.name() == afi)
            .ok_or_else(bad)?;
        let safi = Safi::ALL
            .into_iter()
            .find(|x| x.name() == safi)
            .ok_or_else(bad)?;
        Ok(Self { afi, safi })
    }
}

impl TryFrom<String> for AfiSafi {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AfiSafi> for String {
    fn from(a: AfiSafi) -> String {
        a.to_string()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492
    Capabilities(Vec<Capability>),

    /// Any other parameter type, kept as received.
    Unknown { code: u8, value: Vec<u8> },
}

pub const OPT_PARAM_CAPABILITIES: u8 = 2;

fn bad_length(what: &str) -> ProtocolError {
    ProtocolError::new(HeaderErrorSubcode::BadMessageLength, what)
}

impl OptionalParameter {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let (code, value) = match self {
            Self::Capabilities(cs) => {
                let mut buf = Vec::new();
                for c in cs {
                    buf.extend_from_slice(&c.to_wire()?);
                }
                (OPT_PARAM_CAPABILITIES, buf)
            }
            Self::Unknown { code, value } => (*code, value.clone()),
        };
        let len = u8::try_from(value.len()).map_err(|_| {
            Error::TooLarge(format!("optional parameter {code}"))
        })?;
        let mut buf = vec![code, len];
        buf.extend_from_slice(&value);
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
    ) -> Result<(&[u8], OptionalParameter), ProtocolError> {
        let short = || bad_length("optional parameter");
        let (input, code) = parse(input, be_u8, short)?;
        let (input, len) = parse(input, be_u8, short)?;
        let (input, mut value) = parse(input, take(len), short)?;

        if code != OPT_PARAM_CAPABILITIES {
            return Ok((
                input,
                Self::Unknown {
                    code,
                    value: value.to_vec(),
                },
            ));
        }

        let mut caps = Vec::new();
        while !value.is_empty() {
            let (rest, cap) = Capability::from_wire(value)?;
            caps.push(cap);
            value = rest;
        }
        Ok((input, Self::Capabilities(caps)))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    MultiprotocolExtensions = 1,
    RouteRefresh = 2,
    CarryingLabelInfo = 4,
    GracefulRestart = 64,
    FourOctetAs = 65,
    AddPath = 69,
    EnhancedRouteRefresh = 70,
    LongLivedGracefulRestart = 71,
    PrestandardRouteRefresh = 128,
}

/// Graceful restart "Restart State" bit, in the 4 bit flags field.
pub const GR_RESTART_FLAG: u8 = 0x8;

/// Graceful restart per address family "Forwarding State" bit.
pub const GR_FORWARDING_PRESERVED: u8 = 0x80;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GracefulRestartTuple {
    pub afi: u16,
    pub safi: u8,
    pub flags: u8,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LlgrTuple {
    pub afi: u16,
    pub safi: u8,
    pub flags: u8,
    /// Stale time in seconds, 24 bits.
    pub stale_time: u32,
}

/// The `AddPathElement` comes as a BGP capability extension as described in
/// RFC 7911.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AddPathElement {
    pub afi: u16,
    pub safi: u8,
    /// 1 receive, 2 send, 3 both.
    pub send_receive: u8,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Capability {
    /// RFC 4760
    MultiProtocol { afi: u16, safi: u8 },

    /// RFC 2918
    RouteRefresh,

    /// RFC 3107
    CarryingLabelInfo,

    /// RFC 4724
    GracefulRestart {
        /// Upper 4 bits of the restart word.
        flags: u8,
        /// Restart time in seconds, 12 bits.
        restart_time: u16,
        tuples: Vec<GracefulRestartTuple>,
    },

    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// RFC 7911
    AddPath { elements: Vec<AddPathElement> },

    /// RFC 7313
    EnhancedRouteRefresh,

    /// draft-uttaro-idr-bgp-persistence
    LongLivedGracefulRestart { tuples: Vec<LlgrTuple> },

    /// RFC 8810, pre-standard route refresh
    PrestandardRouteRefresh,

    Unknown { code: u8, value: Vec<u8> },
}

impl Capability {
    pub fn code(&self) -> u8 {
        use CapabilityCode as C;
        let c = match self {
            Self::MultiProtocol { .. } => C::MultiprotocolExtensions,
            Self::RouteRefresh => C::RouteRefresh,
            Self::CarryingLabelInfo => C::CarryingLabelInfo,
            Self::GracefulRestart { .. } => C::GracefulRestart,
            Self::FourOctetAs { .. } => C::FourOctetAs,
            Self::AddPath { .. } => C::AddPath,
            Self::EnhancedRouteRefresh => C::EnhancedRouteRefresh,
            Self::LongLivedGracefulRestart { .. } => {
                C::LongLivedGracefulRestart
            }
            Self::PrestandardRouteRefresh => C::PrestandardRouteRefresh,
            Self::Unknown { code, .. } => return *code,
        };
        c as u8
    }

    fn value_to_wire(&self) -> Vec<u8> {
        match self {
            Self::MultiProtocol { afi, safi } => {
                let mut buf = afi.to_be_bytes().to_vec();
                buf.push(0);
                buf.push(*safi);
                buf
            }
            Self::RouteRefresh
            | Self::CarryingLabelInfo
            | Self::EnhancedRouteRefresh
            | Self::PrestandardRouteRefresh => Vec::new(),
            Self::GracefulRestart {
                flags,
                restart_time,
                tuples,
            } => {
                let word = u16::from(*flags & 0xf) << 12 | (restart_time & 0xfff);
                let mut buf = word.to_be_bytes().to_vec();
                for t in tuples {
                    buf.extend_from_slice(&t.afi.to_be_bytes());
                    buf.push(t.safi);
                    buf.push(t.flags);
                }
                buf
            }
            Self::FourOctetAs { asn } => asn.to_be_bytes().to_vec(),
            Self::AddPath { elements } => {
                let mut buf = Vec::new();
                for e in elements {
                    buf.extend_from_slice(&e.afi.to_be_bytes());
                    buf.push(e.safi);
                    buf.push(e.send_receive);
                }
                buf
            }
            Self::LongLivedGracefulRestart { tuples } => {
                let mut buf = Vec::new();
                for t in tuples {
                    buf.extend_from_slice(&t.afi.to_be_bytes());
                    buf.push(t.safi);
                    buf.push(t.flags);
                    buf.extend_from_slice(&t.stale_time.to_be_bytes()[1..]);
                }
                buf
            }
            Self::Unknown { value, .. } => value.clone(),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let value = self.value_to_wire();
        let len = u8::try_from(value.len()).map_err(|_| {
            Error::TooLarge(format!("capability {}", self.code()))
        })?;
        let mut buf = vec![self.code(), len];
        buf.extend_from_slice(&value);
        Ok(buf)
    }

    /// Decode one capability TLV. Length violations are reported as header
    /// bad-message-length errors.
    pub fn from_wire(
        input: &[u8],
    ) -> Result<(&[u8], Capability), ProtocolError> {
        let short = || bad_length("capability header");
        let (input, code) = parse(input, be_u8, short)?;
        let (input, len) = parse(input, be_u8, short)?;
        let (rest, v) = parse(input, take(len), || {
            bad_length("capability length exceeds parameter")
        })?;

        let Ok(typed) = CapabilityCode::try_from(code) else {
            return Ok((
                rest,
                Self::Unknown {
                    code,
                    value: v.to_vec(),
                },
            ));
        };
        let wrong = || {
            bad_length(&format!("{typed:?} capability of length {}", v.len()))
        };

        let cap = match typed {
            CapabilityCode::MultiprotocolExtensions => {
                if v.len() != 4 {
                    return Err(wrong());
                }
                Self::MultiProtocol {
                    afi: u16::from_be_bytes([v[0], v[1]]),
                    safi: v[3],
                }
            }
            CapabilityCode::RouteRefresh => Self::RouteRefresh,
            CapabilityCode::CarryingLabelInfo => Self::CarryingLabelInfo,
            CapabilityCode::EnhancedRouteRefresh => Self::EnhancedRouteRefresh,
            CapabilityCode::PrestandardRouteRefresh => {
                Self::PrestandardRouteRefresh
            }
            CapabilityCode::GracefulRestart => {
                if v.len() < 2 || (v.len() - 2) % 4 != 0 {
                    return Err(wrong());
                }
                let word = u16::from_be_bytes([v[0], v[1]]);
                Self::GracefulRestart {
                    flags: (word >> 12) as u8,
                    restart_time: word & 0xfff,
                    tuples: v[2..]
                        .chunks_exact(4)
                        .map(|c| GracefulRestartTuple {
                            afi: u16::from_be_bytes([c[0], c[1]]),
                            safi: c[2],
                            flags: c[3],
                        })
                        .collect(),
                }
            }
            CapabilityCode::FourOctetAs => {
                let asn: [u8; 4] = v.try_into().map_err(|_| wrong())?;
                Self::FourOctetAs {
                    asn: u32::from_be_bytes(asn),
                }
            }
            CapabilityCode::AddPath => {
                if v.is_empty() || v.len() % 4 != 0 {
                    return Err(wrong());
                }
                Self::AddPath {
                    elements: v
                        .chunks_exact(4)
                        .map(|c| AddPathElement {
                            afi: u16::from_be_bytes([c[0], c[1]]),
                            safi: c[2],
                            send_receive: c[3],
                        })
                        .collect(),
                }
            }
            CapabilityCode::LongLivedGracefulRestart => {
                if v.len() % 7 != 0 {
                    return Err(wrong());
                }
                Self::LongLivedGracefulRestart {
                    tuples: v
                        .chunks_exact(7)
                        .map(|c| LlgrTuple {
                            afi: u16::from_be_bytes([c[0], c[1]]),
                            safi: c[2],
                            flags: c[3],
                            stale_time: u32::from_be_bytes([
                                0, c[4], c[5], c[6],
                            ]),
                        })
                        .collect(),
                }
            }
        };
        Ok((rest, cap))
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiProtocol { afi, safi } => {
                match (Afi::try_from(*afi), Safi::try_from(*safi)) {
                    (Ok(a), Ok(s)) => {
                        write!(f, "multiprotocol {}", AfiSafi::new(a, s))
                    }
                    _ => write!(f, "multiprotocol {afi}/{safi}"),
                }
            }
            Self::FourOctetAs { asn } => write!(f, "4-octet as {asn}"),
            Self::GracefulRestart {
                flags,
                restart_time,
                ..
            } => write!(
                f,
                "graceful restart flags={flags:#x} time={restart_time}"
            ),
            Self::Unknown { code, .. } => write!(f, "unknown {code}"),
            other => match CapabilityCode::try_from(other.code()) {
                Ok(c) => write!(f, "{c:?}"),
                Err(_) => write!(f, "{}", other.code()),
            },
        }
    }
}
