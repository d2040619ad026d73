// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UPDATE path attributes.
//!
//! Each attribute is framed as flags, type code, a one or two byte length and
//! the value. Known type codes decode into a typed [`PathAttributeValue`];
//! anything else is carried as [`PathAttributeValue::Unknown`] and written
//! back unchanged.

use crate::aspath::AsPath;
use crate::community::Communities;
use crate::error::{Error, ProtocolError};
use crate::messages::{parse, UpdateErrorSubcode};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, be_u8},
};
use num_enum::TryFromPrimitive;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub mod path_attribute_flags {
    pub const OPTIONAL: u8 = 0b10000000;
    pub const TRANSITIVE: u8 = 0b01000000;
    pub const PARTIAL: u8 = 0b00100000;
    pub const EXTENDED_LENGTH: u8 = 0b00010000;
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PathAttributeTypeCode {
    /// RFC 4271
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,

    /// RFC 1997
    Communities = 8,

    /// RFC 4456
    OriginatorId = 9,
    ClusterList = 10,

    /// RFC 8669
    PrefixSid = 40,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PathOrigin {
    /// Interior gateway protocol
    Igp = 0,
    /// Exterior gateway protocol
    Egp = 1,
    Incomplete = 2,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PathAttributeValue {
    Origin(PathOrigin),
    AsPath(AsPath),
    NextHop(IpAddr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    /// The AS is 16 bits wide when decoded from the 6 byte form.
    Aggregator {
        asn: u32,
        address: Ipv4Addr,
        four_octet: bool,
    },
    Communities(Communities),
    OriginatorId(IpAddr),
    ClusterList(Vec<Ipv4Addr>),
    PrefixSid(Vec<PrefixSidTlv>),
    Unknown {
        type_code: u8,
        value: Vec<u8>,
    },
}

impl PathAttributeValue {
    pub fn type_code(&self) -> u8 {
        use PathAttributeTypeCode as T;
        let t = match self {
            Self::Origin(_) => T::Origin,
            Self::AsPath(_) => T::AsPath,
            Self::NextHop(_) => T::NextHop,
            Self::MultiExitDisc(_) => T::MultiExitDisc,
            Self::LocalPref(_) => T::LocalPref,
            Self::AtomicAggregate => T::AtomicAggregate,
            Self::Aggregator { .. } => T::Aggregator,
            Self::Communities(_) => T::Communities,
            Self::OriginatorId(_) => T::OriginatorId,
            Self::ClusterList(_) => T::ClusterList,
            Self::PrefixSid(_) => T::PrefixSid,
            Self::Unknown { type_code, .. } => return *type_code,
        };
        t as u8
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        Ok(match self {
            Self::Origin(o) => vec![*o as u8],
            Self::AsPath(p) => p.to_wire()?,
            Self::NextHop(nh) | Self::OriginatorId(nh) => ip_octets(nh),
            Self::MultiExitDisc(v) | Self::LocalPref(v) => {
                v.to_be_bytes().to_vec()
            }
            Self::AtomicAggregate => Vec::new(),
            Self::Aggregator {
                asn,
                address,
                four_octet,
            } => {
                let mut buf = if *four_octet {
                    asn.to_be_bytes().to_vec()
                } else {
                    let asn = u16::try_from(*asn).map_err(|_| {
                        Error::TooLarge(format!("2 octet aggregator {asn}"))
                    })?;
                    asn.to_be_bytes().to_vec()
                };
                buf.extend_from_slice(&address.octets());
                buf
            }
            Self::Communities(c) => c.to_wire(),
            Self::ClusterList(ids) => {
                ids.iter().flat_map(|id| id.octets()).collect()
            }
            Self::PrefixSid(tlvs) => {
                let mut buf = Vec::new();
                for t in tlvs {
                    buf.extend_from_slice(&t.to_wire()?);
                }
                buf
            }
            Self::Unknown { value, .. } => value.clone(),
        })
    }

    /// Decode the value of an attribute of type `type_code`. `input` holds
    /// exactly the declared value length.
    pub fn from_wire(
        type_code: u8,
        input: &[u8],
    ) -> Result<PathAttributeValue, ProtocolError> {
        let Ok(code) = PathAttributeTypeCode::try_from(type_code) else {
            return Ok(Self::Unknown {
                type_code,
                value: input.to_vec(),
            });
        };
        let len = input.len();
        let bad_length = || {
            ProtocolError::new(
                UpdateErrorSubcode::AttributeLength,
                format!("{code:?} attribute with value length {len}"),
            )
        };

        match code {
            PathAttributeTypeCode::Origin => {
                let first = *input.first().ok_or_else(bad_length)?;
                let origin = PathOrigin::try_from(first).map_err(|_| {
                    ProtocolError::new(
                        UpdateErrorSubcode::InvalidOriginAttribute,
                        format!("origin {first}"),
                    )
                })?;
                Ok(Self::Origin(origin))
            }
            PathAttributeTypeCode::AsPath => {
                Ok(Self::AsPath(AsPath::from_wire(input)?))
            }
            PathAttributeTypeCode::NextHop => {
                Ok(Self::NextHop(ip_from_wire(input).ok_or_else(bad_length)?))
            }
            PathAttributeTypeCode::MultiExitDisc => {
                Ok(Self::MultiExitDisc(exact_u32(input).ok_or_else(bad_length)?))
            }
            PathAttributeTypeCode::LocalPref => {
                Ok(Self::LocalPref(exact_u32(input).ok_or_else(bad_length)?))
            }
            PathAttributeTypeCode::AtomicAggregate => {
                if !input.is_empty() {
                    return Err(bad_length());
                }
                Ok(Self::AtomicAggregate)
            }
            PathAttributeTypeCode::Aggregator => {
                let (asn, rest, four_octet) = match len {
                    6 => (
                        u32::from(u16::from_be_bytes([input[0], input[1]])),
                        &input[2..],
                        false,
                    ),
                    8 => (
                        u32::from_be_bytes([
                            input[0], input[1], input[2], input[3],
                        ]),
                        &input[4..],
                        true,
                    ),
                    _ => return Err(bad_length()),
                };
                Ok(Self::Aggregator {
                    asn,
                    address: Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]),
                    four_octet,
                })
            }
            PathAttributeTypeCode::Communities => {
                if len % 4 != 0 {
                    return Err(bad_length());
                }
                Ok(Self::Communities(Communities(
                    input
                        .chunks_exact(4)
                        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )))
            }
            PathAttributeTypeCode::OriginatorId => Ok(Self::OriginatorId(
                ip_from_wire(input).ok_or_else(bad_length)?,
            )),
            PathAttributeTypeCode::ClusterList => {
                if len % 4 != 0 {
                    return Err(bad_length());
                }
                Ok(Self::ClusterList(
                    input
                        .chunks_exact(4)
                        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                        .collect(),
                ))
            }
            PathAttributeTypeCode::PrefixSid => {
                if len < 3 {
                    return Err(bad_length());
                }
                let mut tlvs = Vec::new();
                let mut buf = input;
                while !buf.is_empty() {
                    let (rest, tlv) = PrefixSidTlv::from_wire(buf)?;
                    tlvs.push(tlv);
                    buf = rest;
                }
                Ok(Self::PrefixSid(tlvs))
            }
        }
    }
}

fn ip_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn ip_from_wire(input: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(input) {
        return Some(IpAddr::V4(octets.into()));
    }
    <[u8; 16]>::try_from(input)
        .ok()
        .map(|octets| IpAddr::V6(octets.into()))
}

fn exact_u32(input: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(input).ok().map(u32::from_be_bytes)
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PathAttribute {
    /// Optional, transitive and partial bits. The extended length bit is a
    /// property of the encoding and never kept here.
    pub flags: u8,
    pub value: PathAttributeValue,
}

impl From<PathAttributeValue> for PathAttribute {
    fn from(value: PathAttributeValue) -> Self {
        use path_attribute_flags::{OPTIONAL, TRANSITIVE};
        let flags = match value {
            PathAttributeValue::Origin(_)
            | PathAttributeValue::AsPath(_)
            | PathAttributeValue::NextHop(_)
            | PathAttributeValue::LocalPref(_)
            | PathAttributeValue::AtomicAggregate => TRANSITIVE,
            PathAttributeValue::Aggregator { .. }
            | PathAttributeValue::Communities(_)
            | PathAttributeValue::PrefixSid(_) => OPTIONAL | TRANSITIVE,
            _ => OPTIONAL,
        };
        Self { flags, value }
    }
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        self.value.type_code()
    }

    /// Serialize flags, type, length and value. The length takes two bytes,
    /// with the extended length bit set, only for values longer than 255
    /// bytes.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let value = self.value.to_wire()?;
        let extended = value.len() > usize::from(u8::MAX);
        let mut flags = self.flags & !path_attribute_flags::EXTENDED_LENGTH;
        if extended {
            flags |= path_attribute_flags::EXTENDED_LENGTH;
        }
        let mut buf = vec![flags, self.type_code()];
        if extended {
            let len = u16::try_from(value.len()).map_err(|_| {
                Error::TooLarge(format!(
                    "path attribute {} of {} bytes",
                    self.type_code(),
                    value.len()
                ))
            })?;
            buf.extend_from_slice(&len.to_be_bytes());
        } else {
            buf.push(value.len() as u8);
        }
        buf.extend_from_slice(&value);
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
    ) -> Result<(&[u8], PathAttribute), ProtocolError> {
        let start = input;
        let bad_length = || {
            ProtocolError::new(
                UpdateErrorSubcode::AttributeLength,
                "path attribute framing",
            )
        };
        let (input, flags) = parse(input, be_u8, bad_length)?;
        let (input, type_code) = parse(input, be_u8, bad_length)?;
        let (input, len) =
            if flags & path_attribute_flags::EXTENDED_LENGTH != 0 {
                parse(input, be_u16, bad_length)?
            } else {
                let (input, len) = parse(input, be_u8, bad_length)?;
                (input, u16::from(len))
            };
        let (rest, value) = parse(input, take(len), bad_length)?;

        // The erroneous attribute travels back in the notification data.
        let consumed = start.len() - rest.len();
        let value = PathAttributeValue::from_wire(type_code, value)
            .map_err(|e| e.with_data(&start[..consumed]))?;
        let flags = flags & !path_attribute_flags::EXTENDED_LENGTH;
        Ok((rest, PathAttribute { flags, value }))
    }
}

/// Decode the path attribute section of an UPDATE.
pub fn decode_list(
    mut input: &[u8],
) -> Result<Vec<PathAttribute>, ProtocolError> {
    let mut result = Vec::new();
    while !input.is_empty() {
        let (rest, pa) = PathAttribute::from_wire(input)?;
        result.push(pa);
        input = rest;
    }
    Ok(result)
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SrgbRange {
    /// First label of the block, 24 bits.
    pub base: u32,
    /// Number of labels in the block, 24 bits.
    pub range: u32,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Srv6Sid {
    pub typ: u8,
    pub sid: Ipv6Addr,
}

/// TLVs carried in the BGP Prefix-SID attribute.
///
/// Ref: RFC 8669 §3
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PrefixSidTlv {
    /// Type 1.
    LabelIndex { flags: u16, label_index: u32 },
    /// Type 2.
    Ipv6Sid { flags: u16 },
    /// Type 3.
    OriginatorSrgb { flags: u16, ranges: Vec<SrgbRange> },
    /// Type 4.
    Srv6VpnSid { sids: Vec<Srv6Sid> },
    Unknown { typ: u8, value: Vec<u8> },
}

const LABEL_INDEX_LEN: usize = 7;
const IPV6_SID_LEN: usize = 3;
const SRGB_RANGE_LEN: usize = 6;
const SRV6_SID_LEN: usize = 17;

fn be_u24(b: &[u8]) -> u32 {
    u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2])
}

impl PrefixSidTlv {
    pub fn typ(&self) -> u8 {
        match self {
            Self::LabelIndex { .. } => 1,
            Self::Ipv6Sid { .. } => 2,
            Self::OriginatorSrgb { .. } => 3,
            Self::Srv6VpnSid { .. } => 4,
            Self::Unknown { typ, .. } => *typ,
        }
    }

    fn value_to_wire(&self) -> Vec<u8> {
        match self {
            Self::LabelIndex { flags, label_index } => {
                let mut buf = vec![0];
                buf.extend_from_slice(&flags.to_be_bytes());
                buf.extend_from_slice(&label_index.to_be_bytes());
                buf
            }
            Self::Ipv6Sid { flags } => {
                let mut buf = vec![0];
                buf.extend_from_slice(&flags.to_be_bytes());
                buf
            }
            Self::OriginatorSrgb { flags, ranges } => {
                let mut buf = flags.to_be_bytes().to_vec();
                for r in ranges {
                    buf.extend_from_slice(&r.base.to_be_bytes()[1..]);
                    buf.extend_from_slice(&r.range.to_be_bytes()[1..]);
                }
                buf
            }
            Self::Srv6VpnSid { sids } => {
                let mut buf = vec![0];
                for s in sids {
                    buf.push(s.typ);
                    buf.extend_from_slice(&s.sid.octets());
                }
                buf
            }
            Self::Unknown { value, .. } => value.clone(),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let value = self.value_to_wire();
        let len = u16::try_from(value.len()).map_err(|_| {
            Error::TooLarge(format!("prefix sid tlv {}", self.typ()))
        })?;
        let mut buf = vec![self.typ()];
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&value);
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
    ) -> Result<(&[u8], PrefixSidTlv), ProtocolError> {
        let bad_length = || {
            ProtocolError::new(
                UpdateErrorSubcode::AttributeLength,
                "prefix sid tlv",
            )
        };
        let (input, typ) = parse(input, be_u8, bad_length)?;
        let (input, len) = parse(input, be_u16, bad_length)?;
        let (rest, v) = parse(input, take(len), bad_length)?;

        let tlv = match typ {
            1 => {
                if v.len() != LABEL_INDEX_LEN {
                    return Err(bad_length());
                }
                let (_, label_index) = parse(&v[3..], be_u32, bad_length)?;
                Self::LabelIndex {
                    flags: u16::from_be_bytes([v[1], v[2]]),
                    label_index,
                }
            }
            2 => {
                if v.len() != IPV6_SID_LEN {
                    return Err(bad_length());
                }
                Self::Ipv6Sid {
                    flags: u16::from_be_bytes([v[1], v[2]]),
                }
            }
            3 => {
                if v.len() < 2 || (v.len() - 2) % SRGB_RANGE_LEN != 0 {
                    return Err(bad_length());
                }
                Self::OriginatorSrgb {
                    flags: u16::from_be_bytes([v[0], v[1]]),
                    ranges: v[2..]
                        .chunks_exact(SRGB_RANGE_LEN)
                        .map(|c| SrgbRange {
                            base: be_u24(&c[..3]),
                            range: be_u24(&c[3..]),
                        })
                        .collect(),
                }
            }
            4 => {
                if v.is_empty() || (v.len() - 1) % SRV6_SID_LEN != 0 {
                    return Err(bad_length());
                }
                let mut sids = Vec::new();
                for c in v[1..].chunks_exact(SRV6_SID_LEN) {
                    let octets: [u8; 16] =
                        c[1..].try_into().map_err(|_| bad_length())?;
                    sids.push(Srv6Sid {
                        typ: c[0],
                        sid: Ipv6Addr::from(octets),
                    });
                }
                Self::Srv6VpnSid { sids }
            }
            _ => Self::Unknown {
                typ,
                value: v.to_vec(),
            },
        };
        Ok((rest, tlv))
    }
}
