// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::attributes::{self, PathAttribute, PathAttributeValue};
use crate::capability::{Capability, OptionalParameter};
use crate::error::{Error, ProtocolError};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u8},
};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};

pub const MAX_MESSAGE_SIZE: usize = 4096;

pub(crate) type NomError<'a> = (&'a [u8], nom::error::ErrorKind);
pub(crate) type ParseResult<'a, O> = nom::IResult<&'a [u8], O, NomError<'a>>;

/// Run a nom parser, mapping any failure onto the protocol error produced by
/// `err`. Keeps the parsers themselves free of NOTIFICATION bookkeeping.
pub(crate) fn parse<'a, O, P>(
    input: &'a [u8],
    mut parser: P,
    err: impl FnOnce() -> ProtocolError,
) -> Result<(&'a [u8], O), ProtocolError>
where
    P: FnMut(&'a [u8]) -> ParseResult<'a, O>,
{
    parser(input).map_err(|_| err())
}

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,

    /// RFC 2918
    RouteRefresh = 5,

    /// Dynamic capability message. Accepted, body ignored.
    Capability = 6,

    /// Pre-standard route refresh, decoded like [`MessageType::RouteRefresh`].
    RouteRefreshOld = 128,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> Self {
        match m {
            Message::Open(_) => Self::Open,
            Message::Update(_) => Self::Update,
            Message::Notification(_) => Self::Notification,
            Message::KeepAlive => Self::KeepAlive,
            Message::RouteRefresh(_) => Self::RouteRefresh,
            Message::Capability => Self::Capability,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
    Capability,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        self.into()
    }

    /// Serialize the message body. Length fields inside the body are
    /// recomputed from the encoded content.
    pub fn body_to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(m) => m.to_wire(),
            Self::Notification(m) => Ok(m.to_wire()),
            Self::KeepAlive | Self::Capability => Ok(Vec::new()),
            Self::RouteRefresh(m) => Ok(m.to_wire()),
        }
    }

    /// Serialize the full message, header included.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let body = self.body_to_wire()?;
        let total = Header::WIRE_SIZE + body.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge(format!(
                "{:?} message of {total} bytes",
                self.kind()
            )));
        }
        let header = Header {
            length: total as u16,
            typ: self.kind(),
        };
        let mut buf = header.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a complete message from a buffer that starts with the header.
    pub fn from_wire(input: &[u8]) -> Result<Message, ProtocolError> {
        let header = Header::from_wire(input)?;
        let length = usize::from(header.length);
        if input.len() < length {
            return Err(bad_message_length(header.length));
        }
        decode_body(&header, &input[Header::WIRE_SIZE..length])
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<UpdateMessage> for Message {
    fn from(m: UpdateMessage) -> Message {
        Message::Update(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}

impl From<RouteRefreshMessage> for Message {
    fn from(m: RouteRefreshMessage) -> Message {
        Message::RouteRefresh(m)
    }
}

fn bad_message_length(length: u16) -> ProtocolError {
    ProtocolError::new(
        HeaderErrorSubcode::BadMessageLength,
        format!("bad message length {length}"),
    )
    .with_data(length.to_be_bytes())
}

/// Minimum body sizes, header excluded.
const OPEN_MIN_BODY: usize = 10;
const UPDATE_MIN_BODY: usize = 4;
const NOTIFICATION_MIN_BODY: usize = 2;
const ROUTE_REFRESH_BODY: usize = 4;

/// Decode a message body whose header has already been validated. `body`
/// holds exactly `header.length - 19` bytes.
pub fn decode_body(
    header: &Header,
    body: &[u8],
) -> Result<Message, ProtocolError> {
    let min = match header.typ {
        MessageType::Open => OPEN_MIN_BODY,
        MessageType::Update => UPDATE_MIN_BODY,
        MessageType::Notification => NOTIFICATION_MIN_BODY,
        _ => 0,
    };
    if body.len() < min {
        return Err(bad_message_length(header.length));
    }

    Ok(match header.typ {
        MessageType::Open => OpenMessage::from_wire(body)?.into(),
        MessageType::Update => UpdateMessage::from_wire(body)?.into(),
        MessageType::Notification => {
            NotificationMessage::from_wire(body)?.into()
        }
        MessageType::KeepAlive => Message::KeepAlive,
        MessageType::RouteRefresh | MessageType::RouteRefreshOld => {
            RouteRefreshMessage::from_wire(body)?.into()
        }
        MessageType::Capability => Message::Capability,
    })
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The marker is generated by [`Header::to_wire`] and checked and consumed by
/// [`Header::from_wire`].
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    /// Total length of the message, including the header.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

/// According to RFC 4271 §4.1 the header marker is all ones.
const MARKER: [u8; 16] = [0xFFu8; 16];

impl Header {
    pub const WIRE_SIZE: usize = 19;

    /// Number of body bytes that follow this header on the wire.
    pub fn body_length(&self) -> usize {
        usize::from(self.length).saturating_sub(Self::WIRE_SIZE)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Decode and validate a header. Checks run in order: buffer size,
    /// marker, declared length bounds, keepalive length, type.
    pub fn from_wire(input: &[u8]) -> Result<Header, ProtocolError> {
        if input.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::new(
                HeaderErrorSubcode::BadMessageLength,
                format!("short header: {} bytes", input.len()),
            ));
        }
        let (input, marker) = parse(input, take(16usize), || {
            ProtocolError::new(HeaderErrorSubcode::BadMessageLength, "marker")
        })?;
        if marker != MARKER {
            return Err(ProtocolError::new(
                HeaderErrorSubcode::ConnectionNotSynchronized,
                "marker is not all ones",
            ));
        }

        let (input, length) = parse(input, be_u16, || {
            ProtocolError::new(HeaderErrorSubcode::BadMessageLength, "length")
        })?;
        let size = usize::from(length);
        if !(Self::WIRE_SIZE..=MAX_MESSAGE_SIZE).contains(&size) {
            return Err(bad_message_length(length));
        }

        let (_, typ) = parse(input, be_u8, || {
            ProtocolError::new(HeaderErrorSubcode::BadMessageLength, "type")
        })?;
        let typ = MessageType::try_from(typ).map_err(|_| {
            ProtocolError::new(
                HeaderErrorSubcode::BadMessageType,
                format!("unknown message type {typ}"),
            )
            .with_data([typ])
        })?;

        if typ == MessageType::KeepAlive && size != Self::WIRE_SIZE {
            return Err(bad_message_length(length));
        }

        Ok(Header { length, typ })
    }
}

/// The autonomous system number used in OPEN messages when 4-byte ASNs are in
/// use.
///
/// Ref: RFC 6793 §9
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4
pub const BGP4: u8 = 4;

/// The first message sent by each side once a TCP connection is established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |     Optional Parameters       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. Values that do not fit in two
    /// bytes go out on the wire as [`AS_TRANS`].
    pub asn: u32,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender.
    pub id: Ipv4Addr,

    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    pub fn new(
        asn: u32,
        hold_time: u16,
        id: Ipv4Addr,
        capabilities: Vec<Capability>,
    ) -> OpenMessage {
        let parameters = if capabilities.is_empty() {
            Vec::new()
        } else {
            vec![OptionalParameter::Capabilities(capabilities)]
        };
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            parameters,
        }
    }

    /// All capabilities carried by the message, across every capability
    /// parameter.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.parameters
            .iter()
            .filter_map(|p| match p {
                OptionalParameter::Capabilities(cs) => Some(cs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The sender's AS, taking the 4-octet AS capability into account.
    pub fn peer_asn(&self) -> u32 {
        self.capabilities()
            .iter()
            .find_map(|c| match c {
                Capability::FourOctetAs { asn } => Some(*asn),
                _ => None,
            })
            .unwrap_or(self.asn)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let asn = u16::try_from(self.asn).unwrap_or(AS_TRANS);
        let mut buf = vec![self.version];
        buf.extend_from_slice(&asn.to_be_bytes());
        buf.extend_from_slice(&self.hold_time.to_be_bytes());
        buf.extend_from_slice(&self.id.octets());

        let mut pbuf = Vec::new();
        for p in &self.parameters {
            pbuf.extend_from_slice(&p.to_wire()?);
        }
        let plen = u8::try_from(pbuf.len()).map_err(|_| {
            Error::TooLarge("open: optional parameters".into())
        })?;
        buf.push(plen);
        buf.extend_from_slice(&pbuf);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<OpenMessage, ProtocolError> {
        let short = || {
            ProtocolError::new(HeaderErrorSubcode::BadMessageLength, "open")
        };
        let (input, version) = parse(input, be_u8, short)?;
        let (input, asn) = parse(input, be_u16, short)?;
        let (input, hold_time) = parse(input, be_u16, short)?;
        let (input, id) = parse(input, take(4usize), short)?;
        let (input, opt_len) = parse(input, be_u8, short)?;

        if hold_time == 1 || hold_time == 2 {
            return Err(ProtocolError::new(
                OpenErrorSubcode::UnacceptableHoldTime,
                format!("hold time {hold_time}"),
            ));
        }

        if input.len() != usize::from(opt_len) {
            return Err(ProtocolError::new(
                HeaderErrorSubcode::BadMessageLength,
                format!(
                    "optional parameter length {opt_len} with {} bytes left",
                    input.len()
                ),
            ));
        }
        let mut params = input;
        let mut parameters = Vec::new();
        while !params.is_empty() {
            let (rest, p) = OptionalParameter::from_wire(params)?;
            parameters.push(p);
            params = rest;
        }

        Ok(OpenMessage {
            version,
            asn: u32::from(asn),
            hold_time,
            id: Ipv4Addr::new(id[0], id[1], id[2], id[3]),
            parameters,
        })
    }
}

/// An update message is used to advertise feasible routes that share common
/// path attributes to a peer, or to withdraw multiple unfeasible routes from
/// service.
///
/// ```text
/// +-----------------------------------------------------+
/// |   Withdrawn Routes Length (2 octets)                |
/// +-----------------------------------------------------+
/// |   Withdrawn Routes (variable)                       |
/// +-----------------------------------------------------+
/// |   Total Path Attribute Length (2 octets)            |
/// +-----------------------------------------------------+
/// |   Path Attributes (variable)                        |
/// +-----------------------------------------------------+
/// |   Network Layer Reachability Information (variable) |
/// +-----------------------------------------------------+
/// ```
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // withdrawn
        let mut withdrawn = Vec::new();
        for w in &self.withdrawn {
            withdrawn.extend_from_slice(&w.to_wire()?);
        }
        let len = u16::try_from(withdrawn.len()).map_err(|_| {
            Error::TooLarge("update: too many withdrawn prefixes".into())
        })?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&withdrawn);

        // path attributes
        let mut attrs = Vec::new();
        for a in &self.path_attributes {
            attrs.extend_from_slice(&a.to_wire()?);
        }
        let len = u16::try_from(attrs.len()).map_err(|_| {
            Error::TooLarge("update: too many path attributes".into())
        })?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&attrs);

        // nlri
        for n in &self.nlri {
            buf.extend_from_slice(&n.to_wire()?);
        }

        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<UpdateMessage, ProtocolError> {
        let malformed = || {
            ProtocolError::new(
                UpdateErrorSubcode::MalformedAttributeList,
                "update section length",
            )
        };

        let (input, len) = parse(input, be_u16, malformed)?;
        let (input, withdrawn_input) = parse(input, take(len), malformed)?;
        let withdrawn = Prefix::list_from_wire(withdrawn_input)?;

        let (input, len) = parse(input, be_u16, malformed)?;
        let (input, attrs_input) = parse(input, take(len), malformed)?;
        let path_attributes = attributes::decode_list(attrs_input)?;

        let nlri = Prefix::list_from_wire(input)?;

        Ok(UpdateMessage {
            withdrawn,
            path_attributes,
            nlri,
        })
    }

    fn find<T>(
        &self,
        f: impl Fn(&PathAttributeValue) -> Option<T>,
    ) -> Option<T> {
        self.path_attributes.iter().find_map(|a| f(&a.value))
    }

    pub fn next_hop(&self) -> Option<IpAddr> {
        self.find(|v| match v {
            PathAttributeValue::NextHop(nh) => Some(*nh),
            _ => None,
        })
    }

    pub fn communities(&self) -> Vec<u32> {
        self.find(|v| match v {
            PathAttributeValue::Communities(cs) => Some(cs.0.clone()),
            _ => None,
        })
        .unwrap_or_default()
    }
}

/// A network prefix as laid out in a BGP message: a prefix length followed
/// by just enough bytes to express the prefix.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Prefix {
    pub length: u8,
    pub value: Vec<u8>,
}

impl Prefix {
    pub fn new(addr: Ipv4Addr, length: u8) -> Prefix {
        let n = usize::from(length.min(32)).div_ceil(8);
        Prefix {
            length,
            value: addr.octets()[..n].to_vec(),
        }
    }

    fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let n = usize::from(self.length).div_ceil(8);
        if self.value.len() < n {
            return Err(Error::TooLarge(format!(
                "prefix length {} with {} value bytes",
                self.length,
                self.value.len()
            )));
        }
        let mut buf = vec![self.length];
        buf.extend_from_slice(&self.value[..n]);
        Ok(buf)
    }

    fn from_wire(input: &[u8]) -> Result<(&[u8], Prefix), ProtocolError> {
        let invalid = || {
            ProtocolError::new(UpdateErrorSubcode::InvalidNetworkField, "nlri")
        };
        let (input, length) = parse(input, be_u8, invalid)?;
        if length > 32 {
            return Err(ProtocolError::new(
                UpdateErrorSubcode::InvalidNetworkField,
                format!("prefix length {length}"),
            ));
        }
        let (input, value) =
            parse(input, take(usize::from(length).div_ceil(8)), invalid)?;
        Ok((
            input,
            Prefix {
                length,
                value: value.to_vec(),
            },
        ))
    }

    fn list_from_wire(mut buf: &[u8]) -> Result<Vec<Prefix>, ProtocolError> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (rest, pfx) = Prefix::from_wire(buf)?;
            result.push(pfx);
            buf = rest;
        }
        Ok(result)
    }

    pub fn addr(&self) -> Ipv4Addr {
        let mut octets = [0u8; 4];
        for (o, v) in octets.iter_mut().zip(&self.value) {
            *o = *v;
        }
        Ipv4Addr::from(octets)
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.length)
    }
}

impl std::str::FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::Parse(format!("prefix {s}: missing '/'")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| Error::Parse(format!("prefix {s}: {e}")))?;
        let length: u8 = len
            .parse()
            .map_err(|e| Error::Parse(format!("prefix {s}: {e}")))?;
        if length > 32 {
            return Err(Error::Parse(format!("prefix {s}: length > 32")));
        }
        Ok(Prefix::new(addr, length))
    }
}

/// Sent when an error condition is detected. The connection is closed
/// immediately after.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: ErrorSubcode,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf =
            vec![u8::from(self.error_code), self.error_subcode.as_u8()];
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Codes and subcodes outside the known tables are kept as raw values.
    pub fn from_wire(
        input: &[u8],
    ) -> Result<NotificationMessage, ProtocolError> {
        let short = || {
            ProtocolError::new(
                HeaderErrorSubcode::BadMessageLength,
                "notification",
            )
        };
        let (input, code) = parse(input, be_u8, short)?;
        let (input, subcode) = parse(input, be_u8, short)?;
        let error_code = ErrorCode::from(code);
        Ok(NotificationMessage {
            error_code,
            error_subcode: ErrorSubcode::from_raw(error_code, subcode),
            data: input.to_vec(),
        })
    }
}

impl Display for NotificationMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_subcode)?;
        if !self.data.is_empty() {
            write!(f, " data={:02x?}", self.data)?;
        }
        Ok(())
    }
}

/// Ask the peer to re-advertise its Adj-RIB-Out for one address family.
///
/// Ref: RFC 2918 §3
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub demarcation: u8,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = self.afi.to_be_bytes().to_vec();
        buf.push(self.demarcation);
        buf.push(self.safi);
        buf
    }

    pub fn from_wire(
        input: &[u8],
    ) -> Result<RouteRefreshMessage, ProtocolError> {
        if input.len() < ROUTE_REFRESH_BODY {
            return Err(ProtocolError::new(
                RouteRefreshErrorSubcode::InvalidMessageLength,
                format!("route refresh body of {} bytes", input.len()),
            ));
        }
        Ok(RouteRefreshMessage {
            afi: u16::from_be_bytes([input[0], input[1]]),
            demarcation: input[2],
            safi: input[3],
        })
    }
}

/// NOTIFICATION error codes.
///
/// Ref: RFC 4271 §4.5, RFC 7313 §5
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
    RouteRefresh = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => write!(f, "message header error"),
            Self::Open => write!(f, "open message error"),
            Self::Update => write!(f, "update message error"),
            Self::HoldTimerExpired => write!(f, "hold timer expired"),
            Self::Fsm => write!(f, "fsm error"),
            Self::Cease => write!(f, "cease"),
            Self::RouteRefresh => write!(f, "route refresh message error"),
            Self::Unknown(c) => write!(f, "unknown error code {c}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSubcode {
    Header(HeaderErrorSubcode),
    Open(OpenErrorSubcode),
    Update(UpdateErrorSubcode),
    HoldTime(u8),
    Fsm(FsmErrorSubcode),
    Cease(CeaseErrorSubcode),
    RouteRefresh(RouteRefreshErrorSubcode),
    /// A subcode not in the table for its code, as received from a peer.
    Raw { code: ErrorCode, subcode: u8 },
}

impl From<HeaderErrorSubcode> for ErrorSubcode {
    fn from(x: HeaderErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Header(x)
    }
}

impl From<OpenErrorSubcode> for ErrorSubcode {
    fn from(x: OpenErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Open(x)
    }
}

impl From<UpdateErrorSubcode> for ErrorSubcode {
    fn from(x: UpdateErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Update(x)
    }
}

impl From<FsmErrorSubcode> for ErrorSubcode {
    fn from(x: FsmErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Fsm(x)
    }
}

impl From<CeaseErrorSubcode> for ErrorSubcode {
    fn from(x: CeaseErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Cease(x)
    }
}

impl From<RouteRefreshErrorSubcode> for ErrorSubcode {
    fn from(x: RouteRefreshErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::RouteRefresh(x)
    }
}

impl ErrorSubcode {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Header(_) => ErrorCode::Header,
            Self::Open(_) => ErrorCode::Open,
            Self::Update(_) => ErrorCode::Update,
            Self::HoldTime(_) => ErrorCode::HoldTimerExpired,
            Self::Fsm(_) => ErrorCode::Fsm,
            Self::Cease(_) => ErrorCode::Cease,
            Self::RouteRefresh(_) => ErrorCode::RouteRefresh,
            Self::Raw { code, .. } => *code,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Header(x) => *x as u8,
            Self::Open(x) => *x as u8,
            Self::Update(x) => *x as u8,
            Self::HoldTime(x) => *x,
            Self::Fsm(x) => *x as u8,
            Self::Cease(x) => *x as u8,
            Self::RouteRefresh(x) => *x as u8,
            Self::Raw { subcode, .. } => *subcode,
        }
    }

    fn from_raw(code: ErrorCode, subcode: u8) -> ErrorSubcode {
        let typed = match code {
            ErrorCode::Header => {
                HeaderErrorSubcode::try_from(subcode).ok().map(Self::from)
            }
            ErrorCode::Open => {
                OpenErrorSubcode::try_from(subcode).ok().map(Self::from)
            }
            ErrorCode::Update => {
                UpdateErrorSubcode::try_from(subcode).ok().map(Self::from)
            }
            ErrorCode::HoldTimerExpired => Some(Self::HoldTime(subcode)),
            ErrorCode::Fsm => {
                FsmErrorSubcode::try_from(subcode).ok().map(Self::from)
            }
            ErrorCode::Cease => {
                CeaseErrorSubcode::try_from(subcode).ok().map(Self::from)
            }
            ErrorCode::RouteRefresh => RouteRefreshErrorSubcode::try_from(
                subcode,
            )
            .ok()
            .map(Self::from),
            ErrorCode::Unknown(_) => None,
        };
        typed.unwrap_or(Self::Raw { code, subcode })
    }
}

impl Display for ErrorSubcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let code = self.code();
        match self {
            Self::Header(x) => write!(f, "{code}: {x:?}"),
            Self::Open(x) => write!(f, "{code}: {x:?}"),
            Self::Update(x) => write!(f, "{code}: {x:?}"),
            Self::Fsm(x) => write!(f, "{code}: {x:?}"),
            Self::Cease(x) => write!(f, "{code}: {x:?}"),
            Self::RouteRefresh(x) => write!(f, "{code}: {x:?}"),
            Self::HoldTime(x) | Self::Raw { subcode: x, .. } => {
                write!(f, "{code}: subcode {x}")
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    Unspecific = 0,
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    Unspecific = 0,
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    Deprecated = 5,
    UnacceptableHoldTime = 6,
    UnsupportedCapability = 7,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    Unspecific = 0,
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlags = 4,
    AttributeLength = 5,
    InvalidOriginAttribute = 6,
    Deprecated = 7,
    InvalidNexthopAttribute = 8,
    OptionalAttribute = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum FsmErrorSubcode {
    Unspecified = 0,
    UnexpectedMessageInOpenSent = 1,
    UnexpectedMessageInOpenConfirm = 2,
    UnexpectedMessageInEstablished = 3,
}

/// Ref: RFC 4486, RFC 8538
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum CeaseErrorSubcode {
    Unspecific = 0,
    MaximumNumberofPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
    HardReset = 9,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum RouteRefreshErrorSubcode {
    Reserved = 0,
    InvalidMessageLength = 1,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::PathOrigin;
    use crate::capability::{Afi, Safi};
    use crate::community::Communities;
    use pretty_assertions::assert_eq;
    use pretty_hex::*;

    fn header_bytes(length: u16, typ: u8) -> Vec<u8> {
        let mut buf = vec![0xff; 16];
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(typ);
        buf
    }

    #[test]
    fn header_to_wire() {
        let h = Header {
            length: 0x0017,
            typ: MessageType::Notification,
        };

        let buf = h.to_wire();
        println!("buf: {}", buf.hex_dump());

        assert_eq!(
            buf,
            vec![
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // marker
                0x00, 0x17, // length
                3,    // type
            ]
        );
        assert_eq!(Header::from_wire(&buf).expect("header from wire"), h);
    }

    #[test]
    fn header_length_over_maximum() {
        let err = Header::from_wire(&header_bytes(0x1701, 3))
            .expect_err("length 5889");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());
    }

    #[test]
    fn header_marker_desync() {
        for i in 0..16 {
            let mut buf = header_bytes(19, 4);
            buf[i] = 0xfe;
            let err = Header::from_wire(&buf).expect_err("desync");
            assert_eq!(
                err.subcode,
                HeaderErrorSubcode::ConnectionNotSynchronized.into()
            );
        }
    }

    #[test]
    fn header_length_bounds() {
        let err = Header::from_wire(&[0xff; 10]).expect_err("short");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());

        let err = Header::from_wire(&header_bytes(18, 1)).expect_err("small");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());
        assert_eq!(err.data, vec![0, 18]);

        let err =
            Header::from_wire(&header_bytes(4097, 2)).expect_err("large");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());

        let h = Header::from_wire(&header_bytes(4096, 2)).expect("max");
        assert_eq!(h.body_length(), 4096 - 19);
    }

    #[test]
    fn header_unknown_type() {
        let err = Header::from_wire(&header_bytes(23, 9)).expect_err("type");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageType.into());
        assert_eq!(err.data, vec![9]);
        assert_eq!(err.code(), ErrorCode::Header);
    }

    #[test]
    fn keepalive_length() {
        let err = Header::from_wire(&header_bytes(20, 4)).expect_err("ka");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());

        let buf = header_bytes(19, 4);
        let msg = Message::from_wire(&buf).expect("keepalive");
        assert_eq!(msg, Message::KeepAlive);
        assert_eq!(Message::KeepAlive.to_wire().expect("to wire"), buf);
    }

    #[test]
    fn legacy_route_refresh() {
        let mut buf = header_bytes(23, 128);
        buf.extend_from_slice(&[0, 1, 0, 1]);
        let msg = Message::from_wire(&buf).expect("route refresh");
        assert_eq!(
            msg,
            Message::RouteRefresh(RouteRefreshMessage {
                afi: Afi::Ip as u16,
                demarcation: 0,
                safi: Safi::Unicast as u8,
            })
        );

        let mut buf = header_bytes(22, 5);
        buf.extend_from_slice(&[0, 1, 0]);
        let err = Message::from_wire(&buf).expect_err("short refresh");
        assert_eq!(
            err.subcode,
            RouteRefreshErrorSubcode::InvalidMessageLength.into()
        );
    }

    #[test]
    fn short_bodies() {
        // OPEN needs 10 body bytes, UPDATE 4, NOTIFICATION 2.
        for (typ, len) in [(1u8, 9usize), (2, 3), (3, 1)] {
            let mut buf = header_bytes((19 + len) as u16, typ);
            buf.extend(std::iter::repeat(0).take(len));
            let err = Message::from_wire(&buf).expect_err("short body");
            assert_eq!(
                err.subcode,
                HeaderErrorSubcode::BadMessageLength.into()
            );
        }
    }

    #[test]
    fn open_round_trip() {
        let om0 = OpenMessage::new(
            64512,
            90,
            Ipv4Addr::new(10, 0, 0, 1),
            vec![
                Capability::MultiProtocol {
                    afi: Afi::Ip as u16,
                    safi: Safi::Unicast as u8,
                },
                Capability::FourOctetAs { asn: 64512 },
            ],
        );

        let buf = Message::from(om0.clone()).to_wire().expect("to wire");
        println!("buf: {}", buf.hex_dump());

        let msg = Message::from_wire(&buf).expect("from wire");
        assert_eq!(msg, Message::Open(om0));
    }

    #[test]
    fn open_as_trans() {
        let om = OpenMessage::new(
            395849,
            0,
            Ipv4Addr::new(1, 2, 3, 4),
            vec![Capability::FourOctetAs { asn: 395849 }],
        );
        let buf = om.to_wire().expect("to wire");
        assert_eq!(&buf[1..3], &AS_TRANS.to_be_bytes());

        let decoded = OpenMessage::from_wire(&buf).expect("from wire");
        assert_eq!(decoded.asn, u32::from(AS_TRANS));
        assert_eq!(decoded.peer_asn(), 395849);
    }

    #[test]
    fn open_hold_time() {
        for (hold, ok) in [(0u16, true), (1, false), (2, false), (3, true)] {
            let om = OpenMessage::new(100, hold, Ipv4Addr::LOCALHOST, vec![]);
            let buf = om.to_wire().expect("to wire");
            match OpenMessage::from_wire(&buf) {
                Ok(m) => {
                    assert!(ok, "hold time {hold} accepted");
                    assert_eq!(m.hold_time, hold);
                }
                Err(e) => {
                    assert!(!ok, "hold time {hold} rejected");
                    assert_eq!(
                        e.subcode,
                        OpenErrorSubcode::UnacceptableHoldTime.into()
                    );
                }
            }
        }
    }

    #[test]
    fn open_optional_parameter_overrun() {
        let om = OpenMessage::new(100, 90, Ipv4Addr::LOCALHOST, vec![]);
        let mut buf = om.to_wire().expect("to wire");
        // claim 6 bytes of parameters, supply 2
        buf[9] = 6;
        buf.extend_from_slice(&[2, 4]);
        let err = OpenMessage::from_wire(&buf).expect_err("overrun");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());
    }

    #[test]
    fn open_bytes_after_parameters() {
        let om = OpenMessage::new(100, 90, Ipv4Addr::LOCALHOST, vec![]);
        let mut buf = om.to_wire().expect("to wire");
        buf.extend_from_slice(&[0, 0]);
        let err = OpenMessage::from_wire(&buf).expect_err("trailing bytes");
        assert_eq!(err.subcode, HeaderErrorSubcode::BadMessageLength.into());
    }

    #[test]
    fn open_unknown_parameter() {
        let om = OpenMessage::new(100, 90, Ipv4Addr::LOCALHOST, vec![]);
        let mut buf = om.to_wire().expect("to wire");
        buf[9] = 4;
        buf.extend_from_slice(&[9, 2, 0xaa, 0xbb]);
        let decoded = OpenMessage::from_wire(&buf).expect("from wire");
        assert_eq!(
            decoded.parameters,
            vec![OptionalParameter::Unknown {
                code: 9,
                value: vec![0xaa, 0xbb]
            }]
        );
    }

    #[test]
    fn update_round_trip() {
        let um0 = UpdateMessage {
            withdrawn: vec!["10.1.0.0/16".parse().expect("prefix")],
            path_attributes: vec![
                PathAttributeValue::Origin(PathOrigin::Igp).into(),
                PathAttributeValue::NextHop(IpAddr::V4(Ipv4Addr::new(
                    192, 0, 2, 1,
                )))
                .into(),
                PathAttributeValue::Communities(Communities(vec![
                    0xffffff01, 0x00640001,
                ]))
                .into(),
            ],
            nlri: vec![
                "198.51.100.0/24".parse().expect("prefix"),
                "0.0.0.0/0".parse().expect("prefix"),
            ],
        };

        let buf = Message::from(um0.clone()).to_wire().expect("to wire");
        println!("buf: {}", buf.hex_dump());

        let msg = Message::from_wire(&buf).expect("from wire");
        assert_eq!(msg, Message::Update(um0.clone()));
        assert_eq!(
            um0.next_hop(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(um0.communities(), vec![0xffffff01, 0x00640001]);
    }

    #[test]
    fn update_section_overrun() {
        // withdrawn length 8 with only 2 bytes following
        let err = UpdateMessage::from_wire(&[0, 8, 0, 0]).expect_err("wd");
        assert_eq!(
            err.subcode,
            UpdateErrorSubcode::MalformedAttributeList.into()
        );

        // nlri prefix claims 24 bits but carries one byte
        let err =
            UpdateMessage::from_wire(&[0, 0, 0, 0, 24, 10]).expect_err("nlri");
        assert_eq!(err.subcode, UpdateErrorSubcode::InvalidNetworkField.into());
    }

    #[test]
    fn update_extended_length_attribute() {
        let um = UpdateMessage {
            path_attributes: vec![PathAttributeValue::Communities(
                Communities((0..64).collect()),
            )
            .into()],
            ..Default::default()
        };
        let buf = um.to_wire().expect("to wire");
        println!("buf: {}", buf.hex_dump());
        // withdrawn length, attribute length, then flags, type and a two
        // byte length of 256
        assert_eq!(&buf[2..4], &[1, 4]);
        assert_eq!(buf[4], 0xd0);
        assert_eq!(&buf[6..8], &[1, 0]);

        let msg = Message::from(um);
        let decoded = Message::from_wire(&msg.to_wire().expect("to wire"))
            .expect("from wire");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn short_attribute_in_extended_form() {
        // communities 1 and 2 sent with a two byte length
        let buf = [
            0, 0, 0, 12, 0xd0, 8, 0, 8, 0, 0, 0, 1, 0, 0, 0, 2,
        ];
        let um = UpdateMessage::from_wire(&buf).expect("from wire");
        let attr = &um.path_attributes[0];
        assert_eq!(attr.flags, 0xc0);
        assert_eq!(
            attr.value,
            PathAttributeValue::Communities(Communities(vec![1, 2]))
        );
        // re-encoded with a one byte length
        assert_eq!(&um.to_wire().expect("to wire")[2..7], &[0, 11, 0xc0, 8, 8]);
    }

    #[test]
    fn message_too_large() {
        let um = UpdateMessage {
            nlri: (0..1100)
                .map(|i: u32| Prefix::new(Ipv4Addr::from(i << 8), 24))
                .collect(),
            ..Default::default()
        };
        assert!(matches!(
            Message::from(um).to_wire(),
            Err(Error::TooLarge(_))
        ));
    }

    #[test]
    fn notification_raw_subcode() {
        let nm = NotificationMessage {
            error_code: ErrorCode::Cease,
            error_subcode: CeaseErrorSubcode::AdministrativeReset.into(),
            data: vec![1, 2],
        };
        let buf = Message::from(nm.clone()).to_wire().expect("to wire");
        assert_eq!(&buf[19..], &[6, 4, 1, 2]);
        assert_eq!(
            Message::from_wire(&buf).expect("from wire"),
            Message::Notification(nm)
        );

        let decoded =
            NotificationMessage::from_wire(&[3, 99]).expect("raw subcode");
        assert_eq!(
            decoded.error_subcode,
            ErrorSubcode::Raw {
                code: ErrorCode::Update,
                subcode: 99
            }
        );
        let decoded =
            NotificationMessage::from_wire(&[42, 1]).expect("raw code");
        assert_eq!(decoded.error_code, ErrorCode::Unknown(42));
        assert_eq!(decoded.to_wire(), vec![42, 1]);
    }
}
