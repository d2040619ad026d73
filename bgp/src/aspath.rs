// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AS_PATH attribute values. Paths are always carried with 4-octet AS
//! numbers.

use crate::error::{Error, ProtocolError};
use crate::messages::{parse, UpdateErrorSubcode};
use nom::{
    bytes::complete::take,
    multi::count,
    number::complete::{be_u32, be_u8},
};
use num_enum::TryFromPrimitive;
use std::fmt::{self, Display, Formatter};

/// A segment holds at most this many AS numbers.
pub const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum AsPathType {
    AsSet = 1,
    AsSequence = 2,
    ConfedSequence = 3,
    ConfedSet = 4,
}

impl AsPathType {
    fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            Self::AsSequence => ("", ""),
            Self::AsSet => ("{", "}"),
            Self::ConfedSequence => ("(", ")"),
            Self::ConfedSet => ("[", "]"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AsPathSegment {
    pub typ: AsPathType,
    pub value: Vec<u32>,
}

impl AsPathSegment {
    pub fn new(typ: AsPathType) -> Self {
        Self {
            typ,
            value: Vec::new(),
        }
    }

    /// Contribution of this segment to the path length used in best path
    /// comparison. Sets count as their size, sequences as one hop.
    pub fn path_length(&self) -> usize {
        match self.typ {
            AsPathType::AsSet | AsPathType::ConfedSet => self.value.len(),
            AsPathType::AsSequence | AsPathType::ConfedSequence => 1,
        }
    }

    fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let len = u8::try_from(self.value.len()).map_err(|_| {
            Error::TooLarge(format!(
                "as path segment of {} entries",
                self.value.len()
            ))
        })?;
        let mut buf = vec![self.typ as u8, len];
        for asn in &self.value {
            buf.extend_from_slice(&asn.to_be_bytes());
        }
        Ok(buf)
    }

    fn from_wire(input: &[u8]) -> Result<(&[u8], Self), ProtocolError> {
        let malformed = || {
            ProtocolError::new(
                UpdateErrorSubcode::MalformedAsPath,
                "as path segment",
            )
        };
        let (input, typ) = parse(input, be_u8, malformed)?;
        let typ = AsPathType::try_from(typ).map_err(|_| {
            ProtocolError::new(
                UpdateErrorSubcode::MalformedAsPath,
                format!("as path segment type {typ}"),
            )
        })?;
        let (input, len) = parse(input, be_u8, malformed)?;
        let (input, body) =
            parse(input, take(usize::from(len) * 4), malformed)?;
        let (_, value) =
            parse(body, count(be_u32, usize::from(len)), malformed)?;
        Ok((input, Self { typ, value }))
    }
}

impl Display for AsPathSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (head, tail) = self.typ.delimiters();
        let values: Vec<String> =
            self.value.iter().map(|a| a.to_string()).collect();
        write!(f, "{head}{}{tail}", values.join(" "))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct AsPath {
    pub segments: Vec<AsPathSegment>,
}

impl AsPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an AS number to the last segment. An empty path starts with an
    /// AS_SEQUENCE. A full segment is followed by a new one of the same type.
    pub fn append(&mut self, asn: u32) {
        match self.segments.last_mut() {
            Some(seg) if seg.value.len() < MAX_SEGMENT_LEN => {
                seg.value.push(asn)
            }
            last => {
                let typ = last.map_or(AsPathType::AsSequence, |s| s.typ);
                self.segments.push(AsPathSegment {
                    typ,
                    value: vec![asn],
                });
            }
        }
    }

    /// Put the segments of `other` in front of this path.
    pub fn prepend(&mut self, other: &AsPath) {
        let mut segments = other.segments.clone();
        segments.append(&mut self.segments);
        self.segments = segments;
    }

    /// Replace every occurrence of `from` with `to`.
    pub fn replace(&mut self, from: u32, to: u32) {
        self.segments
            .iter_mut()
            .flat_map(|s| s.value.iter_mut())
            .filter(|a| **a == from)
            .for_each(|a| *a = to);
    }

    pub fn path_length(&self) -> usize {
        self.segments.iter().map(AsPathSegment::path_length).sum()
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for s in &self.segments {
            buf.extend_from_slice(&s.to_wire()?);
        }
        Ok(buf)
    }

    pub fn from_wire(mut input: &[u8]) -> Result<Self, ProtocolError> {
        let mut segments = Vec::new();
        while !input.is_empty() {
            let (rest, seg) = AsPathSegment::from_wire(input)?;
            segments.push(seg);
            input = rest;
        }
        Ok(Self { segments })
    }
}

impl Display for AsPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let segs: Vec<String> =
            self.segments.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", segs.join(" "))
    }
}

enum Token {
    Number(u32),
    Open(AsPathType),
    Close,
}

/// Pull the next token off `s`. Spaces and commas separate tokens.
fn next_token(s: &str) -> Result<Option<(Token, &str)>, Error> {
    let s = s.trim_start_matches([' ', ',']);
    let Some(c) = s.chars().next() else {
        return Ok(None);
    };
    let tok = match c {
        '{' => Token::Open(AsPathType::AsSet),
        '(' => Token::Open(AsPathType::ConfedSequence),
        '[' => Token::Open(AsPathType::ConfedSet),
        '}' | ')' | ']' => Token::Close,
        d if d.is_ascii_digit() => {
            let end = s
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(s.len());
            let asn = s[..end].parse().map_err(|e| {
                Error::Parse(format!("as number {}: {e}", &s[..end]))
            })?;
            return Ok(Some((Token::Number(asn), &s[end..])));
        }
        other => {
            return Err(Error::Parse(format!("as path: unexpected '{other}'")))
        }
    };
    Ok(Some((tok, &s[1..])))
}

impl std::str::FromStr for AsPath {
    type Err = Error;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        let mut path = AsPath::new();
        let mut typ = AsPathType::AsSequence;
        let mut need_segment = true;

        while let Some((tok, rest)) = next_token(s)? {
            s = rest;
            match tok {
                Token::Number(asn) => {
                    if need_segment {
                        path.segments.push(AsPathSegment::new(typ));
                        need_segment = false;
                    }
                    path.append(asn);
                }
                Token::Open(t) => {
                    typ = t;
                    path.segments.push(AsPathSegment::new(t));
                    need_segment = false;
                }
                Token::Close => {
                    typ = AsPathType::AsSequence;
                    need_segment = true;
                }
            }
        }
        Ok(path)
    }
}
