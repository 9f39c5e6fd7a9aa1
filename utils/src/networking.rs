use faster_hex::{hex_decode, hex_string};
use std::{
    fmt::{Display, Write},
    net::Ipv4Addr,
    str::FromStr,
};
use thiserror::Error;

/// Number of leading octets grouped together for IPv4 addresses (/24).
pub const V4_PREFIX_LEN: usize = 3;

/// Number of leading octets grouped together for IPv6 addresses (/48).
pub const V6_PREFIX_LEN: usize = 6;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("no address given")]
    Empty,

    #[error("invalid IPv4 address '{0}'")]
    InvalidV4(String),

    #[error("invalid IPv6 address '{0}'")]
    InvalidV6(String),

    #[error("address '{0}' carries a port")]
    PortQualified(String),

    #[error("unbalanced brackets in address '{0}'")]
    UnbalancedBrackets(String),

    #[error("more than one '::' in address '{0}'")]
    MultipleElisions(String),

    #[error("hextet longer than four digits in address '{0}'")]
    OversizedHextet(String),

    #[error("address '{0}' does not expand to exactly eight hextets")]
    WrongHextetCount(String),

    #[error("invalid canonical hex form '{0}'")]
    InvalidHex(String),
}

pub type AddressResult<T> = Result<T, AddressError>;

/// A bucket based on an address' leading bytes.
/// for ipv4 it consists of the first three octets,
/// for ipv6 it consists of the first six octets.
///
/// Two addresses are in the same neighborhood iff their prefix keys are equal.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, PartialOrd, Ord)]
pub enum PrefixKey {
    V4([u8; V4_PREFIX_LEN]),
    V6([u8; V6_PREFIX_LEN]),
}

impl PrefixKey {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PrefixKey::V4(bytes) => bytes,
            PrefixKey::V6(bytes) => bytes,
        }
    }

    /// Six hex digits for IPv4, twelve for IPv6.
    pub fn to_hex(&self) -> String {
        hex_string(self.as_bytes())
    }
}

impl From<&CanonicalAddress> for PrefixKey {
    fn from(address: &CanonicalAddress) -> Self {
        match address {
            CanonicalAddress::V4(octets) => {
                let mut prefix = [0u8; V4_PREFIX_LEN];
                prefix.copy_from_slice(&octets[..V4_PREFIX_LEN]);
                Self::V4(prefix)
            }
            CanonicalAddress::V6(octets) => {
                let mut prefix = [0u8; V6_PREFIX_LEN];
                prefix.copy_from_slice(&octets[..V6_PREFIX_LEN]);
                Self::V6(prefix)
            }
        }
    }
}

impl Display for PrefixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An IPv4 or IPv6 address in its fixed-width binary form.
///
/// Ordering is by family first (IPv4 before IPv6), then by bytes, which is
/// also the ordering of the full hex strings within a family.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, PartialOrd, Ord)]
pub enum CanonicalAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl CanonicalAddress {
    pub fn octets(&self) -> &[u8] {
        match self {
            CanonicalAddress::V4(octets) => octets,
            CanonicalAddress::V6(octets) => octets,
        }
    }

    /// Full hex form: 8 digits for IPv4, 32 digits for IPv6, lower case.
    pub fn to_hex(&self) -> String {
        hex_string(self.octets())
    }

    /// Inverse of [`CanonicalAddress::to_hex`].
    pub fn from_hex(hex: &str) -> AddressResult<Self> {
        let invalid = || AddressError::InvalidHex(hex.to_string());
        match hex.len() {
            8 => {
                let mut octets = [0u8; 4];
                hex_decode(hex.as_bytes(), &mut octets).map_err(|_| invalid())?;
                Ok(Self::V4(octets))
            }
            32 => {
                let mut octets = [0u8; 16];
                hex_decode(hex.as_bytes(), &mut octets).map_err(|_| invalid())?;
                Ok(Self::V6(octets))
            }
            _ => Err(invalid()),
        }
    }

    pub fn prefix_key(&self) -> PrefixKey {
        PrefixKey::from(self)
    }

    /// Display form with IPv6 addresses wrapped in brackets.
    pub fn bracketed(&self) -> String {
        match self {
            CanonicalAddress::V4(_) => self.to_string(),
            CanonicalAddress::V6(_) => format!("[{}]", self),
        }
    }
}

/// Parses user or descriptor supplied address text.
///
/// Returns `Ok(None)` when the input is empty or only whitespace, so callers
/// can tell a missing address apart from a malformed one.
pub fn parse_address(text: &str) -> AddressResult<Option<CanonicalAddress>> {
    match text.parse::<CanonicalAddress>() {
        Ok(address) => Ok(Some(address)),
        Err(AddressError::Empty) => Ok(None),
        Err(err) => Err(err),
    }
}

impl FromStr for CanonicalAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }
        if text.contains(':') || text.starts_with('[') || text.ends_with(']') {
            parse_v6(text)
        } else {
            parse_v4(text)
        }
    }
}

fn parse_v4(text: &str) -> AddressResult<CanonicalAddress> {
    let invalid = || AddressError::InvalidV4(text.to_string());
    let mut parts = text.split('.');
    let mut octets = [0u8; 4];
    for octet in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // Leading zeros are accepted and normalized away.
        *octet = part.parse::<u8>().map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(CanonicalAddress::V4(octets))
}

fn parse_v6(text: &str) -> AddressResult<CanonicalAddress> {
    let inner = match (text.strip_prefix('['), text.ends_with(']')) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        (None, false) => text,
        (Some(rest), false) if rest.contains("]:") => return Err(AddressError::PortQualified(text.to_string())),
        _ => return Err(AddressError::UnbalancedBrackets(text.to_string())),
    };
    if inner.contains('[') || inner.contains(']') {
        return Err(AddressError::UnbalancedBrackets(text.to_string()));
    }
    if looks_port_qualified(inner) {
        return Err(AddressError::PortQualified(text.to_string()));
    }
    if !inner.bytes().all(|b| b == b':' || b.is_ascii_hexdigit()) {
        return Err(AddressError::InvalidV6(text.to_string()));
    }
    if inner.contains(":::") {
        return Err(AddressError::MultipleElisions(text.to_string()));
    }

    let mut halves = inner.split("::");
    let head = parse_hextets(halves.next().unwrap_or_default(), text)?;
    let tail = halves.next().map(|tail| parse_hextets(tail, text)).transpose()?;
    if halves.next().is_some() {
        return Err(AddressError::MultipleElisions(text.to_string()));
    }

    let hextets = match tail {
        None if head.len() == 8 => head,
        // The elision has to stand for at least one zero hextet.
        Some(tail) if head.len() + tail.len() < 8 => {
            let mut hextets = head;
            hextets.resize(8 - tail.len(), 0);
            hextets.extend(tail);
            hextets
        }
        _ => return Err(AddressError::WrongHextetCount(text.to_string())),
    };

    let mut octets = [0u8; 16];
    for (chunk, hextet) in octets.chunks_exact_mut(2).zip(hextets) {
        chunk.copy_from_slice(&hextet.to_be_bytes());
    }
    Ok(CanonicalAddress::V6(octets))
}

fn looks_port_qualified(inner: &str) -> bool {
    match inner.rsplit_once(':') {
        Some((host, port)) => {
            !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && parse_v4(host).is_ok()
        }
        None => false,
    }
}

fn parse_hextets(piece: &str, text: &str) -> AddressResult<Vec<u16>> {
    if piece.is_empty() {
        return Ok(Vec::new());
    }
    piece
        .split(':')
        .map(|part| {
            if part.is_empty() {
                Err(AddressError::InvalidV6(text.to_string()))
            } else if part.len() > 4 {
                Err(AddressError::OversizedHextet(text.to_string()))
            } else {
                u16::from_str_radix(part, 16).map_err(|_| AddressError::InvalidV6(text.to_string()))
            }
        })
        .collect()
}

/// RFC 5952 text form, never using the dotted-quad suffix so the output
/// always parses back to the same value.
fn write_v6(f: &mut std::fmt::Formatter<'_>, octets: &[u8; 16]) -> std::fmt::Result {
    let mut hextets = [0u16; 8];
    for (hextet, chunk) in hextets.iter_mut().zip(octets.chunks_exact(2)) {
        *hextet = u16::from_be_bytes([chunk[0], chunk[1]]);
    }

    // Longest run of at least two zero hextets, leftmost on ties.
    let (mut best_start, mut best_len) = (0, 0);
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, hextet) in hextets.iter().enumerate() {
        if *hextet == 0 {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len > best_len {
                best_start = run_start;
                best_len = run_len;
            }
        } else {
            run_len = 0;
        }
    }

    let mut out = String::with_capacity(39);
    if best_len < 2 {
        for (i, hextet) in hextets.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            write!(out, "{:x}", hextet)?;
        }
    } else {
        let join = |groups: &[u16]| groups.iter().map(|g| format!("{:x}", g)).collect::<Vec<_>>().join(":");
        out.push_str(&join(&hextets[..best_start]));
        out.push_str("::");
        out.push_str(&join(&hextets[best_start + best_len..]));
    }
    f.write_str(&out)
}

impl Display for CanonicalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanonicalAddress::V4(octets) => Ipv4Addr::from(*octets).fmt(f),
            CanonicalAddress::V6(octets) => write_v6(f, octets),
        }
    }
}
