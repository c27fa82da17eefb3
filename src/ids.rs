//! Identifiers shared by the log, discovery and catalog layers.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// Prefix of every [`LogAddress`] in its display form.
const ADDRESS_PREFIX: &str = "/astrawiki/";

/// Error when parsing one of the identifiers of this module.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("invalid encoding"))]
    Encoding { source: data_encoding::DecodeError },
    #[snafu(display("invalid length: expected {expected} bytes, got {actual}"))]
    Length { expected: usize, actual: usize },
    #[snafu(display("log address must start with `{ADDRESS_PREFIX}`"))]
    MissingPrefix {},
}

fn encode_base32(bytes: &[u8]) -> String {
    data_encoding::BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

fn decode_base32<const N: usize>(s: &str) -> Result<[u8; N], ParseError> {
    let bytes = data_encoding::BASE32_NOPAD_NOCASE
        .decode(s.as_bytes())
        .map_err(|source| ParseError::Encoding { source })?;
    ensure!(
        bytes.len() == N,
        LengthSnafu {
            expected: N,
            actual: bytes.len()
        }
    );
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Identity of a node on the network.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Creates a peer id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a random peer id.
    pub fn random<R: rand::RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Format a short representation, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode_base32(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_base32(s).map(Self)
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Ok(Self(data))
        }
    }
}

/// Address of a replicated log.
///
/// Addresses are derived from the log name, so every node opening the same name ends up with
/// the same address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogAddress([u8; 32]);

impl LogAddress {
    /// The address of the log called `name`.
    pub fn for_name(name: &str) -> Self {
        Self(*blake3::hash(name.as_bytes()).as_bytes())
    }

    /// The raw digest of this address.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Format a short representation, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ADDRESS_PREFIX}{}", encode_base32(&self.0))
    }
}

impl fmt::Debug for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogAddress({})", self.fmt_short())
    }
}

impl FromStr for LogAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(ParseError::MissingPrefix {})?;
        decode_base32(encoded).map(Self)
    }
}

/// Key under which providers of a log advertise themselves on the discovery mechanism.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// The raw digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Format a short representation, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl From<&LogAddress> for ContentId {
    fn from(address: &LogAddress) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ADDRESS_PREFIX.as_bytes());
        hasher.update(address.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode_base32(&self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.fmt_short())
    }
}
