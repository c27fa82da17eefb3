//! Wire format of catalog log entries: `"<name>::<log address>"`.
//!
//! The format is delimiter based, so names containing the delimiter cannot be represented.

use std::{fmt, str::FromStr};

use snafu::{ResultExt, Snafu};

use crate::ids::{LogAddress, ParseError};

/// Separates the article name from the log address.
pub const DELIMITER: &str = "::";

/// Error decoding a [`CatalogEntry`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EntryError {
    #[snafu(display("entry is not valid UTF-8"))]
    Utf8 { source: std::str::Utf8Error },
    #[snafu(display("entry has no `{DELIMITER}` delimiter"))]
    MissingDelimiter {},
    #[snafu(display("invalid log address"))]
    Address { source: ParseError },
}

/// One entry of the catalog log, mapping an article name to its log address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// The article name.
    pub name: String,
    /// Address of the article log.
    pub address: LogAddress,
}

impl CatalogEntry {
    /// Creates an entry.
    pub fn new(name: impl Into<String>, address: LogAddress) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    /// Encodes the entry as a log payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decodes a log payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntryError> {
        std::str::from_utf8(bytes).context(Utf8Snafu)?.parse()
    }
}

impl fmt::Display for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}", self.name, self.address)
    }
}

impl FromStr for CatalogEntry {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, address) = s
            .split_once(DELIMITER)
            .ok_or(EntryError::MissingDelimiter {})?;
        let address = address.parse().context(AddressSnafu)?;
        Ok(Self::new(name, address))
    }
}
