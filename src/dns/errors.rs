//! Error types for zone mutation and DNSSEC operations
//!
//! Every public mutation returns one of these kinds; the error always names
//! the zone and the offending operand so callers can surface it verbatim.

use std::error::Error;
use std::fmt;

/// Typed failure of a zone mutation or DNSSEC operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    /// Operation not valid in the zone's current state, or an
    /// apex constraint was violated.
    InvalidOperation { zone: String, detail: String },
    /// Supplied records do not form a valid RRSet (TTL or class
    /// mismatch, duplicate rdata, wrong cardinality).
    InvalidRRSet { zone: String, detail: String },
    /// A parameter is out of its allowed range.
    InvalidParameter { zone: String, detail: String },
    /// The requested signing algorithm is not supported.
    UnsupportedAlgorithm { zone: String, algorithm: String },
    /// The record type cannot exist in a signed zone.
    UnsupportedInSignedZone { zone: String, qtype: String },
    ZoneAlreadySigned { zone: String },
    ZoneNotSigned { zone: String },
    /// No key eligible to sign the RRSet exists.
    NoSigningKey { zone: String, qtype: String },
    /// Key generation could not find a free key tag.
    TagCollision { zone: String },
    KeyNotFound { zone: String, key_tag: u16 },
    /// Retire refused: no safe successor key.
    SuccessorMissing { zone: String, key_tag: u16 },
    /// The DNSKEY being published is already present.
    DuplicateKey { zone: String, key_tag: u16 },
    /// Wire-format or buffer failure while encoding records.
    Protocol { zone: String, detail: String },
    /// Crypto backend failure.
    Crypto { zone: String, detail: String },
}

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneError::InvalidOperation { zone, detail } => {
                write!(f, "invalid operation on zone {}: {}", zone, detail)
            }
            ZoneError::InvalidRRSet { zone, detail } => {
                write!(f, "invalid RRSet for zone {}: {}", zone, detail)
            }
            ZoneError::InvalidParameter { zone, detail } => {
                write!(f, "invalid parameter for zone {}: {}", zone, detail)
            }
            ZoneError::UnsupportedAlgorithm { zone, algorithm } => {
                write!(f, "unsupported algorithm {} for zone {}", algorithm, zone)
            }
            ZoneError::UnsupportedInSignedZone { zone, qtype } => {
                write!(f, "type {} is not supported in signed zone {}", qtype, zone)
            }
            ZoneError::ZoneAlreadySigned { zone } => {
                write!(f, "zone {} is already signed", zone)
            }
            ZoneError::ZoneNotSigned { zone } => write!(f, "zone {} is not signed", zone),
            ZoneError::NoSigningKey { zone, qtype } => {
                write!(f, "no signing key for {} RRSet in zone {}", qtype, zone)
            }
            ZoneError::TagCollision { zone } => {
                write!(f, "could not find a free key tag for zone {}", zone)
            }
            ZoneError::KeyNotFound { zone, key_tag } => {
                write!(f, "no key with tag {} in zone {}", key_tag, zone)
            }
            ZoneError::SuccessorMissing { zone, key_tag } => {
                write!(
                    f,
                    "cannot retire key {} in zone {}: no active successor",
                    key_tag, zone
                )
            }
            ZoneError::DuplicateKey { zone, key_tag } => {
                write!(f, "key {} is already published in zone {}", key_tag, zone)
            }
            ZoneError::Protocol { zone, detail } => {
                write!(f, "wire format error in zone {}: {}", zone, detail)
            }
            ZoneError::Crypto { zone, detail } => {
                write!(f, "crypto failure in zone {}: {}", zone, detail)
            }
        }
    }
}

impl Error for ZoneError {}

/// Result type alias for zone operations
pub type ZoneResult<T> = Result<T, ZoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_zone_and_operand() {
        let err = ZoneError::UnsupportedInSignedZone {
            zone: "example.com".to_string(),
            qtype: "ANAME".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("example.com"));
        assert!(display.contains("ANAME"));

        let err = ZoneError::SuccessorMissing {
            zone: "example.com".to_string(),
            key_tag: 4711,
        };
        assert!(format!("{}", err).contains("4711"));
    }
}
