//! Endpoint identifiers
//!
//! Aphelion addresses nodes with the `ipn:` scheme: a `(node, service)` pair
//! rendered textually as `ipn:<node>.<service>`. Node numbers identify an
//! agent; service numbers identify a channel within it. Service 0 is the
//! administrative wildcard: a channel bound to service 0 accepts deliveries
//! for any service on its node.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest well-formed textual EID: `ipn:0.0`.
const MIN_TEXT_LEN: usize = 7;

/// Errors raised while parsing a textual endpoint ID
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EidError {
    /// Input does not start with the `ipn:` scheme
    #[error("Unsupported EID scheme in {0:?} (only ipn: is handled)")]
    UnsupportedScheme(String),

    /// Input is too short to hold `ipn:<node>.<service>`
    #[error("EID {0:?} is too short")]
    TooShort(String),

    /// Missing or empty node/service segment
    #[error("EID {0:?} is missing a node or service number")]
    MissingSegment(String),

    /// A segment is not a decimal number in `[0, 2^32)`
    #[error("EID segment {0:?} is not a valid number")]
    BadNumber(String),
}

/// An `ipn:` endpoint identifier
///
/// `EndpointId` is `Copy` and ordered so it can key ordered indices directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EndpointId {
    /// Node number of the agent
    pub node: u32,
    /// Service number within the node (0 = any service)
    pub service: u32,
}

impl EndpointId {
    /// Create an endpoint ID from node and service numbers
    pub fn new(node: u32, service: u32) -> Self {
        Self { node, service }
    }

    /// The null endpoint, used as the custodian of never-custodied bundles
    pub fn null() -> Self {
        Self {
            node: 0,
            service: 0,
        }
    }

    /// Whether this is the null endpoint
    pub fn is_null(&self) -> bool {
        self.node == 0 && self.service == 0
    }

    /// Whether this endpoint accepts deliveries for any service on its node
    pub fn is_service_wildcard(&self) -> bool {
        self.service == 0
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

/// Parse one decimal segment, rejecting signs, whitespace and overflow.
fn parse_segment(text: &str, seg: &str) -> Result<u32, EidError> {
    if seg.is_empty() {
        return Err(EidError::MissingSegment(text.to_string()));
    }
    if !seg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EidError::BadNumber(seg.to_string()));
    }
    seg.parse::<u32>()
        .map_err(|_| EidError::BadNumber(seg.to_string()))
}

impl FromStr for EndpointId {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < MIN_TEXT_LEN {
            return Err(EidError::TooShort(s.to_string()));
        }
        let rest = s
            .strip_prefix("ipn:")
            .ok_or_else(|| EidError::UnsupportedScheme(s.to_string()))?;
        let (node, service) = rest
            .split_once('.')
            .ok_or_else(|| EidError::MissingSegment(s.to_string()))?;

        Ok(Self {
            node: parse_segment(s, node)?,
            service: parse_segment(s, service)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        let eid = EndpointId::new(42, 7);
        assert_eq!(eid.to_string(), "ipn:42.7");
        assert_eq!(eid.to_string().parse::<EndpointId>().unwrap(), eid);
    }

    #[test]
    fn test_roundtrip_extremes() {
        for (node, service) in [(1, 1), (u32::MAX, 1), (1, u32::MAX), (u32::MAX, u32::MAX)] {
            let eid = EndpointId::new(node, service);
            assert_eq!(eid.to_string().parse::<EndpointId>().unwrap(), eid);
        }
    }

    #[test]
    fn test_roundtrip_random() {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..100 {
            let eid = EndpointId::new(rng.random(), rng.random());
            assert_eq!(eid.to_string().parse::<EndpointId>().unwrap(), eid);
        }
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        assert!(matches!(
            "dtn:42.7000".parse::<EndpointId>(),
            Err(EidError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_rejects_short_input() {
        assert!(matches!(
            "ipn:1.".parse::<EndpointId>(),
            Err(EidError::TooShort(_))
        ));
        assert!(matches!(
            "".parse::<EndpointId>(),
            Err(EidError::TooShort(_))
        ));
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!(matches!(
            "ipn:.1234567".parse::<EndpointId>(),
            Err(EidError::MissingSegment(_))
        ));
        assert!(matches!(
            "ipn:1234567.".parse::<EndpointId>(),
            Err(EidError::MissingSegment(_))
        ));
        assert!(matches!(
            "ipn:1234567".parse::<EndpointId>(),
            Err(EidError::MissingSegment(_))
        ));
    }

    #[test]
    fn test_rejects_bad_numbers() {
        assert!(matches!(
            "ipn:+1.2000".parse::<EndpointId>(),
            Err(EidError::BadNumber(_))
        ));
        assert!(matches!(
            "ipn:1.4294967296".parse::<EndpointId>(),
            Err(EidError::BadNumber(_))
        ));
        assert!(matches!(
            "ipn:a.b1234".parse::<EndpointId>(),
            Err(EidError::BadNumber(_))
        ));
    }

    #[test]
    fn test_wildcard_service() {
        assert!(EndpointId::new(5, 0).is_service_wildcard());
        assert!(!EndpointId::new(5, 1).is_service_wildcard());
    }
}
