//! Socket protocol version and the handshake compatibility rule.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// `major.minor` version exchanged in the `connect` handshake.
///
/// Consumers of a different major version are rejected. Minor bumps only
/// add message variants or optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// 2.0 replaced per-session pushes with sequenced deltas.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 2, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Checks a peer's version against ours.
    pub fn check(&self, peer: &ProtocolVersion) -> Result<(), VersionError> {
        if self.major == peer.major {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                ours: *self,
                theirs: *peer,
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version format: {0}")]
    InvalidFormat(String),

    #[error("incompatible protocol version {theirs} (daemon speaks {ours})")]
    Incompatible {
        ours: ProtocolVersion,
        theirs: ProtocolVersion,
    },
}
