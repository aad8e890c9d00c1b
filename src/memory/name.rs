//! Segment name encoding.
//!
//! Every segment this crate creates is named `{prefix}_{pid}_{token}`. The
//! pid is the creating process, the token a random UUID. Names that do not
//! decode into all three fields belong to somebody else and are never
//! touched by cleanup code.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default namespace prefix for segments created by this crate.
pub const DEFAULT_PREFIX: &str = "TP";

const SEPARATOR: char = '_';

/// Structured form of a shared memory segment name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentName {
    prefix: String,
    pid: u32,
    token: String,
}

impl SegmentName {
    /// Build a fresh name for `pid` with a random token.
    pub fn generate(prefix: &str, pid: u32) -> Result<Self> {
        validate_prefix(prefix)?;
        Ok(Self {
            prefix: prefix.to_string(),
            pid,
            token: Uuid::new_v4().hyphenated().to_string(),
        })
    }

    /// Build a fresh name for the current process.
    pub fn for_current_process(prefix: &str) -> Result<Self> {
        Self::generate(prefix, std::process::id())
    }

    /// Assemble a name from its parts.
    pub fn from_parts(prefix: &str, pid: u32, token: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        if token.is_empty() || token.contains(SEPARATOR) {
            return Err(Error::InvalidSegment(format!("invalid name token {token:?}")));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            pid,
            token: token.to_string(),
        })
    }

    /// Decode `name`, returning `None` unless it carries exactly the given
    /// prefix, a numeric pid and a token.
    pub fn parse_with_prefix(name: &str, prefix: &str) -> Option<Self> {
        name.parse::<Self>().ok().filter(|n| n.prefix == prefix)
    }

    /// Namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Pid of the process that created the segment.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Uniqueness token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}{SEPARATOR}{}", self.prefix, self.pid, self.token)
    }
}

impl FromStr for SegmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidSegment(format!("{s:?} is not a structured segment name"));

        let mut parts = s.split(SEPARATOR);
        let (Some(prefix), Some(pid), Some(token), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if prefix.is_empty() || token.is_empty() {
            return Err(invalid());
        }
        // Canonical decimal only, so encoding a decoded name gives back `s`.
        let field = pid;
        let pid = field.parse::<u32>().map_err(|_| invalid())?;
        if pid.to_string() != field {
            return Err(invalid());
        }

        Ok(Self {
            prefix: prefix.to_string(),
            pid,
            token: token.to_string(),
        })
    }
}

pub(crate) fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.contains(SEPARATOR) || prefix.contains('/') {
        return Err(Error::Config(format!(
            "segment prefix {prefix:?} must be non-empty and contain no '_' or '/'"
        )));
    }
    Ok(())
}
