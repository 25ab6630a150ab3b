//! Strength-of-evidence tag attached to every asserted property value.
//!
//! The ordering is fixed: a **lower ordinal is a better confidence**.
//! `Confidence::Asserted` (0) beats everything, `Confidence::Unobserved` (5)
//! loses to everything. `Ord` follows the ordinal, so "better" means
//! "compares less", and `min()` over a set of confidences picks the winner.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Confidence {
    /// Entered or confirmed by the user.
    Asserted = 0,
    /// Reported by a source and corroborated by at least one other.
    Reported = 1,
    /// Reported by a single source about some other entity.
    Inferred = 2,
    /// Claimed by the entity about itself.
    SelfReported = 3,
    /// Directly observed, but trivially spoofed.
    Observed = 4,
    /// Derived without direct observation (lookups, heuristics).
    Unobserved = 5,
}

impl Confidence {
    pub const ALL: [Confidence; 6] = [
        Confidence::Asserted,
        Confidence::Reported,
        Confidence::Inferred,
        Confidence::SelfReported,
        Confidence::Observed,
        Confidence::Unobserved,
    ];

    /// Numeric ordinal; 0 is the best confidence.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// `Less` when `a` wins over `b`.
    pub fn compare(a: Confidence, b: Confidence) -> Ordering {
        a.cmp(&b)
    }

    /// True when `self` is strictly higher-priority than `other`.
    pub fn outranks(self, other: Confidence) -> bool {
        self < other
    }

    pub fn name(self) -> &'static str {
        match self {
            Confidence::Asserted => "ASSERTED",
            Confidence::Reported => "REPORTED",
            Confidence::Inferred => "INFERRED",
            Confidence::SelfReported => "SELF_REPORTED",
            Confidence::Observed => "OBSERVED",
            Confidence::Unobserved => "UNOBSERVED",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.ordinal())
    }
}

impl FromStr for Confidence {
    type Err = Error;

    /// Accepts either the name (`REPORTED`) or the ordinal (`1`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(ordinal) = s.parse::<u8>() {
            return Self::from_ordinal(ordinal)
                .ok_or_else(|| Error::InvalidArgument(format!("confidence ordinal out of range: {ordinal}")));
        }
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown confidence: {s}")))
    }
}
