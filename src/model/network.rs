//! Reported network blocks.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Confidence, LogicalAddress};

/// A CIDR block some source claims exists, at some confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Network {
    pub address: LogicalAddress,
    pub confidence: Confidence,
}

impl Network {
    pub fn new(address: LogicalAddress, confidence: Confidence) -> Self {
        Self { address, confidence }
    }

    pub fn contains(&self, other: &Network) -> bool {
        self.address.contains(&other.address)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.address, self.confidence)
    }
}
