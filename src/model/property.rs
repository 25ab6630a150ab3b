//! A (value, confidence) assertion with a reference count.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::{Confidence, Value};

/// Immutable (value, confidence) pair.
///
/// Identity is value + confidence only. The reference count counts how
/// many contribution paths currently back this exact pair inside one
/// winning set; it is bookkeeping and never takes part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    value: Value,
    confidence: Confidence,
    #[serde(skip, default = "one")]
    references: u32,
}

fn one() -> u32 {
    1
}

impl Property {
    pub fn new(value: impl Into<Value>, confidence: Confidence) -> Self {
        Self { value: value.into(), confidence, references: 1 }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn add_reference(&mut self) {
        self.references += 1;
    }

    /// Drops one reference and returns how many remain.
    ///
    /// # Panics
    /// When no reference is left to drop.
    pub fn remove_reference(&mut self) -> u32 {
        assert!(
            self.references > 0,
            "reference count of {self} dropped below zero"
        );
        self.references -= 1;
        self.references
    }

    pub(crate) fn with_references(mut self, references: u32) -> Self {
        self.references = references;
        self
    }

    pub(crate) fn set_references(&mut self, references: u32) {
        self.references = references;
    }
}

impl PartialEq for Property {
    fn eq(&self, other: &Self) -> bool {
        self.confidence == other.confidence && self.value == other.value
    }
}

impl Eq for Property {}

impl Hash for Property {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
        self.confidence.hash(state);
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.value, self.confidence)
    }
}
