//! Core value types shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

/// Term identifier as supplied by the term catalogue
pub type TermId = String;

/// Content-dimension identifier as supplied by the dimension catalogue
pub type DimensionId = String;

/// Picodollars per US dollar
const PICO_PER_USD: f64 = 1_000_000_000_000.0;

/// Coarse classification of a content dimension, driving model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 3] = [
        ComplexityTier::Simple,
        ComplexityTier::Moderate,
        ComplexityTier::Complex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-point money amount in picodollars.
///
/// Integer arithmetic keeps ledger sums exact no matter how many workers
/// record concurrently or in which order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub const fn from_picodollars(pico: u64) -> Self {
        Cost(pico)
    }

    /// Convert a dollar amount, rounding to the nearest picodollar.
    /// Negative and non-finite inputs clamp to zero.
    pub fn from_usd(usd: f64) -> Self {
        if !usd.is_finite() || usd <= 0.0 {
            return Cost::ZERO;
        }
        Cost((usd * PICO_PER_USD).round() as u64)
    }

    pub const fn picodollars(self) -> u64 {
        self.0
    }

    pub fn as_usd(self) -> f64 {
        self.0 as f64 / PICO_PER_USD
    }

    pub fn times(self, units: u64) -> Cost {
        Cost(self.0.saturating_mul(units))
    }

    pub fn saturating_sub(self, other: Cost) -> Cost {
        Cost(self.0.saturating_sub(other.0))
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.6}", self.as_usd())
    }
}

/// A glossary term with display metadata from the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub display_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Term {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            metadata: BTreeMap::new(),
        }
    }
}

/// Identity of one cell in the term x dimension matrix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub term_id: TermId,
    pub dimension_id: DimensionId,
}

impl TaskKey {
    const STORAGE_SEPARATOR: char = '\u{1f}';

    pub fn new(term_id: impl Into<String>, dimension_id: impl Into<String>) -> Self {
        Self {
            term_id: term_id.into(),
            dimension_id: dimension_id.into(),
        }
    }

    /// Key bytes used by the checkpoint store. The unit separator cannot
    /// appear in catalogue identifiers, so the encoding is unambiguous.
    pub fn storage_key(&self) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.term_id,
            Self::STORAGE_SEPARATOR,
            self.dimension_id
        )
        .into_bytes()
    }

    pub fn from_storage_key(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let (term, dimension) = text.split_once(Self::STORAGE_SEPARATOR)?;
        Some(Self::new(term, dimension))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.term_id, self.dimension_id)
    }
}

/// One unit of generation work. Immutable once derived from the catalogues.
#[derive(Debug, Clone)]
pub struct Task {
    pub term: Arc<Term>,
    pub dimension_id: DimensionId,
    pub complexity: ComplexityTier,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.term.id.clone(), self.dimension_id.clone())
    }
}
