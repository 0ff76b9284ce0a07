//! Promo code normalization.
//!
//! Every string that reaches an index, whether read from a source file or passed in by a
//! caller, goes through the same [`Normalizer`], so a code seen at ingestion and a code
//! queried later compare equal exactly when they normalize to the same [`Code`].

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

/// Shortest accepted code, in bytes.
pub const DEFAULT_MIN_LEN: usize = 8;
/// Longest accepted code, in bytes.
pub const DEFAULT_MAX_LEN: usize = 10;

/// A normalized promo code.
///
/// Can only be obtained from [`Normalizer::normalize`], so holding a `Code` means the string
/// is trimmed, upper-cased and within the configured length bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct Code(Box<str>);

impl Code {
    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Code {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Code {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Inclusive length bounds for a normalized code, measured in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthBounds {
    /// Minimum length, inclusive.
    pub min: usize,
    /// Maximum length, inclusive.
    pub max: usize,
}

impl LengthBounds {
    /// Whether `len` lies within the bounds.
    pub fn contains(&self, len: usize) -> bool {
        self.min <= len && len <= self.max
    }
}

impl Default for LengthBounds {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_LEN,
            max: DEFAULT_MAX_LEN,
        }
    }
}

/// Canonicalizes raw strings into [`Code`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Normalizer {
    bounds: LengthBounds,
}

impl Normalizer {
    /// Create a normalizer accepting codes within `bounds`.
    pub fn new(bounds: LengthBounds) -> Self {
        Self { bounds }
    }

    /// The length bounds applied after trimming and upper-casing.
    pub fn bounds(&self) -> LengthBounds {
        self.bounds
    }

    /// Trim, upper-case and bounds-check `raw`.
    ///
    /// Returns `None` when the result is outside the length bounds; such a string can never
    /// be a valid code.
    pub fn normalize(&self, raw: &str) -> Option<Code> {
        let trimmed = raw.trim();
        let code = if trimmed.bytes().any(|b| b.is_ascii_lowercase()) || !trimmed.is_ascii() {
            // to_uppercase never produces leading or trailing whitespace
            trimmed.to_uppercase()
        } else {
            trimmed.to_owned()
        };
        if !self.bounds.contains(code.len()) {
            return None;
        }
        Some(Code(code.into_boxed_str()))
    }
}
