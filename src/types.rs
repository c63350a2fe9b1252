//! Witness type for confidence values bounded to [0.0, 1.0].
//!
//! Confidence in this pipeline is produced by several sources that are not
//! directly comparable: the ruler's graduated schedule reflects pattern
//! specificity, the language model's self-report is an opinion, and the
//! embedding scores are cosine similarities. The fusion rules (rerank blends
//! 50/50, the branch judge 70/30) are the only places where scores from
//! different sources are combined, and `Confidence::blend` is the single
//! implementation of that arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A confidence score guaranteed to be in the range [0.0, 1.0].
///
/// `#[repr(transparent)]` over `f64`, so there is no runtime overhead and
/// serde serializes it as a bare number.
#[derive(Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    /// The minimum valid confidence value.
    pub const MIN: Self = Self(0.0);

    /// The maximum valid confidence value.
    pub const MAX: Self = Self(1.0);

    /// Create a confidence score, returning `None` if out of range.
    #[must_use]
    #[inline]
    pub fn new(value: f64) -> Option<Self> {
        if (0.0..=1.0).contains(&value) && !value.is_nan() {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Create a confidence score, clamping to [0.0, 1.0].
    /// NaN is treated as 0.0.
    #[must_use]
    #[inline]
    pub fn saturating(value: f64) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    /// Get the inner value (guaranteed to be in [0.0, 1.0]).
    #[must_use]
    #[inline]
    pub const fn get(self) -> f64 {
        self.0
    }

    /// Weighted blend of two scores: `weight_self * self + (1 - weight_self) * other`.
    ///
    /// This is the fusion primitive used by the contextual reranker
    /// (`weight_self = 0.5`) and the branch judge (`weight_self = 0.7`).
    #[must_use]
    #[inline]
    pub fn blend(self, other: Self, weight_self: f64) -> Self {
        let w = weight_self.clamp(0.0, 1.0);
        Self::saturating(self.0 * w + other.0 * (1.0 - w))
    }

    /// Scale by a factor, saturating at the bounds.
    #[must_use]
    #[inline]
    pub fn scale(self, factor: f64) -> Self {
        Self::saturating(self.0 * factor)
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Debug for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Confidence({:.4})", self.0)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl From<Confidence> for f64 {
    #[inline]
    fn from(conf: Confidence) -> Self {
        conf.0
    }
}

impl PartialEq<f64> for Confidence {
    fn eq(&self, other: &f64) -> bool {
        (self.0 - other).abs() < f64::EPSILON
    }
}

impl PartialOrd<f64> for Confidence {
    fn partial_cmp(&self, other: &f64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn saturating_always_bounded(v in -10.0f64..10.0) {
            let c = Confidence::saturating(v);
            prop_assert!(c.get() >= 0.0);
            prop_assert!(c.get() <= 1.0);
        }

        #[test]
        fn blend_stays_bounded(a in 0.0f64..1.0, b in 0.0f64..1.0, w in 0.0f64..1.0) {
            let blended = Confidence::saturating(a).blend(Confidence::saturating(b), w);
            prop_assert!(blended.get() >= 0.0);
            prop_assert!(blended.get() <= 1.0);
        }
    }
}
