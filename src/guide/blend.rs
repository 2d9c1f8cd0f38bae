use std::fmt;

use nalgebra::DVector;
use tracing::warn;

use crate::guide::mechanism::VirtualMechanism;

/// Sharpness of the distance kernel `exp(-POTENTIAL_GAIN * d)`.
pub const POTENTIAL_GAIN: f64 = 10.0;

/// Policy deriving blend weights from likelihood and distance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbMode {
    /// Likelihoods normalized over all mechanisms.
    Hard,
    /// Raw distance kernel; weights are not normalized and need not sum to one.
    #[default]
    Potential,
    /// Normalized likelihood times a freshly evaluated distance kernel.
    Soft,
}

impl ProbMode {
    /// Unrecognized names fall back to [`ProbMode::Potential`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "hard" => Self::Hard,
            "potential" => Self::Potential,
            "soft" => Self::Soft,
            other => {
                warn!(prob_mode = other, "unknown probability mode, using potential");
                Self::Potential
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Potential => "potential",
            Self::Soft => "soft",
        }
    }

    /// Whether weights are divided by the sum of raw scores.
    pub fn normalizes(self) -> bool {
        !matches!(self, Self::Potential)
    }

    /// First pass: raw score of one mechanism after its update.
    pub fn raw_score(self, vm: &dyn VirtualMechanism, position: &DVector<f64>) -> f64 {
        match self {
            Self::Hard | Self::Soft => vm.probability(position),
            Self::Potential => potential(vm.distance(position)),
        }
    }

    /// Second pass: final weight from the raw score and the sum over all raw scores.
    ///
    /// `Soft` re-evaluates the distance kernel here instead of reusing anything from the first pass.
    pub fn resolve(
        self,
        raw: f64,
        sum: f64,
        vm: &dyn VirtualMechanism,
        position: &DVector<f64>,
    ) -> f64 {
        match self {
            Self::Hard => raw / sum,
            Self::Potential => raw,
            Self::Soft => potential(vm.distance(position)) * raw / sum,
        }
    }

    /// A normalizing mode cannot divide by a zero or non-finite sum.
    pub fn is_degenerate(self, sum: f64) -> bool {
        self.normalizes() && !(sum.is_finite() && sum > 0.0)
    }
}

impl fmt::Display for ProbMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn potential(distance: f64) -> f64 {
    (-POTENTIAL_GAIN * distance).exp()
}
