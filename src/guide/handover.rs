use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoverState {
    Manual,
    PreAuto,
    Auto,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct HandoverThresholds {
    /// Convergence band around the guide's reference speed for `PreAuto -> Auto`.
    #[serde(default = "HandoverThresholds::default_phase_dot_th")]
    pub phase_dot_th: f64,
    /// Operator speed that signals intent to hand over (`Manual -> PreAuto`).
    #[serde(default = "HandoverThresholds::default_phase_dot_preauto_th")]
    pub phase_dot_preauto_th: f64,
}

impl HandoverThresholds {
    fn default_phase_dot_th() -> f64 {
        0.05
    }
    fn default_phase_dot_preauto_th() -> f64 {
        0.2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = self.phase_dot_th.is_finite()
            && self.phase_dot_preauto_th.is_finite()
            && self.phase_dot_th > 0.0
            && self.phase_dot_preauto_th > self.phase_dot_th;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::Thresholds {
                preauto: self.phase_dot_preauto_th,
                threshold: self.phase_dot_th,
            })
        }
    }
}

impl Default for HandoverThresholds {
    fn default() -> Self {
        Self {
            phase_dot_th: Self::default_phase_dot_th(),
            phase_dot_preauto_th: Self::default_phase_dot_preauto_th(),
        }
    }
}

/// Hysteresis machine deciding when authority passes from the operator to a guide.
///
/// `Manual -> PreAuto` once the operator moves fast enough, `PreAuto -> Auto` once the operator's
/// speed settles near the guide's reference, `Auto -> Manual` on collision. Everything else is sticky.
#[derive(Clone, Debug)]
pub struct HandoverAutomaton {
    state: HandoverState,
    thresholds: HandoverThresholds,
}

impl HandoverAutomaton {
    pub fn new(thresholds: HandoverThresholds) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        Ok(Self {
            state: HandoverState::Manual,
            thresholds,
        })
    }

    pub fn step(
        &mut self,
        phase_dot: f64,
        phase_dot_ref: f64,
        collision_detected: bool,
    ) -> HandoverState {
        let next = match self.state {
            HandoverState::Manual if phase_dot >= self.thresholds.phase_dot_preauto_th => {
                HandoverState::PreAuto
            }
            HandoverState::PreAuto
                if phase_dot <= phase_dot_ref + self.thresholds.phase_dot_th =>
            {
                HandoverState::Auto
            }
            HandoverState::Auto if collision_detected => HandoverState::Manual,
            s => s,
        };
        if next != self.state {
            debug!(from = ?self.state, to = ?next, phase_dot, "handover transition");
            self.state = next;
        }
        next
    }

    pub fn state(&self) -> HandoverState {
        self.state
    }

    /// Only `Auto` grants the guide authority.
    pub fn is_active(&self) -> bool {
        self.state == HandoverState::Auto
    }

    pub fn thresholds(&self) -> HandoverThresholds {
        self.thresholds
    }

    pub fn reset(&mut self) {
        self.state = HandoverState::Manual;
    }
}
