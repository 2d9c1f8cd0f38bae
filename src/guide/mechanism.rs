use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::core::model::TrajectoryModel;

const TANGENT_EPS: f64 = 1e-12;

/// A learned attractor trajectory that competes to pull the robot.
///
/// The manager owns every mechanism exclusively; nothing outside the bank holds a reference across
/// a structural mutation.
pub trait VirtualMechanism: Send + Sync + std::fmt::Debug {
    /// Advance phase and tracked state by one control cycle.
    fn update(&mut self, position: &DVector<f64>, velocity: &DVector<f64>, dt: f64);
    /// Likelihood of `position` under the mechanism's motion model.
    fn probability(&self, position: &DVector<f64>) -> f64;
    /// Distance from `position` to the trajectory.
    fn distance(&self, position: &DVector<f64>) -> f64;
    fn phase(&self) -> f64;
    fn phase_dot(&self) -> f64;
    /// Speed the guide would impose when it holds authority.
    fn phase_dot_ref(&self) -> f64;
    fn stiffness(&self) -> &DMatrix<f64>;
    fn damping(&self) -> &DMatrix<f64>;
    fn state(&self) -> &DVector<f64>;
    fn state_dot(&self) -> &DVector<f64>;
    fn set_active(&mut self, active: bool);
    fn is_active(&self) -> bool;
    fn move_forward(&mut self);
    fn move_backward(&mut self);
    /// Freeze phase progression, keeping the current state.
    fn stop(&mut self);
    fn resume(&mut self);
    /// The motion model, shared so it can be persisted outside the bank lock.
    fn model(&self) -> Arc<TrajectoryModel>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Per-mechanism dynamic parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct MechanismParams {
    #[serde(default = "MechanismParams::default_stiffness")]
    pub stiffness: f64,
    #[serde(default = "MechanismParams::default_damping")]
    pub damping: f64,
    #[serde(default = "MechanismParams::default_phase_dot_ref")]
    pub phase_dot_ref: f64,
    #[serde(default = "MechanismParams::default_phase_gain")]
    pub phase_gain: f64,
    #[serde(default = "MechanismParams::default_max_phase_dot")]
    pub max_phase_dot: f64,
}

impl MechanismParams {
    fn default_stiffness() -> f64 {
        300.0
    }
    fn default_damping() -> f64 {
        20.0
    }
    fn default_phase_dot_ref() -> f64 {
        0.1
    }
    fn default_phase_gain() -> f64 {
        5.0
    }
    fn default_max_phase_dot() -> f64 {
        1.0
    }
}

impl Default for MechanismParams {
    fn default() -> Self {
        Self {
            stiffness: Self::default_stiffness(),
            damping: Self::default_damping(),
            phase_dot_ref: Self::default_phase_dot_ref(),
            phase_gain: Self::default_phase_gain(),
            max_phase_dot: Self::default_max_phase_dot(),
        }
    }
}

/// Virtual mechanism backed by a [`TrajectoryModel`].
///
/// While inactive the operator drives the phase (velocity projected on the tangent plus a pull
/// toward the closest point); while active the guide advances at its reference speed. The current
/// direction acts as a one-way clutch on the phase velocity.
#[derive(Debug, Clone)]
pub struct GuideMechanism {
    model: Arc<TrajectoryModel>,
    params: MechanismParams,
    weighted_dist: bool,
    phase: f64,
    phase_dot: f64,
    direction: Direction,
    active: bool,
    halted: bool,
    k: DMatrix<f64>,
    b: DMatrix<f64>,
    state: DVector<f64>,
    state_dot: DVector<f64>,
}

impl GuideMechanism {
    pub fn new(model: Arc<TrajectoryModel>, params: MechanismParams) -> Self {
        let dim = model.dim();
        let state = model.position_at(0.0);
        Self {
            params,
            weighted_dist: false,
            phase: 0.0,
            phase_dot: 0.0,
            direction: Direction::Forward,
            active: false,
            halted: false,
            k: DMatrix::identity(dim, dim) * params.stiffness,
            b: DMatrix::identity(dim, dim) * params.damping,
            state,
            state_dot: DVector::zeros(dim),
            model,
        }
    }

    /// Measure distance in standard deviations of the local model variance.
    pub fn with_weighted_dist(mut self, on: bool) -> Self {
        self.weighted_dist = on;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn drive(&self, position: &DVector<f64>, velocity: &DVector<f64>) -> f64 {
        if self.active {
            return match self.direction {
                Direction::Forward => self.params.phase_dot_ref,
                Direction::Backward => -self.params.phase_dot_ref,
            };
        }
        let tangent = self.model.tangent_at(self.phase);
        let norm2 = tangent.norm_squared();
        let projected = if norm2 > TANGENT_EPS {
            tangent.dot(velocity) / norm2
        } else {
            0.0
        };
        let (closest, _) = self.model.closest(position);
        projected + self.params.phase_gain * (closest - self.phase)
    }
}

impl VirtualMechanism for GuideMechanism {
    fn update(&mut self, position: &DVector<f64>, velocity: &DVector<f64>, dt: f64) {
        self.phase_dot = if self.halted {
            0.0
        } else {
            let drive = self.drive(position, velocity);
            let clutched = match self.direction {
                Direction::Forward => drive.max(0.0),
                Direction::Backward => drive.min(0.0),
            };
            let limit = self.params.max_phase_dot.abs();
            clutched.clamp(-limit, limit)
        };
        self.phase = (self.phase + self.phase_dot * dt).clamp(0.0, 1.0);
        self.state = self.model.position_at(self.phase);
        self.state_dot = self.model.tangent_at(self.phase) * self.phase_dot;
    }

    fn probability(&self, position: &DVector<f64>) -> f64 {
        self.model.probability(position)
    }

    fn distance(&self, position: &DVector<f64>) -> f64 {
        let (phase, dist) = self.model.closest(position);
        if self.weighted_dist {
            dist / self.model.variance_at(phase).sqrt()
        } else {
            dist
        }
    }

    fn phase(&self) -> f64 {
        self.phase
    }

    fn phase_dot(&self) -> f64 {
        self.phase_dot
    }

    fn phase_dot_ref(&self) -> f64 {
        self.params.phase_dot_ref
    }

    fn stiffness(&self) -> &DMatrix<f64> {
        &self.k
    }

    fn damping(&self) -> &DMatrix<f64> {
        &self.b
    }

    fn state(&self) -> &DVector<f64> {
        &self.state
    }

    fn state_dot(&self) -> &DVector<f64> {
        &self.state_dot
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn move_forward(&mut self) {
        self.direction = Direction::Forward;
    }

    fn move_backward(&mut self) {
        self.direction = Direction::Backward;
    }

    fn stop(&mut self) {
        self.halted = true;
        self.phase_dot = 0.0;
        self.state_dot.fill(0.0);
    }

    fn resume(&mut self) {
        self.halted = false;
    }

    fn model(&self) -> Arc<TrajectoryModel> {
        Arc::clone(&self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn mechanism() -> GuideMechanism {
        let model = TrajectoryModel::from_points(vec![dvector![0.0, 0.0], dvector![1.0, 0.0]], 0.04)
            .expect("model");
        GuideMechanism::new(Arc::new(model), MechanismParams::default())
    }

    #[test]
    fn operator_drives_phase_along_tangent() {
        let mut vm = mechanism();
        let pos = dvector![0.0, 0.0];
        let vel = dvector![0.5, 0.0];
        vm.update(&pos, &vel, 0.01);
        assert!((vm.phase_dot() - 0.5).abs() < 1e-12);
        assert!((vm.phase() - 0.005).abs() < 1e-12);
        assert!((vm.state()[0] - 0.005).abs() < 1e-12);
        assert!((vm.state_dot()[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn forward_clutch_keeps_phase_monotonic() {
        let mut vm = mechanism();
        let pos = dvector![0.5, 0.0];
        vm.update(&pos, &dvector![0.0, 0.0], 0.01);
        let p0 = vm.phase();
        vm.update(&dvector![0.0, 0.0], &dvector![-1.0, 0.0], 0.01);
        assert_eq!(vm.phase_dot(), 0.0);
        assert_eq!(vm.phase(), p0);

        vm.move_backward();
        vm.update(&dvector![0.0, 0.0], &dvector![-1.0, 0.0], 0.01);
        assert!(vm.phase() < p0);
    }

    #[test]
    fn active_guide_runs_at_reference_speed() {
        let mut vm = mechanism();
        vm.set_active(true);
        vm.update(&dvector![0.0, 0.0], &dvector![0.0, 0.0], 0.5);
        assert!((vm.phase() - 0.05).abs() < 1e-12);
        vm.move_backward();
        vm.update(&dvector![0.0, 0.0], &dvector![0.0, 0.0], 0.5);
        assert!(vm.phase().abs() < 1e-12);
    }

    #[test]
    fn stop_freezes_progression_until_resume() {
        let mut vm = mechanism();
        vm.set_active(true);
        vm.update(&dvector![0.0, 0.0], &dvector![0.0, 0.0], 1.0);
        let frozen = vm.phase();
        vm.stop();
        vm.update(&dvector![0.0, 0.0], &dvector![1.0, 0.0], 1.0);
        assert_eq!(vm.phase(), frozen);
        assert_eq!(vm.phase_dot(), 0.0);
        vm.resume();
        vm.update(&dvector![0.0, 0.0], &dvector![0.0, 0.0], 1.0);
        assert!(vm.phase() > frozen);
    }

    #[test]
    fn weighted_distance_scales_by_std_dev() {
        let vm = mechanism();
        let weighted = mechanism().with_weighted_dist(true);
        let p = dvector![0.5, 0.4];
        assert!((vm.distance(&p) - 0.4).abs() < 1e-12);
        assert!((weighted.distance(&p) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn gains_are_isotropic() {
        let vm = mechanism();
        assert_eq!(vm.stiffness(), &(DMatrix::identity(2, 2) * 300.0));
        assert_eq!(vm.damping(), &(DMatrix::identity(2, 2) * 20.0));
    }
}
