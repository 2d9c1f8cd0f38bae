#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::{DMatrix, DVector};
use vmblend::core::model::TrajectoryModel;
use vmblend::guide::mechanism::VirtualMechanism;

/// Mechanism with a fixed likelihood, distance and attractor point.
#[derive(Debug)]
pub struct FixedMechanism {
    pub prob: f64,
    pub dist: f64,
    pub phase_dot: f64,
    pub phase: f64,
    state: DVector<f64>,
    state_dot: DVector<f64>,
    k: DMatrix<f64>,
    b: DMatrix<f64>,
    active: bool,
    pub updates: Arc<AtomicUsize>,
}

impl FixedMechanism {
    pub fn new(state: DVector<f64>, prob: f64) -> Self {
        let dim = state.len();
        Self {
            prob,
            dist: 0.0,
            phase_dot: 0.0,
            phase: 0.0,
            state_dot: DVector::zeros(dim),
            k: DMatrix::identity(dim, dim),
            b: DMatrix::zeros(dim, dim),
            state,
            active: false,
            updates: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_distance(mut self, dist: f64) -> Self {
        self.dist = dist;
        self
    }

    pub fn with_phase_dot(mut self, phase_dot: f64) -> Self {
        self.phase_dot = phase_dot;
        self
    }

    pub fn boxed(self) -> Box<dyn VirtualMechanism> {
        Box::new(self)
    }
}

impl VirtualMechanism for FixedMechanism {
    fn update(&mut self, _position: &DVector<f64>, _velocity: &DVector<f64>, dt: f64) {
        self.phase = (self.phase + self.phase_dot * dt).clamp(0.0, 1.0);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
    fn probability(&self, _position: &DVector<f64>) -> f64 {
        self.prob
    }
    fn distance(&self, _position: &DVector<f64>) -> f64 {
        self.dist
    }
    fn phase(&self) -> f64 {
        self.phase
    }
    fn phase_dot(&self) -> f64 {
        self.phase_dot
    }
    fn phase_dot_ref(&self) -> f64 {
        0.1
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
    fn move_forward(&mut self) {}
    fn move_backward(&mut self) {}
    fn stop(&mut self) {}
    fn resume(&mut self) {}
    fn model(&self) -> Arc<TrajectoryModel> {
        let end = &self.state + DVector::from_element(self.state.len(), 1.0);
        Arc::new(
            TrajectoryModel::from_points(vec![self.state.clone(), end], 0.01)
                .expect("two distinct points"),
        )
    }
}

pub fn assert_close(a: f64, b: f64, label: &str) {
    let diff = (a - b).abs();
    assert!(diff <= 1e-9, "{label} mismatch: {a} vs {b}");
}
