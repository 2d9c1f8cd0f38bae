//! Blend engine: owns the virtual mechanisms and turns them into one corrective force per cycle.
//!
//! The mechanisms and every per-mechanism vector live together in a [`Bank`] behind a single
//! `RwLock`. The control thread holds the write side for the whole cycle (it mutates every
//! mechanism); lifecycle workers take it only for the push/remove itself, after any model loading
//! or fitting has finished. Readers (getters, save) take the read side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nalgebra::DVector;
use tracing::{debug, info, trace};

use crate::core::model::TrajectoryModel;
use crate::error::{ConfigError, LifecycleError, ModelError};
use crate::guide::blend::ProbMode;
use crate::guide::handover::{HandoverAutomaton, HandoverState, HandoverThresholds};
use crate::guide::mechanism::VirtualMechanism;
use crate::guide::telemetry::{NullSink, TelemetryFrame, TelemetrySink};

/// Stable identity of a mechanism, unaffected by deletions of other records.
pub type MechanismId = u64;

/// Addresses a record either by current position or by stable id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MechanismTarget {
    Index(usize),
    Id(MechanismId),
}

impl From<usize> for MechanismTarget {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ManagerConfig {
    pub dim: usize,
    pub mode: ProbMode,
    pub thresholds: HandoverThresholds,
    /// Added to `1/n` to get the activation threshold on blend weights.
    pub scale_threshold_offset: f64,
}

impl ManagerConfig {
    pub fn new(dim: usize, mode: ProbMode) -> Self {
        Self {
            dim,
            mode,
            thresholds: HandoverThresholds::default(),
            scale_threshold_offset: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub cycles: u64,
    pub degenerate_cycles: u64,
}

/// Consistent copy of the per-mechanism vectors taken under one lock acquisition.
#[derive(Clone, Debug, PartialEq)]
pub struct BankSnapshot {
    pub ids: Vec<MechanismId>,
    pub scales: Vec<f64>,
    pub phase: Vec<f64>,
    pub active: Vec<bool>,
    pub handover: Vec<HandoverState>,
    pub use_active_guide: Vec<bool>,
}

impl BankSnapshot {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True when every parallel vector has the same length.
    pub fn is_consistent(&self) -> bool {
        let n = self.ids.len();
        self.scales.len() == n
            && self.phase.len() == n
            && self.active.len() == n
            && self.handover.len() == n
            && self.use_active_guide.len() == n
    }
}

struct Slot {
    id: MechanismId,
    vm: Box<dyn VirtualMechanism>,
    use_active_guide: bool,
    automaton: HandoverAutomaton,
}

struct Bank {
    slots: Vec<Slot>,
    scales: Vec<f64>,
    phase: Vec<f64>,
    active: Vec<bool>,
    robot_position: DVector<f64>,
}

impl Bank {
    fn push(&mut self, slot: Slot) {
        self.phase.push(slot.vm.phase());
        self.scales.push(0.0);
        self.active.push(false);
        self.slots.push(slot);
    }

    fn remove(&mut self, index: usize) -> Slot {
        self.scales.remove(index);
        self.phase.remove(index);
        self.active.remove(index);
        self.slots.remove(index)
    }

    fn resolve(&self, target: MechanismTarget) -> Result<usize, LifecycleError> {
        match target {
            MechanismTarget::Index(index) if index < self.slots.len() => Ok(index),
            MechanismTarget::Index(index) => Err(LifecycleError::IndexOutOfRange {
                index,
                count: self.slots.len(),
            }),
            MechanismTarget::Id(id) => self
                .slots
                .iter()
                .position(|s| s.id == id)
                .ok_or(LifecycleError::UnknownId(id)),
        }
    }

    fn frame(&self, cycle: u64) -> TelemetryFrame {
        TelemetryFrame {
            cycle,
            phase: self.phase.clone(),
            scales: self.scales.clone(),
            robot_position: self.robot_position.iter().copied().collect(),
            vm_positions: self
                .slots
                .iter()
                .map(|s| s.vm.state().iter().copied().collect())
                .collect(),
        }
    }
}

pub struct Manager {
    dim: usize,
    mode: ProbMode,
    scale_threshold: f64,
    handover: HandoverAutomaton,
    bank: RwLock<Bank>,
    collision_detected: AtomicBool,
    next_id: AtomicU64,
    cycles: AtomicU64,
    degenerate_cycles: AtomicU64,
    sink: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("dim", &self.dim)
            .field("mode", &self.mode)
            .field("scale_threshold", &self.scale_threshold)
            .field("count", &self.count())
            .finish()
    }
}

impl Manager {
    /// Build the engine from an initial, non-empty set of mechanisms.
    ///
    /// Each entry carries the mechanism and its "use active guide" flag.
    pub fn new(
        config: ManagerConfig,
        mechanisms: Vec<(Box<dyn VirtualMechanism>, bool)>,
    ) -> Result<Self, ConfigError> {
        if !(1..=3).contains(&config.dim) {
            return Err(ConfigError::InvalidDimension(config.dim));
        }
        let handover = HandoverAutomaton::new(config.thresholds)?;
        if mechanisms.is_empty() {
            return Err(ConfigError::NoMechanisms);
        }
        if !config.scale_threshold_offset.is_finite() {
            return Err(ConfigError::Invalid {
                field: "scale_threshold_offset",
                reason: format!("{} is not finite", config.scale_threshold_offset),
            });
        }

        let n = mechanisms.len();
        let mut bank = Bank {
            slots: Vec::with_capacity(n),
            scales: Vec::with_capacity(n),
            phase: Vec::with_capacity(n),
            active: Vec::with_capacity(n),
            robot_position: DVector::zeros(config.dim),
        };
        for (id, (vm, use_active_guide)) in mechanisms.into_iter().enumerate() {
            check_dim(config.dim, vm.as_ref())?;
            bank.push(Slot {
                id: id as MechanismId,
                vm,
                use_active_guide,
                automaton: handover.clone(),
            });
        }

        let scale_threshold = 1.0 / n as f64 + config.scale_threshold_offset;
        info!(
            count = n,
            dim = config.dim,
            mode = %config.mode,
            scale_threshold,
            "mechanism manager ready"
        );

        Ok(Self {
            dim: config.dim,
            mode: config.mode,
            scale_threshold,
            handover,
            bank: RwLock::new(bank),
            // guides start disengaged until the caller clears the collision flag
            collision_detected: AtomicBool::new(true),
            next_id: AtomicU64::new(n as MechanismId),
            cycles: AtomicU64::new(0),
            degenerate_cycles: AtomicU64::new(0),
            sink: Arc::new(NullSink),
        })
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Bank> {
        self.bank.read().expect("mechanism bank lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Bank> {
        self.bank.write().expect("mechanism bank lock poisoned")
    }

    /// Run one control cycle and return the blended corrective force.
    ///
    /// Panics when the input dimensions do not match or `dt` is not positive.
    pub fn update(
        &self,
        position: &DVector<f64>,
        velocity: &DVector<f64>,
        dt: f64,
        force_applied: bool,
        move_forward: bool,
    ) -> DVector<f64> {
        assert_eq!(position.len(), self.dim, "robot position has wrong dimension");
        assert_eq!(velocity.len(), self.dim, "robot velocity has wrong dimension");
        assert!(dt > 0.0, "dt must be positive (got {dt})");

        let collision = self.collision_detected.load(Ordering::Acquire);
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let mut force = DVector::zeros(self.dim);

        let frame = {
            let mut guard = self.write();
            let bank = &mut *guard;
            assert!(!bank.slots.is_empty(), "update with no virtual mechanisms");

            for slot in bank.slots.iter_mut() {
                if move_forward {
                    slot.vm.move_forward();
                } else {
                    slot.vm.move_backward();
                }
            }

            // gated on the previous cycle's weights
            for (i, slot) in bank.slots.iter_mut().enumerate() {
                let on = !force_applied
                    && bank.scales[i] > self.scale_threshold
                    && slot.use_active_guide;
                slot.vm.set_active(on);
                bank.active[i] = on;
            }

            for (i, slot) in bank.slots.iter_mut().enumerate() {
                slot.vm.update(position, velocity, dt);
                bank.scales[i] = self.mode.raw_score(slot.vm.as_ref(), position);
                bank.phase[i] = slot.vm.phase();
                slot.automaton
                    .step(slot.vm.phase_dot(), slot.vm.phase_dot_ref(), collision);
            }

            let sum: f64 = bank.scales.iter().sum();
            if self.mode.is_degenerate(sum) {
                bank.scales.fill(0.0);
                let n = self.degenerate_cycles.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(cycle, sum, degenerate_cycles = n, "zero total weight, force zeroed");
            } else {
                for (i, slot) in bank.slots.iter().enumerate() {
                    let vm = slot.vm.as_ref();
                    let w = self.mode.resolve(bank.scales[i], sum, vm, position);
                    bank.scales[i] = w;
                    let spring = vm.stiffness() * (vm.state() - position);
                    let damper = vm.damping() * (vm.state_dot() - velocity);
                    force += (spring + damper) * w;
                }
            }

            bank.robot_position.copy_from(position);
            self.sink.enabled().then(|| bank.frame(cycle))
        };

        if let Some(frame) = frame {
            self.sink.publish(frame);
        }
        force
    }

    /// Append a mechanism. Only the push itself runs under the exclusive lock.
    pub fn insert(
        &self,
        vm: Box<dyn VirtualMechanism>,
        use_active_guide: bool,
    ) -> Result<MechanismId, LifecycleError> {
        check_dim(self.dim, vm.as_ref())?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut automaton = self.handover.clone();
        automaton.reset();
        let count = {
            let mut bank = self.write();
            bank.push(Slot {
                id,
                vm,
                use_active_guide,
                automaton,
            });
            bank.slots.len()
        };
        info!(id, count, "virtual mechanism inserted");
        Ok(id)
    }

    /// Remove a mechanism; records above it shift down by one. The last mechanism cannot be removed.
    pub fn delete(&self, target: MechanismTarget) -> Result<MechanismId, LifecycleError> {
        let (id, count) = {
            let mut bank = self.write();
            let index = bank.resolve(target)?;
            if bank.slots.len() == 1 {
                return Err(LifecycleError::LastMechanism);
            }
            let slot = bank.remove(index);
            (slot.id, bank.slots.len())
        };
        info!(id, count, "virtual mechanism deleted");
        Ok(id)
    }

    /// The model of one mechanism, cloned out under the read lock.
    pub fn model(
        &self,
        target: MechanismTarget,
    ) -> Result<(MechanismId, Arc<TrajectoryModel>), LifecycleError> {
        let bank = self.read();
        let index = bank.resolve(target)?;
        let slot = &bank.slots[index];
        Ok((slot.id, slot.vm.model()))
    }

    pub fn count(&self) -> usize {
        self.read().slots.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn mode(&self) -> ProbMode {
        self.mode
    }

    pub fn scale_threshold(&self) -> f64 {
        self.scale_threshold
    }

    pub fn phase(&self, index: usize) -> Option<f64> {
        self.read().phase.get(index).copied()
    }

    pub fn scale(&self, index: usize) -> Option<f64> {
        self.read().scales.get(index).copied()
    }

    pub fn active(&self, index: usize) -> Option<bool> {
        self.read().active.get(index).copied()
    }

    /// True when any guide passed the activation gate on the last cycle.
    pub fn on_any_active(&self) -> bool {
        self.read().active.iter().any(|&a| a)
    }

    pub fn vm_position(&self, index: usize) -> Option<DVector<f64>> {
        self.read().slots.get(index).map(|s| s.vm.state().clone())
    }

    pub fn vm_velocity(&self, index: usize) -> Option<DVector<f64>> {
        self.read().slots.get(index).map(|s| s.vm.state_dot().clone())
    }

    pub fn handover_state(&self, index: usize) -> Option<HandoverState> {
        self.read().slots.get(index).map(|s| s.automaton.state())
    }

    pub fn is_auto(&self, index: usize) -> Option<bool> {
        self.read().slots.get(index).map(|s| s.automaton.is_active())
    }

    pub fn ids(&self) -> Vec<MechanismId> {
        self.read().slots.iter().map(|s| s.id).collect()
    }

    pub fn index_of(&self, id: MechanismId) -> Option<usize> {
        self.read().slots.iter().position(|s| s.id == id)
    }

    pub fn snapshot(&self) -> BankSnapshot {
        let bank = self.read();
        BankSnapshot {
            ids: bank.slots.iter().map(|s| s.id).collect(),
            scales: bank.scales.clone(),
            phase: bank.phase.clone(),
            active: bank.active.clone(),
            handover: bank.slots.iter().map(|s| s.automaton.state()).collect(),
            use_active_guide: bank.slots.iter().map(|s| s.use_active_guide).collect(),
        }
    }

    /// Halt phase progression on every mechanism; state is kept.
    pub fn stop(&self) {
        let mut bank = self.write();
        for slot in bank.slots.iter_mut() {
            slot.vm.stop();
        }
        debug!(count = bank.slots.len(), "mechanisms stopped");
    }

    pub fn resume(&self) {
        let mut bank = self.write();
        for slot in bank.slots.iter_mut() {
            slot.vm.resume();
        }
        debug!(count = bank.slots.len(), "mechanisms resumed");
    }

    pub fn set_collision_detected(&self, detected: bool) {
        self.collision_detected.store(detected, Ordering::Release);
    }

    pub fn collision_detected(&self) -> bool {
        self.collision_detected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            degenerate_cycles: self.degenerate_cycles.load(Ordering::Relaxed),
        }
    }
}

fn check_dim(dim: usize, vm: &dyn VirtualMechanism) -> Result<(), ModelError> {
    let found = vm.state().len();
    if found == dim {
        Ok(())
    } else {
        Err(ModelError::DimensionMismatch {
            expected: dim,
            found,
        })
    }
}
