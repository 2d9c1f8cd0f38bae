//! Outward facade: one object the control loop and the operator console talk to.

use std::path::PathBuf;
use std::sync::Arc;

use nalgebra::DVector;
use tracing::info;

use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::guide::handover::HandoverState;
use crate::guide::lifecycle::{
    Category, InsertRequest, LifecycleResult, LifecycleScheduler, MechanismFactory, ModelLibrary,
};
use crate::guide::manager::{
    BankSnapshot, Manager, ManagerConfig, ManagerStats, MechanismId, MechanismTarget,
};
use crate::guide::telemetry::TelemetrySink;
use crate::guide::worker::Ticket;

pub struct GuideSystem {
    manager: Arc<Manager>,
    scheduler: LifecycleScheduler,
}

impl GuideSystem {
    /// Load every configured model and start the lifecycle workers.
    ///
    /// Any model that cannot be loaded is a configuration fault.
    pub fn from_config(cfg: &AppConfig, sink: Arc<dyn TelemetrySink>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let library = ModelLibrary::new(
            &cfg.manager.models_dir,
            cfg.manager.position_dim,
            cfg.mechanism,
            cfg.fit.params(),
        );
        let mut mechanisms = Vec::with_capacity(cfg.models.len());
        for entry in &cfg.models {
            let model = library.load(&entry.name)?;
            info!(name = %entry.name, knots = model.len(), "model loaded");
            let built = library.mechanism(model, entry.flags());
            mechanisms.push((built.vm, built.use_active_guide));
        }

        let manager_cfg = ManagerConfig {
            dim: cfg.manager.position_dim,
            mode: cfg.manager.prob_mode(),
            thresholds: cfg.handover,
            scale_threshold_offset: cfg.manager.scale_threshold_offset,
        };
        let manager = Manager::new(manager_cfg, mechanisms)?.with_telemetry(sink);
        Self::with_manager(Arc::new(manager), Arc::new(library))
    }

    /// Wrap an already built manager, e.g. with custom mechanism implementations.
    pub fn with_manager(
        manager: Arc<Manager>,
        factory: Arc<dyn MechanismFactory>,
    ) -> Result<Self, ConfigError> {
        let scheduler =
            LifecycleScheduler::new(Arc::clone(&manager), factory).map_err(ConfigError::Workers)?;
        Ok(Self { manager, scheduler })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn update(
        &self,
        position: &DVector<f64>,
        velocity: &DVector<f64>,
        dt: f64,
        force_applied: bool,
        move_forward: bool,
    ) -> DVector<f64> {
        self.manager
            .update(position, velocity, dt, force_applied, move_forward)
    }

    /// Slice variant for callers that own plain buffers. `force` is overwritten.
    pub fn update_into(
        &self,
        position: &[f64],
        velocity: &[f64],
        dt: f64,
        force: &mut [f64],
        force_applied: bool,
        move_forward: bool,
    ) {
        assert_eq!(force.len(), self.manager.dim(), "force buffer has wrong dimension");
        let f = self.manager.update(
            &DVector::from_column_slice(position),
            &DVector::from_column_slice(velocity),
            dt,
            force_applied,
            move_forward,
        );
        force.copy_from_slice(f.as_slice());
    }

    pub fn insert(
        &self,
        request: impl Into<InsertRequest>,
    ) -> LifecycleResult<Ticket<LifecycleResult<MechanismId>>> {
        self.scheduler.insert(request)
    }

    pub fn delete(
        &self,
        target: MechanismTarget,
    ) -> LifecycleResult<Ticket<LifecycleResult<MechanismId>>> {
        self.scheduler.delete(target)
    }

    pub fn save(
        &self,
        target: MechanismTarget,
        destination: impl Into<PathBuf>,
    ) -> LifecycleResult<Ticket<LifecycleResult<PathBuf>>> {
        self.scheduler.save(target, destination)
    }

    pub fn is_busy(&self, category: Category) -> bool {
        self.scheduler.is_busy(category)
    }

    pub fn count(&self) -> usize {
        self.manager.count()
    }

    pub fn phase(&self, index: usize) -> Option<f64> {
        self.manager.phase(index)
    }

    pub fn scale(&self, index: usize) -> Option<f64> {
        self.manager.scale(index)
    }

    pub fn active(&self, index: usize) -> Option<bool> {
        self.manager.active(index)
    }

    pub fn on_any_active(&self) -> bool {
        self.manager.on_any_active()
    }

    pub fn vm_position(&self, index: usize) -> Option<DVector<f64>> {
        self.manager.vm_position(index)
    }

    pub fn vm_velocity(&self, index: usize) -> Option<DVector<f64>> {
        self.manager.vm_velocity(index)
    }

    pub fn handover_state(&self, index: usize) -> Option<HandoverState> {
        self.manager.handover_state(index)
    }

    pub fn snapshot(&self) -> BankSnapshot {
        self.manager.snapshot()
    }

    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }

    pub fn stop(&self) {
        self.manager.stop();
    }

    pub fn resume(&self) {
        self.manager.resume();
    }

    pub fn set_collision_detected(&self, detected: bool) {
        self.manager.set_collision_detected(detected);
    }
}
