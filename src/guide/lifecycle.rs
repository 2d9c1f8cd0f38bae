//! Insert/delete/save requests, each category served by its own single-slot worker.
//!
//! Slow work (loading a model file, fitting samples, writing to disk) happens on the worker thread
//! without touching the mechanism bank; only the final push/remove takes the manager's exclusive lock.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nalgebra::DMatrix;
use tracing::{info, warn};

use crate::core::model::{FitParams, TrajectoryModel};
use crate::error::{LifecycleError, ModelError};
use crate::guide::manager::{Manager, MechanismId, MechanismTarget};
use crate::guide::mechanism::{GuideMechanism, MechanismParams, VirtualMechanism};
use crate::guide::worker::{Rejected, SlotWorker, Ticket};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Insert,
    Delete,
    Save,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Insert => "insert",
            Category::Delete => "delete",
            Category::Save => "save",
        })
    }
}

/// Where a new mechanism's motion model comes from.
#[derive(Clone, Debug)]
pub enum InsertSource {
    /// A pre-trained model file, resolved against the model library directory.
    Named(String),
    /// Raw demonstration samples (rows are time steps) fitted into a new model.
    Samples(DMatrix<f64>),
}

/// Per-mechanism switches from the configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MechanismFlags {
    pub use_weighted_dist: bool,
    pub use_active_guide: bool,
}

#[derive(Clone, Debug)]
pub struct InsertRequest {
    pub source: InsertSource,
    /// Overrides the library defaults when set.
    pub flags: Option<MechanismFlags>,
}

impl From<InsertSource> for InsertRequest {
    fn from(source: InsertSource) -> Self {
        Self {
            source,
            flags: None,
        }
    }
}

/// A mechanism ready to be appended, with its "use active guide" flag.
pub struct BuiltMechanism {
    pub vm: Box<dyn VirtualMechanism>,
    pub use_active_guide: bool,
}

/// Turns an insert request into a mechanism. Runs on the insert worker thread.
pub trait MechanismFactory: Send + Sync {
    fn build(&self, request: &InsertRequest) -> Result<BuiltMechanism, ModelError>;
}

/// File-backed model library: named models live in one directory.
#[derive(Clone, Debug)]
pub struct ModelLibrary {
    dir: PathBuf,
    dim: usize,
    params: MechanismParams,
    fit: FitParams,
    defaults: MechanismFlags,
}

impl ModelLibrary {
    pub fn new(dir: impl Into<PathBuf>, dim: usize, params: MechanismParams, fit: FitParams) -> Self {
        Self {
            dir: dir.into(),
            dim,
            params,
            fit,
            defaults: MechanismFlags {
                use_weighted_dist: false,
                use_active_guide: true,
            },
        }
    }

    pub fn with_defaults(mut self, defaults: MechanismFlags) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn load(&self, name: &str) -> Result<TrajectoryModel, ModelError> {
        let model = TrajectoryModel::load(&self.path_of(name))?;
        self.check_dim(model)
    }

    pub fn fit(&self, samples: &DMatrix<f64>) -> Result<TrajectoryModel, ModelError> {
        let model = TrajectoryModel::fit(samples, &self.fit)?;
        self.check_dim(model)
    }

    fn check_dim(&self, model: TrajectoryModel) -> Result<TrajectoryModel, ModelError> {
        if model.dim() != self.dim {
            return Err(ModelError::DimensionMismatch {
                expected: self.dim,
                found: model.dim(),
            });
        }
        Ok(model)
    }

    pub fn mechanism(&self, model: TrajectoryModel, flags: MechanismFlags) -> BuiltMechanism {
        let vm = GuideMechanism::new(Arc::new(model), self.params)
            .with_weighted_dist(flags.use_weighted_dist);
        BuiltMechanism {
            vm: Box::new(vm),
            use_active_guide: flags.use_active_guide,
        }
    }
}

impl MechanismFactory for ModelLibrary {
    fn build(&self, request: &InsertRequest) -> Result<BuiltMechanism, ModelError> {
        let model = match &request.source {
            InsertSource::Named(name) => self.load(name)?,
            InsertSource::Samples(samples) => self.fit(samples)?,
        };
        Ok(self.mechanism(model, request.flags.unwrap_or(self.defaults)))
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

pub struct LifecycleScheduler {
    manager: Arc<Manager>,
    factory: Arc<dyn MechanismFactory>,
    insert: SlotWorker<LifecycleResult<MechanismId>>,
    delete: SlotWorker<LifecycleResult<MechanismId>>,
    save: SlotWorker<LifecycleResult<PathBuf>>,
}

impl LifecycleScheduler {
    pub fn new(manager: Arc<Manager>, factory: Arc<dyn MechanismFactory>) -> std::io::Result<Self> {
        Ok(Self {
            manager,
            factory,
            insert: SlotWorker::spawn("insert")?,
            delete: SlotWorker::spawn("delete")?,
            save: SlotWorker::spawn("save")?,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Build a mechanism on the insert worker and append it.
    pub fn insert(
        &self,
        request: impl Into<InsertRequest>,
    ) -> LifecycleResult<Ticket<LifecycleResult<MechanismId>>> {
        let request = request.into();
        let manager = Arc::clone(&self.manager);
        let factory = Arc::clone(&self.factory);
        submit(&self.insert, Category::Insert, move || {
            let built = factory.build(&request).map_err(|err| {
                warn!(source = %describe(&request.source), %err, "insert failed");
                LifecycleError::from(err)
            })?;
            manager.insert(built.vm, built.use_active_guide)
        })
    }

    pub fn delete(
        &self,
        target: MechanismTarget,
    ) -> LifecycleResult<Ticket<LifecycleResult<MechanismId>>> {
        let manager = Arc::clone(&self.manager);
        submit(&self.delete, Category::Delete, move || {
            manager.delete(target).inspect_err(|err| {
                warn!(?target, %err, "delete failed");
            })
        })
    }

    /// Persist a mechanism's model. The bank is only read; the write happens outside the lock.
    pub fn save(
        &self,
        target: MechanismTarget,
        destination: impl Into<PathBuf>,
    ) -> LifecycleResult<Ticket<LifecycleResult<PathBuf>>> {
        let manager = Arc::clone(&self.manager);
        let destination = destination.into();
        submit(&self.save, Category::Save, move || {
            let (id, model) = manager.model(target)?;
            model.save(&destination).map_err(|err| {
                warn!(id, path = %destination.display(), %err, "save failed");
                LifecycleError::from(err)
            })?;
            info!(id, path = %destination.display(), "model saved");
            Ok(destination)
        })
    }

    pub fn is_busy(&self, category: Category) -> bool {
        match category {
            Category::Insert => self.insert.is_busy(),
            Category::Delete => self.delete.is_busy(),
            Category::Save => self.save.is_busy(),
        }
    }
}

fn submit<R, F>(
    worker: &SlotWorker<LifecycleResult<R>>,
    category: Category,
    job: F,
) -> LifecycleResult<Ticket<LifecycleResult<R>>>
where
    R: Send + 'static,
    F: FnOnce() -> LifecycleResult<R> + Send + 'static,
{
    worker.try_submit(job).map_err(|rejected| {
        warn!(%category, ?rejected, "lifecycle request dropped");
        match rejected {
            Rejected::Busy => LifecycleError::Busy(category),
            Rejected::Stopped => LifecycleError::WorkerGone(category),
        }
    })
}

fn describe(source: &InsertSource) -> String {
    match source {
        InsertSource::Named(name) => name.clone(),
        InsertSource::Samples(m) => format!("{}x{} samples", m.nrows(), m.ncols()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guide::blend::ProbMode;
    use crate::guide::manager::ManagerConfig;
    use nalgebra::dvector;

    fn library(dir: &Path) -> ModelLibrary {
        ModelLibrary::new(dir, 2, MechanismParams::default(), FitParams::default())
    }

    fn manager(lib: &ModelLibrary) -> Arc<Manager> {
        let model = TrajectoryModel::from_points(vec![dvector![0.0, 0.0], dvector![1.0, 0.0]], 0.01)
            .expect("model");
        let built = lib.mechanism(model, MechanismFlags::default());
        Arc::new(
            Manager::new(
                ManagerConfig::new(2, ProbMode::Hard),
                vec![(built.vm, built.use_active_guide)],
            )
            .expect("manager"),
        )
    }

    #[test]
    fn insert_from_samples_then_save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib = library(dir.path());
        let mgr = manager(&lib);
        let sched = LifecycleScheduler::new(Arc::clone(&mgr), Arc::new(lib.clone())).expect("sched");

        let samples = DMatrix::from_fn(100, 2, |r, c| if c == 0 { r as f64 * 0.01 } else { 1.0 });
        let id = sched
            .insert(InsertSource::Samples(samples))
            .expect("accepted")
            .wait()
            .expect("finished")
            .expect("inserted");
        assert_eq!(mgr.count(), 2);
        assert_eq!(mgr.index_of(id), Some(1));

        let path = sched
            .save(MechanismTarget::Id(id), dir.path().join("fitted.txt"))
            .expect("accepted")
            .wait()
            .expect("finished")
            .expect("saved");
        let again = sched
            .insert(InsertSource::Named("fitted.txt".into()))
            .expect("accepted")
            .wait()
            .expect("finished")
            .expect("inserted");
        assert!(path.exists());
        assert_eq!(mgr.count(), 3);
        assert_ne!(again, id);
    }

    #[test]
    fn wrong_dimension_model_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib = library(dir.path());
        let mgr = manager(&lib);
        let sched = LifecycleScheduler::new(Arc::clone(&mgr), Arc::new(lib)).expect("sched");
        let samples = DMatrix::from_fn(50, 3, |r, _| r as f64 * 0.05);
        let res = sched
            .insert(InsertSource::Samples(samples))
            .expect("accepted")
            .wait()
            .expect("finished");
        assert!(matches!(
            res,
            Err(LifecycleError::Model(ModelError::DimensionMismatch { .. }))
        ));
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn save_out_of_range_reports_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib = library(dir.path());
        let mgr = manager(&lib);
        let sched = LifecycleScheduler::new(mgr, Arc::new(lib)).expect("sched");
        let res = sched
            .save(MechanismTarget::Index(7), dir.path().join("x.txt"))
            .expect("accepted")
            .wait()
            .expect("finished");
        assert!(matches!(
            res,
            Err(LifecycleError::IndexOutOfRange { index: 7, count: 1 })
        ));
    }
}
