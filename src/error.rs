//! Error taxonomy shared by the loader, the blend engine and the lifecycle workers.

use std::path::PathBuf;

use thiserror::Error;

use crate::guide::lifecycle::Category;

/// Faults detected while reading or validating the configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("position dimension must be 1, 2 or 3 (got {0})")]
    InvalidDimension(usize),
    #[error(
        "handover thresholds must satisfy preauto > th > 0 (preauto={preauto}, th={threshold})"
    )]
    Thresholds { preauto: f64, threshold: f64 },
    #[error("at least one virtual mechanism is required")]
    NoMechanisms,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to load model: {0}")]
    Model(#[from] ModelError),
    #[error("failed to start lifecycle workers: {0}")]
    Workers(#[source] std::io::Error),
}

/// Faults reading, fitting or writing a motion model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("model needs at least two knots (got {0})")]
    TooFewKnots(usize),
    #[error("knot arrays differ in length (phases {phases}, means {means}, variances {variances})")]
    KnotCountMismatch {
        phases: usize,
        means: usize,
        variances: usize,
    },
    #[error("knot phases must lie in [0, 1] (got {first}..{last})")]
    PhaseOutOfRange { first: f64, last: f64 },
    #[error("knot phases must be strictly increasing (knot {0})")]
    NonMonotonicPhase(usize),
    #[error("knot variance must be finite and positive (knot {0})")]
    InvalidVariance(usize),
    #[error("model dimension {found} does not match configured dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("not enough distinct samples to fit a model (did the robot move?)")]
    NotEnoughSamples,
}

/// Failures reported back from the insert/delete/save workers.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} worker is busy")]
    Busy(Category),
    #[error("mechanism index {index} out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("no mechanism with id {0}")]
    UnknownId(u64),
    #[error("refusing to delete the last virtual mechanism")]
    LastMechanism,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{0} worker stopped")]
    WorkerGone(Category),
}

/// Top-level failures of the headless runner.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
