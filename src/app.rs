//! Headless control loop: a simulated point-mass robot pushed by a jittery operator and pulled by
//! the blended guides, stepped at the configured control rate.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use nalgebra::DVector;
use rand::Rng;
use tracing::*;

use crate::cli::Args;
use crate::config::AppConfig;
use crate::core::textio::read_matrix;
use crate::error::{AppError, LifecycleError};
use crate::guide::GuideSystem;
use crate::guide::lifecycle::{Category, InsertSource, LifecycleResult};
use crate::guide::manager::{MechanismId, MechanismTarget};
use crate::guide::telemetry::{ChannelSink, NullSink, TelemetryFrame, TelemetrySink};
use crate::guide::worker::Ticket;

const ROBOT_MASS: f64 = 2.0;
const ROBOT_DAMPING: f64 = 8.0;
const OPERATOR_GAIN: f64 = 40.0;
const OPERATOR_JITTER: f64 = 2.0;
/// Operator force magnitude above which the operator counts as pushing.
const FORCE_APPLIED_TH: f64 = 5.0;

/// Point mass integrated with semi-implicit Euler.
#[derive(Debug, Clone)]
pub struct SimRobot {
    pub position: DVector<f64>,
    pub velocity: DVector<f64>,
}

impl SimRobot {
    pub fn new(position: DVector<f64>) -> Self {
        let dim = position.len();
        Self {
            position,
            velocity: DVector::zeros(dim),
        }
    }

    pub fn step(&mut self, force: &DVector<f64>, dt: f64) {
        let acc = (force - &self.velocity * ROBOT_DAMPING) / ROBOT_MASS;
        self.velocity += acc * dt;
        self.position += &self.velocity * dt;
    }
}

/// Operator walking a target along one guide, pushing in bursts.
#[derive(Debug)]
struct SimOperator {
    target_phase: f64,
    speed: f64,
    pushing: bool,
}

impl SimOperator {
    fn force<R: Rng>(
        &mut self,
        rng: &mut R,
        system: &GuideSystem,
        robot: &SimRobot,
        dt: f64,
    ) -> DVector<f64> {
        if rng.random_bool(0.002) {
            self.pushing = !self.pushing;
        }
        let dim = robot.position.len();
        if !self.pushing {
            return DVector::zeros(dim);
        }
        self.target_phase = (self.target_phase + self.speed * dt).min(1.0);
        let Ok((_, model)) = system.manager().model(MechanismTarget::Index(0)) else {
            return DVector::zeros(dim);
        };
        let target = model.position_at(self.target_phase);
        let jitter =
            DVector::from_fn(dim, |_, _| rng.random_range(-OPERATOR_JITTER..OPERATOR_JITTER));
        (target - &robot.position) * OPERATOR_GAIN + jitter
    }
}

fn spawn_telemetry_logger(
    rx: Receiver<TelemetryFrame>,
    every: u64,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("telemetry".into())
        .spawn(move || {
            for frame in rx.iter() {
                if frame.cycle % every == 0 {
                    info!(
                        cycle = frame.cycle,
                        phase = ?frame.phase,
                        scales = ?frame.scales,
                        robot = ?frame.robot_position,
                        "telemetry"
                    );
                }
            }
        })
}

fn poll_insert(pending: &mut Option<Ticket<LifecycleResult<MechanismId>>>) {
    let Some(ticket) = pending.as_ref() else {
        return;
    };
    match ticket.try_result() {
        Ok(Ok(id)) => {
            info!(id, "demonstration inserted");
            *pending = None;
        }
        Ok(Err(err)) => {
            warn!(%err, "demonstration insert failed");
            *pending = None;
        }
        Err(crossbeam_channel::TryRecvError::Empty) => {}
        Err(crossbeam_channel::TryRecvError::Disconnected) => {
            warn!("insert worker went away");
            *pending = None;
        }
    }
}

/// Save every mechanism's model into `dir`, one request at a time on the save worker.
pub fn save_all(system: &GuideSystem, dir: &Path) -> Result<usize, AppError> {
    fs::create_dir_all(dir)?;
    let ids = system.manager().ids();
    for &id in &ids {
        let ticket = system.save(MechanismTarget::Id(id), dir.join(format!("vm_{id}.txt")))?;
        match ticket.wait() {
            Some(res) => {
                res?;
            }
            None => return Err(LifecycleError::WorkerGone(Category::Save).into()),
        }
    }
    Ok(ids.len())
}

pub fn run(args: &Args, cfg: &AppConfig, stop: Arc<AtomicBool>) -> Result<(), AppError> {
    let every = cfg.control.telemetry_every;
    let (sink, logger) = if args.quiet_telemetry || every == 0 {
        (Arc::new(NullSink) as Arc<dyn TelemetrySink>, None)
    } else {
        let (sink, rx) = ChannelSink::new(64);
        let sink: Arc<dyn TelemetrySink> = Arc::new(sink);
        (sink, Some(spawn_telemetry_logger(rx, every)?))
    };

    let system = GuideSystem::from_config(cfg, sink)?;
    let dt = cfg.control.dt();
    let duration = args.duration.unwrap_or(cfg.control.duration_sec);
    let total_cycles = (duration / dt).ceil() as u64;

    let start = system
        .manager()
        .model(MechanismTarget::Index(0))
        .map(|(_, m)| m.position_at(0.0))?;
    let mut robot = SimRobot::new(start);
    let mut operator = SimOperator {
        target_phase: 0.0,
        speed: cfg.mechanism.phase_dot_ref,
        pushing: true,
    };
    let mut rng = rand::rng();

    let mut pending_insert = match &args.insert_samples {
        Some(path) => {
            let samples = read_matrix(path)?;
            info!(path = %path.display(), rows = samples.nrows(), "submitting demonstration");
            Some(system.insert(InsertSource::Samples(samples))?)
        }
        None => None,
    };

    // clear once the robot is known to be free
    system.set_collision_detected(false);

    info!(rate_hz = cfg.control.rate_hz, duration, "control loop started");
    let period = Duration::from_secs_f64(dt);
    let mut next_deadline = Instant::now();
    for _ in 0..total_cycles {
        if stop.load(Ordering::SeqCst) {
            info!("stop requested");
            break;
        }
        next_deadline += period;

        let f_op = operator.force(&mut rng, &system, &robot, dt);
        let force_applied = f_op.norm() > FORCE_APPLIED_TH;
        let f_guide = system.update(&robot.position, &robot.velocity, dt, force_applied, true);
        robot.step(&(f_op + f_guide), dt);

        poll_insert(&mut pending_insert);

        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        } else if now - next_deadline > period * 10 {
            debug!(behind_ms = (now - next_deadline).as_millis() as u64, "control loop overrun");
            next_deadline = now;
        }
    }

    let stats = system.stats();
    info!(
        cycles = stats.cycles,
        degenerate_cycles = stats.degenerate_cycles,
        count = system.count(),
        "control loop finished"
    );

    if let Some(dir) = &args.save_dir {
        let saved = save_all(&system, dir)?;
        info!(saved, dir = %dir.display(), "models saved");
    }

    // dropping the system closes the telemetry channel
    drop(system);
    if let Some(handle) = logger {
        let _ = handle.join();
    }
    Ok(())
}
