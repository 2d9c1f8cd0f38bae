//! Motion model consumed by the virtual mechanisms.
//!
//! A trajectory is a chain of knots `(phase, mean, variance)`; between knots the mean is linearly
//! interpolated. The likelihood of a position is the equal-weight mixture of isotropic Gaussians
//! centred on the knots, which is what a GMR fit over `(phase, position)` reduces to once the
//! components are ordered along the path.

use std::f64::consts::PI;
use std::path::Path;

use nalgebra::{DMatrix, DVector};

use crate::core::textio;
use crate::error::ModelError;

const MIN_SEGMENT_LEN2: f64 = 1e-18;

/// Parameters for fitting a model from raw demonstrations.
#[derive(Clone, Copy, Debug)]
pub struct FitParams {
    pub knots: usize,
    pub min_variance: f64,
    pub crop_dt: f64,
    pub crop_dist_min: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            knots: 50,
            min_variance: 1e-4,
            crop_dt: 0.1,
            crop_dist_min: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryModel {
    phases: Vec<f64>,
    means: Vec<DVector<f64>>,
    variances: Vec<f64>,
    dim: usize,
}

impl TrajectoryModel {
    /// Build a model from explicit knots. Phases must be strictly increasing within `[0, 1]`.
    pub fn from_knots(
        phases: Vec<f64>,
        means: Vec<DVector<f64>>,
        variances: Vec<f64>,
    ) -> Result<Self, ModelError> {
        let n = phases.len();
        if n < 2 {
            return Err(ModelError::TooFewKnots(n));
        }
        if means.len() != n || variances.len() != n {
            return Err(ModelError::KnotCountMismatch {
                phases: n,
                means: means.len(),
                variances: variances.len(),
            });
        }
        let dim = means[0].len();
        for (i, m) in means.iter().enumerate() {
            if m.len() != dim {
                return Err(ModelError::DimensionMismatch {
                    expected: dim,
                    found: m.len(),
                });
            }
            if i > 0 && !(phases[i] > phases[i - 1]) {
                return Err(ModelError::NonMonotonicPhase(i));
            }
            if !(variances[i].is_finite() && variances[i] > 0.0) {
                return Err(ModelError::InvalidVariance(i));
            }
        }
        let (first, last) = (phases[0], phases[n - 1]);
        if !(first >= 0.0 && last <= 1.0) {
            return Err(ModelError::PhaseOutOfRange { first, last });
        }
        Ok(Self {
            phases,
            means,
            variances,
            dim,
        })
    }

    /// Evenly spaced knots over `[0, 1]` with a shared variance.
    pub fn from_points(points: Vec<DVector<f64>>, variance: f64) -> Result<Self, ModelError> {
        let n = points.len();
        if n < 2 {
            return Err(ModelError::TooFewKnots(n));
        }
        let phases = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
        Self::from_knots(phases, points, vec![variance; n])
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let m = textio::read_matrix(path)?;
        if m.ncols() < 3 {
            return Err(ModelError::Parse {
                path: path.to_path_buf(),
                line: 1,
                reason: format!("expected `phase p_1..p_d variance`, found {} columns", m.ncols()),
            });
        }
        let dim = m.ncols() - 2;
        let phases = m.column(0).iter().copied().collect();
        let means = (0..m.nrows())
            .map(|r| DVector::from_iterator(dim, (1..=dim).map(|c| m[(r, c)])))
            .collect();
        let variances = m.column(dim + 1).iter().copied().collect();
        Self::from_knots(phases, means, variances)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        textio::write_matrix(
            path,
            &self.to_matrix(),
            Some(&format!("knots={} dim={}\nphase position... variance", self.len(), self.dim)),
        )
    }

    pub fn to_matrix(&self) -> DMatrix<f64> {
        let n = self.len();
        DMatrix::from_fn(n, self.dim + 2, |r, c| {
            if c == 0 {
                self.phases[r]
            } else if c <= self.dim {
                self.means[r][c - 1]
            } else {
                self.variances[r]
            }
        })
    }

    /// Fit a model from demonstrated samples (rows are time steps).
    pub fn fit(samples: &DMatrix<f64>, params: &FitParams) -> Result<Self, ModelError> {
        let cropped = textio::crop_samples(samples, params.crop_dt, params.crop_dist_min)
            .ok_or(ModelError::NotEnoughSamples)?;
        let dim = cropped.ncols();
        let points: Vec<DVector<f64>> = (0..cropped.nrows())
            .map(|r| cropped.row(r).transpose())
            .collect();

        // cumulative arc length
        let mut arc = Vec::with_capacity(points.len());
        arc.push(0.0);
        for w in points.windows(2) {
            let last = *arc.last().unwrap_or(&0.0);
            arc.push(last + (&w[1] - &w[0]).norm());
        }
        let total = *arc.last().unwrap_or(&0.0);
        if !(total > 0.0) {
            return Err(ModelError::NotEnoughSamples);
        }

        let n_knots = params.knots.max(2);
        let mut means = Vec::with_capacity(n_knots);
        let mut seg = 0usize;
        for k in 0..n_knots {
            let target = total * k as f64 / (n_knots - 1) as f64;
            while seg + 2 < arc.len() && arc[seg + 1] < target {
                seg += 1;
            }
            let span = arc[seg + 1] - arc[seg];
            let t = if span > 0.0 {
                ((target - arc[seg]) / span).clamp(0.0, 1.0)
            } else {
                0.0
            };
            means.push(&points[seg] + (&points[seg + 1] - &points[seg]) * t);
        }

        let phases: Vec<f64> = (0..n_knots)
            .map(|k| k as f64 / (n_knots - 1) as f64)
            .collect();
        let floor = params.min_variance.max(f64::MIN_POSITIVE);
        let mut model = Self::from_knots(phases, means, vec![floor; n_knots])?;

        // residual variance per knot, pooled from the raw samples that project closest to it
        let mut acc = vec![0.0; n_knots];
        let mut cnt = vec![0usize; n_knots];
        for p in &points {
            let (phase, dist) = model.closest(p);
            let k = (phase * (n_knots - 1) as f64).round() as usize;
            acc[k] += dist * dist / dim as f64;
            cnt[k] += 1;
        }
        for k in 0..n_knots {
            if cnt[k] > 0 {
                model.variances[k] = (acc[k] / cnt[k] as f64).max(floor);
            }
        }
        Ok(model)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    fn segment(&self, phase: f64) -> (usize, f64) {
        let n = self.phases.len();
        let s = phase.clamp(self.phases[0], self.phases[n - 1]);
        let i = match self.phases.partition_point(|&p| p <= s) {
            0 => 0,
            k => (k - 1).min(n - 2),
        };
        let span = self.phases[i + 1] - self.phases[i];
        (i, ((s - self.phases[i]) / span).clamp(0.0, 1.0))
    }

    pub fn position_at(&self, phase: f64) -> DVector<f64> {
        let (i, t) = self.segment(phase);
        &self.means[i] + (&self.means[i + 1] - &self.means[i]) * t
    }

    /// Derivative of the interpolated mean with respect to phase.
    pub fn tangent_at(&self, phase: f64) -> DVector<f64> {
        let (i, _) = self.segment(phase);
        let span = self.phases[i + 1] - self.phases[i];
        (&self.means[i + 1] - &self.means[i]) / span
    }

    pub fn variance_at(&self, phase: f64) -> f64 {
        let (i, t) = self.segment(phase);
        self.variances[i] + (self.variances[i + 1] - self.variances[i]) * t
    }

    /// Orthogonal projection onto the trajectory: `(phase, distance)` of the closest point.
    pub fn closest(&self, position: &DVector<f64>) -> (f64, f64) {
        let mut best_phase = self.phases[0];
        let mut best_d2 = f64::INFINITY;
        for i in 0..self.len() - 1 {
            let a = &self.means[i];
            let ab = &self.means[i + 1] - a;
            let len2 = ab.norm_squared();
            let t = if len2 > MIN_SEGMENT_LEN2 {
                ((position - a).dot(&ab) / len2).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let d2 = (a + &ab * t - position).norm_squared();
            if d2 < best_d2 {
                best_d2 = d2;
                best_phase = self.phases[i] + (self.phases[i + 1] - self.phases[i]) * t;
            }
        }
        (best_phase, best_d2.sqrt())
    }

    pub fn distance(&self, position: &DVector<f64>) -> f64 {
        self.closest(position).1
    }

    /// Mixture likelihood of `position` under the knot Gaussians.
    pub fn probability(&self, position: &DVector<f64>) -> f64 {
        let d = self.dim as f64;
        let sum: f64 = self
            .means
            .iter()
            .zip(&self.variances)
            .map(|(mu, &var)| {
                let norm = (2.0 * PI * var).powf(-0.5 * d);
                norm * (-(position - mu).norm_squared() / (2.0 * var)).exp()
            })
            .sum();
        sum / self.len() as f64
    }
}
