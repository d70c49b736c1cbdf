//! Gaussian-process surrogate with an upper-confidence-bound acquisition.
//!
//! Inputs are mapped onto the unit cube before fitting so one isotropic
//! length scale serves every dimension. The acquisition is maximised by
//! random search followed by a few rounds of local refinement around the
//! best candidate; both stages are evaluated in parallel with rayon.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::errors::{CalResult, CalibrationError};
use crate::optimizer::surrogate::Surrogate;

/// Diagonal noise escalations tried before the fit is declared singular.
const JITTER_ATTEMPTS: usize = 6;
const REFINE_ROUNDS: usize = 4;
const REFINE_SAMPLES: usize = 64;
const REFINE_INITIAL_STEP: f64 = 0.1;

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Matern smoothness parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smoothness {
    /// nu = 0.5 (exponential kernel)
    Half,
    /// nu = 1.5
    ThreeHalves,
    /// nu = 2.5
    FiveHalves,
}

impl Smoothness {
    pub fn from_nu(nu: f64) -> CalResult<Self> {
        if nu == 0.5 {
            Ok(Smoothness::Half)
        } else if nu == 1.5 {
            Ok(Smoothness::ThreeHalves)
        } else if nu == 2.5 {
            Ok(Smoothness::FiveHalves)
        } else {
            Err(CalibrationError::Surrogate(format!(
                "unsupported Matern smoothness nu={nu}"
            )))
        }
    }

    /// Correlation at scaled distance `r` (distance / length scale).
    pub fn correlation(self, r: f64) -> f64 {
        match self {
            Smoothness::Half => (-r).exp(),
            Smoothness::ThreeHalves => {
                let s = 3f64.sqrt() * r;
                (1.0 + s) * (-s).exp()
            }
            Smoothness::FiveHalves => {
                let s = 5f64.sqrt() * r;
                (1.0 + s + s * s / 3.0) * (-s).exp()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpSettings {
    pub smoothness: Smoothness,
    pub length_scale: f64,
    /// Noise added to the kernel diagonal.
    pub alpha: f64,
    pub normalize_y: bool,
    pub kappa: f64,
    pub kappa_decay: f64,
    pub kappa_decay_delay: usize,
    pub acquisition_samples: usize,
    pub random_state: u64,
}

impl GpSettings {
    pub fn from_config(config: &OptimizerConfig) -> CalResult<Self> {
        Ok(Self {
            smoothness: Smoothness::from_nu(config.nu)?,
            length_scale: config.length_scale,
            alpha: config.alpha,
            normalize_y: config.normalize_y,
            kappa: config.kappa,
            kappa_decay: config.kappa_decay,
            kappa_decay_delay: config.kappa_decay_delay,
            acquisition_samples: config.acquisition_samples,
            random_state: config.random_state,
        })
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let distance = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt();
        self.smoothness.correlation(distance / self.length_scale)
    }
}

// ---------------------------------------------------------------------------
// Posterior
// ---------------------------------------------------------------------------

struct Posterior<'a> {
    settings: &'a GpSettings,
    inputs: &'a [Vec<f64>],
    cholesky: Cholesky<f64, Dyn>,
    weights: DVector<f64>,
    y_mean: f64,
    y_scale: f64,
}

impl<'a> Posterior<'a> {
    fn fit(settings: &'a GpSettings, inputs: &'a [Vec<f64>], targets: &[f64]) -> CalResult<Self> {
        let n = inputs.len();
        let (y_mean, y_scale) = if settings.normalize_y {
            let mean = targets.iter().sum::<f64>() / n as f64;
            let var = targets.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64;
            let std = var.sqrt();
            (mean, if std > 1e-12 { std } else { 1.0 })
        } else {
            (0.0, 1.0)
        };
        let y = DVector::from_iterator(n, targets.iter().map(|t| (t - y_mean) / y_scale));
        let gram = DMatrix::from_fn(n, n, |i, j| settings.kernel(&inputs[i], &inputs[j]));

        let mut noise = settings.alpha.max(1e-10);
        for _ in 0..JITTER_ATTEMPTS {
            let mut matrix = gram.clone();
            for i in 0..n {
                matrix[(i, i)] += noise;
            }
            if let Some(cholesky) = matrix.cholesky() {
                let weights = cholesky.solve(&y);
                return Ok(Self {
                    settings,
                    inputs,
                    cholesky,
                    weights,
                    y_mean,
                    y_scale,
                });
            }
            noise *= 10.0;
        }
        Err(CalibrationError::Surrogate(format!(
            "kernel matrix over {n} observations is not positive definite"
        )))
    }

    /// Posterior mean and standard deviation at unit-cube point `u`.
    fn predict(&self, u: &[f64]) -> (f64, f64) {
        let k_star = DVector::from_iterator(
            self.inputs.len(),
            self.inputs.iter().map(|x| self.settings.kernel(u, x)),
        );
        let mean = k_star.dot(&self.weights);
        let v = self.cholesky.solve(&k_star);
        let var = (1.0 - k_star.dot(&v)).max(0.0);
        (mean * self.y_scale + self.y_mean, var.sqrt() * self.y_scale)
    }

    fn upper_confidence_bound(&self, u: &[f64], kappa: f64) -> f64 {
        let (mean, std) = self.predict(u);
        mean + kappa * std
    }

    /// Best of `candidates` by UCB.
    fn best_of(&self, candidates: Vec<Vec<f64>>, kappa: f64) -> Option<(Vec<f64>, f64)> {
        candidates
            .into_par_iter()
            .map(|u| {
                let score = self.upper_confidence_bound(&u, kappa);
                (u, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

// ---------------------------------------------------------------------------
// Surrogate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GaussianProcessSurrogate {
    bounds: Vec<(f64, f64)>,
    settings: GpSettings,
    kappa: f64,
    suggestions: usize,
    /// Registered points, in unit-cube coordinates.
    inputs: Vec<Vec<f64>>,
    targets: Vec<f64>,
    rng: StdRng,
}

impl GaussianProcessSurrogate {
    pub fn new(bounds: Vec<(f64, f64)>, settings: GpSettings) -> CalResult<Self> {
        for (i, (lower, upper)) in bounds.iter().enumerate() {
            if !lower.is_finite() || !upper.is_finite() || lower > upper {
                return Err(CalibrationError::Surrogate(format!(
                    "dimension {i} has invalid bounds ({lower}, {upper})"
                )));
            }
        }
        if settings.length_scale <= 0.0 || !settings.length_scale.is_finite() {
            return Err(CalibrationError::Surrogate(format!(
                "length scale must be positive, got {}",
                settings.length_scale
            )));
        }
        Ok(Self {
            kappa: settings.kappa,
            suggestions: 0,
            inputs: Vec::new(),
            targets: Vec::new(),
            rng: StdRng::seed_from_u64(settings.random_state),
            bounds,
            settings,
        })
    }

    pub fn from_config(config: &OptimizerConfig, bounds: Vec<(f64, f64)>) -> CalResult<Self> {
        Self::new(bounds, GpSettings::from_config(config)?)
    }

    /// Current exploration weight.
    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    /// Posterior mean and standard deviation at `point`.
    pub fn predict(&self, point: &[f64]) -> CalResult<(f64, f64)> {
        if self.inputs.is_empty() {
            return Err(CalibrationError::Surrogate("no observations registered".into()));
        }
        let posterior = Posterior::fit(&self.settings, &self.inputs, &self.targets)?;
        Ok(posterior.predict(&self.to_unit(point)))
    }

    fn to_unit(&self, point: &[f64]) -> Vec<f64> {
        point
            .iter()
            .zip(&self.bounds)
            .map(|(&x, &(lower, upper))| {
                // halves keep (-MAX, MAX) bounds from overflowing
                let half_width = upper * 0.5 - lower * 0.5;
                if half_width <= 0.0 {
                    0.5
                } else {
                    ((x * 0.5 - lower * 0.5) / half_width).clamp(0.0, 1.0)
                }
            })
            .collect()
    }

    fn from_unit(&self, unit: &[f64]) -> Vec<f64> {
        unit.iter()
            .zip(&self.bounds)
            .map(|(&u, &(lower, upper))| (lower * (1.0 - u) + upper * u).clamp(lower, upper))
            .collect()
    }
}

fn random_unit(rng: &mut StdRng, dimension: usize) -> Vec<f64> {
    (0..dimension).map(|_| rng.gen::<f64>()).collect()
}

impl Surrogate for GaussianProcessSurrogate {
    fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    fn register(&mut self, point: &[f64], target: f64) -> CalResult<()> {
        if point.len() != self.bounds.len() {
            return Err(CalibrationError::LengthMismatch {
                expected: self.bounds.len(),
                actual: point.len(),
            });
        }
        if !target.is_finite() {
            return Err(CalibrationError::Surrogate(format!(
                "cannot register non-finite target {target}"
            )));
        }
        let unit = self.to_unit(point);
        self.inputs.push(unit);
        self.targets.push(target);
        Ok(())
    }

    fn suggest(&mut self) -> CalResult<Vec<f64>> {
        if self.inputs.is_empty() {
            return Ok(self.sample_random());
        }
        let dimension = self.bounds.len();
        let posterior = Posterior::fit(&self.settings, &self.inputs, &self.targets)?;

        let mut candidates: Vec<Vec<f64>> = (0..self.settings.acquisition_samples.max(1))
            .map(|_| random_unit(&mut self.rng, dimension))
            .collect();
        candidates.extend(self.inputs.iter().cloned());
        let (mut best, mut best_score) = posterior
            .best_of(candidates, self.kappa)
            .ok_or_else(|| CalibrationError::Surrogate("no acquisition candidates".into()))?;

        let mut step = REFINE_INITIAL_STEP;
        for _ in 0..REFINE_ROUNDS {
            let local: Vec<Vec<f64>> = (0..REFINE_SAMPLES)
                .map(|_| {
                    best.iter()
                        .map(|x| (x + self.rng.gen_range(-step..=step)).clamp(0.0, 1.0))
                        .collect()
                })
                .collect();
            if let Some((point, score)) = posterior.best_of(local, self.kappa) {
                if score > best_score {
                    best = point;
                    best_score = score;
                }
            }
            step *= 0.5;
        }
        debug!(kappa = self.kappa, acquisition = best_score, "surrogate suggestion");

        self.suggestions += 1;
        if self.suggestions > self.settings.kappa_decay_delay {
            self.kappa *= self.settings.kappa_decay;
        }
        Ok(self.from_unit(&best))
    }

    fn sample_random(&mut self) -> Vec<f64> {
        let unit = random_unit(&mut self.rng, self.bounds.len());
        self.from_unit(&unit)
    }

    fn len(&self) -> usize {
        self.targets.len()
    }
}
