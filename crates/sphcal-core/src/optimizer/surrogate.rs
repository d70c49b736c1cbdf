//! The seam between the optimization driver and the model that proposes
//! candidates.

use crate::errors::CalResult;
use crate::models::TARGET_CEILING;

/// A black-box maximiser over a box-bounded search space.
///
/// Points are in the caller's coordinates, one value per dimension in the
/// order of [`Surrogate::bounds`].
pub trait Surrogate {
    fn bounds(&self) -> &[(f64, f64)];

    /// Record an evaluated point. `target` is finite.
    fn register(&mut self, point: &[f64], target: f64) -> CalResult<()>;

    /// Next point to evaluate.
    fn suggest(&mut self) -> CalResult<Vec<f64>>;

    /// Uniformly random point inside the bounds.
    fn sample_random(&mut self) -> Vec<f64>;

    /// Number of registered observations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize {
        self.bounds().len()
    }
}

/// Target value handed to a surrogate: infinities and anything above
/// [`TARGET_CEILING`] are capped there.
pub fn surrogate_target(target: f64) -> f64 {
    if target.is_nan() {
        return -TARGET_CEILING;
    }
    target.clamp(-TARGET_CEILING, TARGET_CEILING)
}
