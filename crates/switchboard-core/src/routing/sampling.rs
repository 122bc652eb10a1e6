//! Beta and Gamma sampling
//!
//! Thompson sampling needs one draw from each arm's Beta posterior. A Beta
//! sample is built from two Gamma draws, `X / (X + Y)` with
//! `X ~ Gamma(alpha, 1)` and `Y ~ Gamma(beta, 1)`.
//!
//! Gamma draws use the Marsaglia–Tsang squeeze-and-reject method. Shapes below
//! one are boosted to `k + 1` and scaled back by `U^(1/k)`. The normal
//! variates feeding it come from a Box–Muller transform.
//!
//! All functions take the random source as a parameter so callers can seed it.

use rand::Rng;

use super::types::{DEFAULT_ALPHA, DEFAULT_BETA, valid_shape};

/// Uniform sample in `(0, 1]`
fn open_unit<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    1.0 - rng.r#gen::<f64>()
}

/// Standard normal sample via Box–Muller
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1 = open_unit(rng);
    let u2 = open_unit(rng);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Sample from `Gamma(shape, 1)`
///
/// A non-finite or non-positive shape is treated as `1.0`.
pub fn sample_gamma<R: Rng + ?Sized>(shape: f64, rng: &mut R) -> f64 {
    let shape = valid_shape(shape).unwrap_or(1.0);

    if shape < 1.0 {
        let u = open_unit(rng);
        return sample_gamma(shape + 1.0, rng) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        let (x, v) = loop {
            let x = standard_normal(rng);
            let v = 1.0 + c * x;
            if v > 0.0 {
                break (x, v);
            }
        };

        let v = v * v * v;
        let u = open_unit(rng);
        let x2 = x * x;

        if u < 1.0 - 0.0331 * x2 * x2 {
            return d * v;
        }
        if u.ln() < 0.5 * x2 + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

/// Sample from `Beta(alpha, beta)`, always in `[0, 1]`
///
/// Invalid parameters fall back to the uniform prior. If both Gamma draws
/// underflow, the distribution mean is returned.
pub fn sample_beta<R: Rng + ?Sized>(alpha: f64, beta: f64, rng: &mut R) -> f64 {
    let alpha = valid_shape(alpha).unwrap_or(DEFAULT_ALPHA);
    let beta = valid_shape(beta).unwrap_or(DEFAULT_BETA);

    let x = sample_gamma(alpha, rng);
    let y = sample_gamma(beta, rng);
    let total = x + y;

    if !total.is_finite() || total <= 0.0 {
        return alpha / (alpha + beta);
    }
    (x / total).clamp(0.0, 1.0)
}
