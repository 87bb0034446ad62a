// Nonlinear least-squares fit of the planar model to measured samples
//
// Levenberg-Marquardt over [L1, L2, X0, Z0, shoulder_offset, elbow_offset]
// with a forward-difference Jacobian. Parameters are clamped to a physically
// sane box after every step.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::CalibrationParameters;
use crate::arm::kinematics::planar_forward;
use crate::config::FitOptions;
use crate::error::{ArmError, Result};

/// Lower/upper bounds, same order as the parameter vector
const LOWER: [f64; 6] = [50.0, 50.0, -300.0, -300.0, -1.5, -1.5];
const UPPER: [f64; 6] = [600.0, 600.0, 300.0, 300.0, 1.5, 1.5];

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;
const STEP_EPS: f64 = 1e-10;

/// Residuals below this are never treated as outliers (mm)
const OUTLIER_FLOOR_MM: f64 = 1.0;

/// Smallest/largest singular value ratio of JᵀJ before the fit counts as degenerate
const CONDITION_FLOOR: f64 = 1e-12;

/// One (shoulder, elbow) -> measured (x, z) observation at base ≈ 0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub shoulder: f64,
    pub elbow: f64,
    pub x: f64,
    pub z: f64,
}

impl CalibrationSample {
    fn is_finite(&self) -> bool {
        self.shoulder.is_finite() && self.elbow.is_finite() && self.x.is_finite() && self.z.is_finite()
    }
}

/// Outcome of a successful fit; the only input `CalibrationCell::publish` accepts
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    params: CalibrationParameters,
    rms: f64,
    iterations: usize,
    used: usize,
    rejected: usize,
}

impl FitReport {
    pub fn params(&self) -> &CalibrationParameters {
        &self.params
    }

    /// Residual RMS over the x and z components of the used samples (mm)
    pub fn rms(&self) -> f64 {
        self.rms
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn samples_used(&self) -> usize {
        self.used
    }

    /// Non-finite samples plus trimmed outliers
    pub fn samples_rejected(&self) -> usize {
        self.rejected
    }
}

/// Fit calibration parameters to `samples`
///
/// Fails with `ArmError::Fit` when too few usable samples remain, when the
/// samples do not constrain all six parameters, or when the final residual
/// RMS exceeds `options.max_rms_mm`. Failures are not retried.
pub fn fit(samples: &[CalibrationSample], options: &FitOptions) -> Result<FitReport> {
    let mut data: Vec<CalibrationSample> = samples.iter().copied().filter(|s| s.is_finite()).collect();
    let mut rejected = samples.len() - data.len();
    if rejected > 0 {
        warn!("Dropped {} non-finite samples", rejected);
    }

    if data.len() < options.min_samples {
        return Err(ArmError::Fit(format!(
            "need at least {} samples, have {}",
            options.min_samples,
            data.len()
        )));
    }

    let seed = clamp_params(options.seed);
    let (mut params, mut rms, mut iterations) = solve(&data, seed, options.max_iterations);

    if options.outlier_factor > 0.0 {
        let limit = (options.outlier_factor * rms).max(OUTLIER_FLOOR_MM);
        let kept: Vec<CalibrationSample> = data
            .iter()
            .copied()
            .filter(|s| sample_error(&params, s) <= limit)
            .collect();
        let trimmed = data.len() - kept.len();

        if trimmed > 0 && kept.len() >= options.min_samples {
            info!(
                "Trimming {} outliers above {:.3} mm and refitting",
                trimmed, limit
            );
            data = kept;
            rejected += trimmed;
            let (p, r, it) = solve(&data, params, options.max_iterations);
            params = p;
            rms = r;
            iterations += it;
        } else if trimmed > 0 {
            warn!(
                "{} samples exceed {:.3} mm but trimming would leave too few; keeping all",
                trimmed, limit
            );
        }
    }

    check_conditioning(&data, &params)?;

    if !(rms <= options.max_rms_mm) {
        return Err(ArmError::Fit(format!(
            "residual RMS {:.3} mm exceeds limit {:.3} mm",
            rms, options.max_rms_mm
        )));
    }

    let params = CalibrationParameters::from_array(params);
    params.validate()?;

    info!(
        "Fit converged: rms {:.4} mm, {} iterations, {} samples ({} rejected)",
        rms,
        iterations,
        data.len(),
        rejected
    );
    Ok(FitReport {
        params,
        rms,
        iterations,
        used: data.len(),
        rejected,
    })
}

/// Damped Gauss-Newton iterations; returns (params, rms, iterations)
fn solve(data: &[CalibrationSample], seed: [f64; 6], max_iterations: usize) -> ([f64; 6], f64, usize) {
    let mut p = seed;
    let mut r = residuals(&p, data);
    let mut cost = r.norm_squared();
    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        let j = jacobian(&p, data, &r);
        let jt = j.transpose();
        let jtj = &jt * &j;
        let g = &jt * &r;

        let mut accepted = None;
        while lambda <= LAMBDA_MAX {
            let mut damped = jtj.clone();
            for i in 0..6 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-9);
            }

            let Some(delta) = damped.lu().solve(&(-&g)) else {
                lambda *= 10.0;
                continue;
            };

            let mut candidate = p;
            for (k, value) in candidate.iter_mut().enumerate() {
                *value += delta[k];
            }
            let candidate = clamp_params(candidate);
            let r_candidate = residuals(&candidate, data);
            let cost_candidate = r_candidate.norm_squared();

            if cost_candidate < cost {
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                accepted = Some((candidate, r_candidate, cost_candidate));
                break;
            }
            lambda *= 10.0;
        }

        let Some((candidate, r_candidate, cost_candidate)) = accepted else {
            debug!("No further descent after {} iterations", iterations);
            break;
        };

        let step: f64 = candidate
            .iter()
            .zip(p.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        p = candidate;
        r = r_candidate;
        cost = cost_candidate;

        if step < STEP_EPS {
            break;
        }
    }

    let rms = (cost / r.len() as f64).sqrt();
    (p, rms, iterations)
}

fn residuals(p: &[f64; 6], data: &[CalibrationSample]) -> DVector<f64> {
    let params = CalibrationParameters::from_array(*p);
    let mut r = DVector::zeros(data.len() * 2);
    for (i, s) in data.iter().enumerate() {
        let (x, z) = planar_forward(&params, s.shoulder, s.elbow);
        r[2 * i] = x - s.x;
        r[2 * i + 1] = z - s.z;
    }
    r
}

fn jacobian(p: &[f64; 6], data: &[CalibrationSample], r: &DVector<f64>) -> DMatrix<f64> {
    let mut j = DMatrix::zeros(r.len(), 6);
    for k in 0..6 {
        let h = 1e-6 * p[k].abs().max(1.0);
        let mut shifted = *p;
        shifted[k] += h;
        let column = (residuals(&shifted, data) - r) / h;
        j.set_column(k, &column);
    }
    j
}

fn sample_error(p: &[f64; 6], s: &CalibrationSample) -> f64 {
    let (x, z) = planar_forward(&CalibrationParameters::from_array(*p), s.shoulder, s.elbow);
    (x - s.x).hypot(z - s.z)
}

fn clamp_params(mut p: [f64; 6]) -> [f64; 6] {
    for k in 0..6 {
        p[k] = p[k].clamp(LOWER[k], UPPER[k]);
    }
    p
}

fn check_conditioning(data: &[CalibrationSample], p: &[f64; 6]) -> Result<()> {
    let r = residuals(p, data);
    let j = jacobian(p, data, &r);
    let jtj = j.transpose() * &j;
    let singular = jtj.singular_values();
    let max = singular.max();
    let min = singular.min();

    if !(max > 0.0) || min / max < CONDITION_FLOOR {
        return Err(ArmError::Fit(format!(
            "samples do not constrain all six parameters (condition {:.3e})",
            if max > 0.0 { min / max } else { 0.0 }
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Noise-free 5×5 grid generated from the reference parameters
    pub(crate) fn synthetic_samples() -> Vec<CalibrationSample> {
        let truth = CalibrationParameters::reference();
        let mut samples = Vec::new();
        for &shoulder in &[-0.6, -0.3, 0.0, 0.3, 0.6] {
            for &elbow in &[0.3, 0.6, 1.0, 1.4, 1.8] {
                let (x, z) = planar_forward(&truth, shoulder, elbow);
                samples.push(CalibrationSample {
                    shoulder,
                    elbow,
                    x,
                    z,
                });
            }
        }
        samples
    }

    fn assert_recovers_reference(report: &FitReport) {
        let truth = CalibrationParameters::reference();
        let got = report.params();
        assert_abs_diff_eq!(got.l1, truth.l1, epsilon = 1e-3);
        assert_abs_diff_eq!(got.l2, truth.l2, epsilon = 1e-3);
        assert_abs_diff_eq!(got.x0, truth.x0, epsilon = 1e-3);
        assert_abs_diff_eq!(got.z0, truth.z0, epsilon = 1e-3);
        assert_abs_diff_eq!(got.shoulder_offset, truth.shoulder_offset, epsilon = 1e-5);
        assert_abs_diff_eq!(got.elbow_offset, truth.elbow_offset, epsilon = 1e-5);
    }

    #[test]
    fn test_recovers_reference_parameters() {
        let report = fit(&synthetic_samples(), &FitOptions::default()).unwrap();
        assert_recovers_reference(&report);
        assert!(report.rms() < 1e-6);
        assert_eq!(report.samples_used(), 25);
        assert_eq!(report.samples_rejected(), 0);
    }

    #[test]
    fn test_recovers_from_offset_seed() {
        let options = FitOptions {
            seed: [236.0, 320.0, 55.0, 0.0, 0.0, 0.0],
            ..FitOptions::default()
        };
        let report = fit(&synthetic_samples(), &options).unwrap();
        assert_recovers_reference(&report);
    }

    #[test]
    fn test_too_few_samples() {
        let samples = synthetic_samples();
        let err = fit(&samples[..5], &FitOptions::default()).unwrap_err();
        assert!(matches!(err, ArmError::Fit(_)));
    }

    #[test]
    fn test_non_finite_samples_are_dropped() {
        let mut samples = synthetic_samples();
        samples.push(CalibrationSample {
            shoulder: 0.1,
            elbow: f64::NAN,
            x: 1.0,
            z: 1.0,
        });
        let report = fit(&samples, &FitOptions::default()).unwrap();
        assert_eq!(report.samples_used(), 25);
        assert_eq!(report.samples_rejected(), 1);
        assert_recovers_reference(&report);
    }

    #[test]
    fn test_single_outlier_is_trimmed() {
        let mut samples = synthetic_samples();
        samples[7].z += 40.0;
        let report = fit(&samples, &FitOptions::default()).unwrap();
        assert_eq!(report.samples_rejected(), 1);
        assert_eq!(report.samples_used(), 24);
        assert_recovers_reference(&report);
    }

    #[test]
    fn test_rms_limit_rejects_noisy_fit() {
        let mut samples = synthetic_samples();
        for (i, s) in samples.iter_mut().enumerate() {
            s.z += if i % 2 == 0 { 3.0 } else { -3.0 };
            s.x += if i % 3 == 0 { 3.0 } else { -2.0 };
        }
        let options = FitOptions {
            max_rms_mm: 0.5,
            outlier_factor: 0.0,
            ..FitOptions::default()
        };
        let err = fit(&samples, &options).unwrap_err();
        assert!(matches!(err, ArmError::Fit(_)), "got {:?}", err);
    }

    #[test]
    fn test_identical_samples_are_degenerate() {
        let one = synthetic_samples()[12];
        let samples = vec![one; 12];
        let err = fit(&samples, &FitOptions::default()).unwrap_err();
        assert!(matches!(err, ArmError::Fit(_)), "got {:?}", err);
    }
}
