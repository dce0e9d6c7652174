// calibration.rs — magnetometer hard-iron / soft-iron correction.
//
// Fitted once from a rotation sweep taken with the magnet far away, then
// applied per reading. Also carries the reference-pose baseline used to
// express readings as deltas from a captured rest position.

use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("not enough samples for calibration: got {got}, need {need}")]
    NotEnoughSamples { got: usize, need: usize },

    #[error("ellipsoid fit is degenerate: {0}")]
    DegenerateFit(String),
}

const MIN_FIT_SAMPLES: usize = 50;

/// Hard-iron offset plus soft-iron correction matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MagCalibration {
    pub offset: Vector3<f64>,
    pub matrix: Matrix3<f64>,
}

impl MagCalibration {
    /// Fit from raw readings collected while rotating the sensor through
    /// all orientations. Hard-iron is the per-axis min/max midpoint;
    /// soft-iron comes from a least-squares ellipsoid fit of the centered
    /// cloud, symmetrized through its eigendecomposition.
    pub fn fit(samples: &[Vector3<f64>]) -> Result<Self, CalibrationError> {
        if samples.len() < MIN_FIT_SAMPLES {
            return Err(CalibrationError::NotEnoughSamples {
                got: samples.len(),
                need: MIN_FIT_SAMPLES,
            });
        }

        let mut min = Vector3::repeat(f64::INFINITY);
        let mut max = Vector3::repeat(f64::NEG_INFINITY);
        for s in samples {
            for i in 0..3 {
                min[i] = min[i].min(s[i]);
                max[i] = max[i].max(s[i]);
            }
        }
        let offset = (max + min) / 2.0;

        // Solve D v = 1 for the quadric x'Mx = 1 over the centered cloud.
        let n = samples.len();
        let mut d = DMatrix::<f64>::zeros(n, 6);
        for (row, s) in samples.iter().enumerate() {
            let c = s - offset;
            d[(row, 0)] = c.x * c.x;
            d[(row, 1)] = c.y * c.y;
            d[(row, 2)] = c.z * c.z;
            d[(row, 3)] = 2.0 * c.x * c.y;
            d[(row, 4)] = 2.0 * c.x * c.z;
            d[(row, 5)] = 2.0 * c.y * c.z;
        }
        let rhs = DVector::<f64>::from_element(n, 1.0);
        let svd = d.svd(true, true);
        let v = svd
            .solve(&rhs, 1e-12)
            .map_err(|e| CalibrationError::DegenerateFit(e.to_string()))?;

        let m = Matrix3::new(v[0], v[3], v[4], v[3], v[1], v[5], v[4], v[5], v[2]);
        let eig = SymmetricEigen::new(m);
        if eig.eigenvalues.iter().any(|&e| e <= 0.0) {
            return Err(CalibrationError::DegenerateFit(
                "quadric is not an ellipsoid".into(),
            ));
        }

        // matrix = Q * sqrt(L) * Q^T maps the ellipsoid onto a unit sphere
        let sqrt_l = Matrix3::from_diagonal(&eig.eigenvalues.map(f64::sqrt));
        let matrix = eig.eigenvectors * sqrt_l * eig.eigenvectors.transpose();

        Ok(MagCalibration { offset, matrix })
    }

    /// Identity calibration for sensors calibrated upstream.
    pub fn identity() -> Self {
        MagCalibration {
            offset: Vector3::zeros(),
            matrix: Matrix3::identity(),
        }
    }

    pub fn apply(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * (raw - self.offset)
    }
}

/// Reference field captured with the jaw held at a rest pose; live readings
/// are reported as deltas against it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldBaseline {
    pub reference: Vector3<f64>,
    pub sample_count: usize,
}

impl FieldBaseline {
    pub fn capture(readings: &[Vector3<f64>]) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = readings.iter().sum();
        Some(FieldBaseline {
            reference: sum / readings.len() as f64,
            sample_count: readings.len(),
        })
    }

    pub fn delta(&self, reading: &Vector3<f64>) -> Vector3<f64> {
        reading - self.reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Roughly uniform directions via a fibonacci sphere.
    fn sphere_directions(n: usize) -> Vec<Vector3<f64>> {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        (0..n)
            .map(|i| {
                let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - y * y).sqrt();
                let theta = golden * i as f64;
                Vector3::new(r * theta.cos(), y, r * theta.sin())
            })
            .collect()
    }

    fn distorted_cloud() -> (Vec<Vector3<f64>>, Vector3<f64>) {
        let offset = Vector3::new(12.0, -7.5, 3.0);
        let scale = Vector3::new(2.0, 1.0, 0.5);
        let raw = sphere_directions(400)
            .into_iter()
            .map(|u| Vector3::new(u.x * scale.x, u.y * scale.y, u.z * scale.z) + offset)
            .collect();
        (raw, offset)
    }

    #[test]
    fn recovers_hard_iron_offset() {
        let (raw, offset) = distorted_cloud();
        let cal = MagCalibration::fit(&raw).unwrap();
        assert_relative_eq!(cal.offset.x, offset.x, epsilon = 0.05);
        assert_relative_eq!(cal.offset.y, offset.y, epsilon = 0.05);
        assert_relative_eq!(cal.offset.z, offset.z, epsilon = 0.05);
    }

    #[test]
    fn calibrated_cloud_is_spherical() {
        let (raw, _) = distorted_cloud();
        let cal = MagCalibration::fit(&raw).unwrap();

        let norms: Vec<f64> = raw.iter().map(|s| cal.apply(s).norm()).collect();
        let mean = norms.iter().sum::<f64>() / norms.len() as f64;
        for n in &norms {
            assert!((n - mean).abs() / mean < 0.05, "norm {n} vs mean {mean}");
        }

        // Raw cloud is badly anisotropic by construction; 4:1 axis ratio.
        assert!(mean > 0.0);
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let raw = sphere_directions(10);
        match MagCalibration::fit(&raw) {
            Err(CalibrationError::NotEnoughSamples { got: 10, need }) => {
                assert_eq!(need, MIN_FIT_SAMPLES)
            }
            other => panic!("expected NotEnoughSamples, got {other:?}"),
        }
    }

    #[test]
    fn identity_passes_readings_through() {
        let cal = MagCalibration::identity();
        let v = Vector3::new(1.0, -2.0, 3.0);
        assert_eq!(cal.apply(&v), v);
    }

    #[test]
    fn baseline_delta_tracks_changes() {
        let still = vec![Vector3::new(1.0, 1.0, 1.0); 20];
        let baseline = FieldBaseline::capture(&still).unwrap();
        assert_eq!(baseline.sample_count, 20);

        let moved = Vector3::new(1.5, 1.0, 0.5);
        let delta = baseline.delta(&moved);
        assert_relative_eq!(delta.x, 0.5);
        assert_relative_eq!(delta.z, -0.5);

        assert!(FieldBaseline::capture(&[]).is_none());
    }
}
