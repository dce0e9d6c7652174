// field_model.rs — forward magnetic model for the jaw-mounted magnet.
//
// Computes the flux density a cuboid permanent magnet produces at the
// magnetometer, given the relative pose. Pure functions only; the EKF and
// the measurement synthesizer both call into this module, which is what
// keeps them consistent with each other.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::types::Pose;

const MU0_OVER_4PI: f64 = 1e-7;

/// Immutable physical description of the magnet.
///
/// Defaults to the N35 magnet from the prototype: 5 mm x 5 mm x 2 mm,
/// magnetized along z at 955 000 A/m (~1.2 T remanence).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CuboidMagnet {
    /// Remanent magnetization vector [A/m], magnet frame
    pub magnetization: Vector3<f64>,
    /// Edge lengths [m]
    pub dimensions: Vector3<f64>,
    /// Minimum sensor-magnet separation the model evaluates at [m]
    pub clamp_radius: f64,
}

impl CuboidMagnet {
    pub fn new(magnetization: Vector3<f64>, dimensions: Vector3<f64>, clamp_radius: f64) -> Self {
        CuboidMagnet {
            magnetization,
            dimensions,
            clamp_radius,
        }
    }

    /// Flux density at the sensor origin for a magnet at `pose`.
    ///
    /// Returns the field vector in tesla and a flag that is set when the
    /// separation fell inside `clamp_radius` and the field was evaluated at
    /// the clamped distance instead. The caller must treat a flagged sample
    /// as physically invalid for estimation purposes; the value itself is
    /// always finite.
    pub fn field_at(&self, pose: &Pose) -> (Vector3<f64>, bool) {
        // Field point in the magnet's local frame: sensor minus magnet.
        let mut local = -pose.position;
        if let Some(q) = &pose.orientation {
            local = q.inverse_transform_vector(&local);
        }

        let mut clamped = false;
        let dist = local.norm();
        if dist < self.clamp_radius {
            clamped = true;
            local = if dist > 1e-12 {
                local * (self.clamp_radius / dist)
            } else {
                // Zero separation: evaluate directly below the magnet.
                Vector3::new(0.0, 0.0, -self.clamp_radius)
            };
        }

        let mut b = cuboid_field(&local, &self.magnetization, &self.dimensions);
        if let Some(q) = &pose.orientation {
            b = q.transform_vector(&b);
        }
        (b, clamped)
    }

    /// Central-difference Jacobian of the field w.r.t. magnet position,
    /// evaluated about `pose` [T/m].
    ///
    /// Returns `None` when any probe point lands on the clamp boundary; a
    /// Jacobian taken across the clamp is degenerate and must not be used
    /// to linearize a measurement update.
    pub fn field_jacobian(&self, pose: &Pose, step: f64) -> Option<Matrix3<f64>> {
        let mut jac = Matrix3::zeros();
        for axis in 0..3 {
            let mut hi = pose.clone();
            let mut lo = pose.clone();
            hi.position[axis] += step;
            lo.position[axis] -= step;
            let (b_hi, c_hi) = self.field_at(&hi);
            let (b_lo, c_lo) = self.field_at(&lo);
            if c_hi || c_lo {
                return None;
            }
            let col = (b_hi - b_lo) / (2.0 * step);
            jac.set_column(axis, &col);
        }
        Some(jac)
    }
}

/// Analytic flux density of a uniformly z-magnetized cuboid.
///
/// Closed form via the equivalent surface-charge model (Engel-Herbert &
/// Hesjedal): log terms for the in-plane components, arctangent terms for
/// the axial component. `r` is the field point relative to the magnet
/// center, `dims` the full edge lengths.
fn cuboid_field(r: &Vector3<f64>, magnetization: &Vector3<f64>, dims: &Vector3<f64>) -> Vector3<f64> {
    // Only the z component of M contributes in the magnet frame; the
    // prototype magnet is axially magnetized.
    let m = magnetization.z;
    let (a, b, c) = (dims.x / 2.0, dims.y / 2.0, dims.z / 2.0);

    let u = [r.x + a, r.x - a];
    let v = [r.y + b, r.y - b];
    let w = [r.z + c, r.z - c];

    let mut bx = 0.0;
    let mut by = 0.0;
    let mut bz = 0.0;
    for (k, &uk) in u.iter().enumerate() {
        for (l, &vl) in v.iter().enumerate() {
            for (mm, &wm) in w.iter().enumerate() {
                let sign = if (k + l + mm) % 2 == 0 { 1.0 } else { -1.0 };
                let rr = (uk * uk + vl * vl + wm * wm).sqrt();
                // ln arguments vanish only on the magnet's edges, which the
                // clamp keeps us away from; the floor guards round-off.
                bx += sign * (vl + rr).max(1e-18).ln();
                by += sign * (uk + rr).max(1e-18).ln();
                bz -= sign * (uk * vl).atan2(wm * rr);
            }
        }
    }

    Vector3::new(bx, by, bz) * (MU0_OVER_4PI * m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use approx::assert_relative_eq;

    fn magnet() -> CuboidMagnet {
        let cfg = SessionConfig::default();
        CuboidMagnet::new(cfg.magnetization, cfg.magnet_dimensions, cfg.clamp_radius)
    }

    #[test]
    fn monotonic_falloff_with_separation() {
        let magnet = magnet();
        for &lateral in &[0.0, 0.002, 0.005] {
            let mut last = f64::INFINITY;
            for i in 0..40 {
                let z = 0.005 + 0.001 * i as f64;
                let (b, clamped) = magnet.field_at(&Pose::at(lateral, 0.0, z));
                assert!(!clamped);
                let mag = b.norm();
                assert!(
                    mag < last,
                    "magnitude did not fall off at z={z} lateral={lateral}"
                );
                last = mag;
            }
        }
    }

    #[test]
    fn matches_dipole_in_far_field() {
        let magnet = magnet();
        let z = 0.1;
        let (b, _) = magnet.field_at(&Pose::at(0.0, 0.0, z));
        let volume = 0.005 * 0.005 * 0.002;
        let moment = 955_000.0 * volume;
        // On-axis dipole field: mu0 * m / (2 pi z^3)
        let expected = 2.0 * MU0_OVER_4PI * moment / (z * z * z);
        assert_relative_eq!(b.z, expected, max_relative = 0.01);
        assert!(b.x.abs() < 1e-12);
        assert!(b.y.abs() < 1e-12);
    }

    #[test]
    fn axial_field_is_positive_below_magnet() {
        let magnet = magnet();
        let (b, _) = magnet.field_at(&Pose::at(0.0, 0.0, 0.01));
        assert!(b.z > 0.0);
    }

    #[test]
    fn lateral_antisymmetry() {
        let magnet = magnet();
        let (b_pos, _) = magnet.field_at(&Pose::at(0.004, 0.0, 0.01));
        let (b_neg, _) = magnet.field_at(&Pose::at(-0.004, 0.0, 0.01));
        assert_relative_eq!(b_pos.x, -b_neg.x, max_relative = 1e-9);
        assert_relative_eq!(b_pos.z, b_neg.z, max_relative = 1e-9);
    }

    #[test]
    fn clamp_flags_and_stays_finite() {
        let magnet = magnet();
        let (b_clamped, clamped) = magnet.field_at(&Pose::at(0.0, 0.0, 0.001));
        assert!(clamped);
        assert!(b_clamped.iter().all(|c| c.is_finite()));

        // Clamped output equals the field at the clamp radius itself.
        let (b_at_clamp, _) = magnet.field_at(&Pose::at(0.0, 0.0, magnet.clamp_radius));
        assert_relative_eq!(b_clamped.z, b_at_clamp.z, max_relative = 1e-9);
    }

    #[test]
    fn pure_function_is_repeatable() {
        let magnet = magnet();
        let pose = Pose::at(0.003, -0.002, 0.009);
        let (b1, _) = magnet.field_at(&pose);
        let (b2, _) = magnet.field_at(&pose);
        assert_eq!(b1, b2);
    }

    #[test]
    fn jacobian_matches_forward_differences() {
        let magnet = magnet();
        let pose = Pose::at(0.002, 0.001, 0.01);
        let jac = magnet.field_jacobian(&pose, 1e-6).unwrap();

        // dBz/dz should be strongly negative: field decays with separation.
        assert!(jac[(2, 2)] < 0.0);

        // Cross-check one column against a coarser finite difference.
        let (b0, _) = magnet.field_at(&pose);
        let (b1, _) = magnet.field_at(&Pose::at(0.002, 0.001, 0.01 + 1e-5));
        let approx_col = (b1 - b0) / 1e-5;
        assert_relative_eq!(jac[(2, 2)], approx_col.z, max_relative = 0.01);
    }

    #[test]
    fn jacobian_degenerate_at_clamp_boundary() {
        let magnet = magnet();
        let pose = Pose::at(0.0, 0.0, magnet.clamp_radius);
        assert!(magnet.field_jacobian(&pose, 1e-6).is_none());
    }
}
