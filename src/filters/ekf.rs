use nalgebra::{Matrix3, Vector3};
use ndarray::{arr1, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::field_model::CuboidMagnet;
use crate::types::{FieldSample, ImuSample, Pose};

const G: f64 = 9.81;

/// Snapshot of the filter belief after a step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JawEkfState {
    /// Estimated magnet position in the sensor frame [m]
    pub position: (f64, f64, f64),

    /// Estimated magnet velocity [m/s]
    pub velocity: (f64, f64, f64),

    /// Covariance trace for uncertainty
    pub covariance_trace: f64,

    /// Update counters
    pub field_updates: u64,
    pub skipped_corrections: u64,
    pub predict_steps: u64,
}

/// Why a correction step was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Measurement or linearization point sat on the clamp boundary
    SkippedClamped,
    /// Innovation covariance was not invertible
    SkippedSingular,
    /// Joseph update produced a non-PSD covariance; state was reverted
    SkippedNonPsd,
    /// Innovation far exceeded the measured magnitude; the linearization
    /// point is badly wrong and the correction would catapult the mean
    SkippedOutlier,
}

/// Extended Kalman filter over magnet position and velocity.
///
/// State layout: [px py pz vx vy vz], constant-velocity process model.
/// The nonlinear field measurement is linearized numerically through the
/// forward model's Jacobian, so the filter stays independent of any one
/// field formulation — tests substitute a simplified magnet freely.
pub struct JawEkf {
    /// Nominal time step [s]
    pub dt: f64,

    /// State vector [6]
    pub state: Array1<f64>,

    /// Covariance matrix [6x6]
    pub covariance: Array2<f64>,

    /// Process noise matrix [6x6]
    pub process_noise: Array2<f64>,

    magnet: CuboidMagnet,

    /// Magnetometer measurement noise [T²]
    r_mag: f64,

    jacobian_step: f64,
    min_separation: f64,

    innovation_gate: f64,
    max_correction_step: f64,
    workspace_radius: f64,
    max_speed: f64,

    initial_position: Vector3<f64>,
    initial_pos_var: f64,
    initial_vel_var: f64,

    divergence_threshold: u64,
    consecutive_skips: u64,

    field_updates: u64,
    skipped_corrections: u64,
    predict_steps: u64,
}

impl JawEkf {
    pub fn new(config: &SessionConfig) -> Self {
        let magnet = CuboidMagnet::new(
            config.magnetization,
            config.magnet_dimensions,
            config.clamp_radius,
        );
        let mut ekf = Self {
            dt: config.dt(),
            state: Array1::zeros(6),
            covariance: Array2::zeros((6, 6)),
            process_noise: Self::build_process_noise(config.dt(), config.process_accel_std),
            magnet,
            r_mag: config.mag_noise_floor * config.mag_noise_floor,
            jacobian_step: config.jacobian_step,
            min_separation: config.clamp_radius,
            innovation_gate: config.innovation_gate,
            max_correction_step: config.max_correction_step,
            workspace_radius: config.workspace_radius,
            max_speed: config.max_speed,
            initial_position: config.initial_position,
            initial_pos_var: config.initial_pos_var,
            initial_vel_var: config.initial_vel_var,
            divergence_threshold: config.divergence_threshold,
            consecutive_skips: 0,
            field_updates: 0,
            skipped_corrections: 0,
            predict_steps: 0,
        };
        ekf.reset();
        ekf
    }

    fn build_process_noise(dt: f64, accel_std: f64) -> Array2<f64> {
        let accel_var = accel_std * accel_std;
        // Continuous white-noise acceleration driving a constant-velocity model
        let q_pos = 0.25 * dt.powi(4) * accel_var;
        let q_vel = dt.powi(2) * accel_var;
        let mut q = Array2::<f64>::zeros((6, 6));
        for i in 0..3 {
            q[[i, i]] = q_pos;
            q[[3 + i, 3 + i]] = q_vel;
        }
        q
    }

    /// Reinitialize mean and covariance from configuration. The filter has
    /// no terminal state; this is the only way to start over mid-session.
    pub fn reset(&mut self) {
        self.state = arr1(&[
            self.initial_position.x,
            self.initial_position.y,
            self.initial_position.z,
            0.0,
            0.0,
            0.0,
        ]);
        self.covariance = Array2::zeros((6, 6));
        for i in 0..3 {
            self.covariance[[i, i]] = self.initial_pos_var;
            self.covariance[[3 + i, 3 + i]] = self.initial_vel_var;
        }
        self.consecutive_skips = 0;
    }

    /// Current belief snapshot.
    pub fn get_state(&self) -> JawEkfState {
        JawEkfState {
            position: (self.state[0], self.state[1], self.state[2]),
            velocity: (self.state[3], self.state[4], self.state[5]),
            covariance_trace: self.covariance.diag().sum(),
            field_updates: self.field_updates,
            skipped_corrections: self.skipped_corrections,
            predict_steps: self.predict_steps,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.state[0], self.state[1], self.state[2])
    }

    fn estimated_pose(&self) -> Pose {
        Pose {
            position: self.position(),
            orientation: None,
        }
    }

    /// Time update. Runs with or without an inertial sample, so irregular
    /// magnetometer arrival degrades to predict-only steps instead of
    /// stalling the belief.
    ///
    /// With an IMU sample the measured specific force (gravity removed)
    /// propagates velocity; otherwise velocity coasts.
    pub fn predict(&mut self, dt: f64, imu: Option<&ImuSample>) {
        if let Some(sample) = imu {
            self.state[3] += sample.accel.x * dt;
            self.state[4] += sample.accel.y * dt;
            self.state[5] += (sample.accel.z - G) * dt;
        }
        self.state[0] += self.state[3] * dt;
        self.state[1] += self.state[4] * dt;
        self.state[2] += self.state[5] * dt;

        // F: identity with position-velocity coupling
        let mut f = Array2::<f64>::eye(6);
        for i in 0..3 {
            f[[i, 3 + i]] = dt;
        }

        // P = F * P * F^T + Q
        let fp = f.dot(&self.covariance);
        self.covariance = fp.dot(&f.t()) + &self.process_noise;

        // Force symmetry
        let p_t = self.covariance.t().to_owned();
        self.covariance = (&self.covariance + &p_t) * 0.5;

        self.clamp_to_workspace();
        self.predict_steps += 1;
    }

    /// Hard bounds on the mean: position stays inside the workspace sphere
    /// and above the sensor plane, speed stays below the ceiling. Far
    /// outside the workspace the field and its Jacobian vanish and a lost
    /// filter could never observe its way back.
    fn clamp_to_workspace(&mut self) {
        let r = self.workspace_radius;
        self.state[0] = self.state[0].clamp(-r, r);
        self.state[1] = self.state[1].clamp(-r, r);
        self.state[2] = self.state[2].clamp(self.min_separation, r);

        let speed: f64 = (3..6).map(|i| self.state[i] * self.state[i]).sum::<f64>().sqrt();
        if speed > self.max_speed {
            let scale = self.max_speed / speed;
            for i in 3..6 {
                self.state[i] *= scale;
            }
        }
    }

    /// Measurement update against one magnetometer sample.
    ///
    /// Degenerate geometry (clamped field point) and singular innovation
    /// covariance skip the correction and keep the predicted belief; the
    /// caller watches the skip counters rather than catching errors.
    pub fn update_field(&mut self, measurement: &FieldSample) -> UpdateOutcome {
        if measurement.clamped {
            return self.skip(UpdateOutcome::SkippedClamped);
        }

        let pose = self.estimated_pose();
        let (b_pred, clamped) = self.magnet.field_at(&pose);
        if clamped {
            return self.skip(UpdateOutcome::SkippedClamped);
        }
        let Some(jac) = self.magnet.field_jacobian(&pose, self.jacobian_step) else {
            return self.skip(UpdateOutcome::SkippedClamped);
        };

        let innovation = arr1(&[
            measurement.b.x - b_pred.x,
            measurement.b.y - b_pred.y,
            measurement.b.z - b_pred.z,
        ]);

        // An innovation several times the measured magnitude means the
        // predicted field is wildly off (estimate too close to the magnet,
        // or lost entirely); a correction built on that linearization
        // would catapult the mean.
        let innovation_norm: f64 = innovation.iter().map(|v| v * v).sum::<f64>().sqrt();
        let reference = measurement.b.norm().max(10.0 * self.r_mag.sqrt());
        if innovation_norm > self.innovation_gate * reference {
            return self.skip(UpdateOutcome::SkippedOutlier);
        }

        // H maps position states [0-2]; velocity is unobserved by the field
        let mut h = Array2::<f64>::zeros((3, 6));
        for r in 0..3 {
            for c in 0..3 {
                h[[r, c]] = jac[(r, c)];
            }
        }

        // Innovation covariance S = H*P*H^T + R
        let p = &self.covariance;
        let h_t = h.t();
        let s = h.dot(p).dot(&h_t);
        let s_mat = Matrix3::new(
            s[[0, 0]] + self.r_mag,
            s[[0, 1]],
            s[[0, 2]],
            s[[1, 0]],
            s[[1, 1]] + self.r_mag,
            s[[1, 2]],
            s[[2, 0]],
            s[[2, 1]],
            s[[2, 2]] + self.r_mag,
        );
        let Some(inv) = s_mat.try_inverse() else {
            return self.skip(UpdateOutcome::SkippedSingular);
        };
        let mut s_inv = Array2::<f64>::zeros((3, 3));
        for r in 0..3 {
            for c in 0..3 {
                s_inv[[r, c]] = inv[(r, c)];
            }
        }

        let k = p.dot(&h_t).dot(&s_inv);
        let mut dx = k.dot(&innovation);

        // Trust region: the field is steep and strongly nonlinear near the
        // magnet, and a full Newton-like step taken across a pose jump can
        // overshoot past it. Cap the position move, preserving direction.
        let step: f64 = dx.iter().take(3).map(|v| v * v).sum::<f64>().sqrt();
        if step > self.max_correction_step {
            let scale = self.max_correction_step / step;
            dx.mapv_inplace(|v| v * scale);
        }

        let prev_state = self.state.clone();
        let prev_cov = self.covariance.clone();

        for i in 0..6 {
            self.state[i] += dx[i];
        }

        // Joseph form keeps the covariance consistent under the numerically
        // tiny magnetometer noise
        let mut r_mat = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            r_mat[[i, i]] = self.r_mag;
        }
        let i_mat = Array2::<f64>::eye(6);
        let kh = k.dot(&h);
        let i_minus_kh = &i_mat - &kh;
        let term1 = i_minus_kh.dot(&prev_cov).dot(&i_minus_kh.t());
        let term2 = k.dot(&r_mat).dot(&k.t());
        self.covariance = term1 + term2;

        // Symmetrize to limit numerical drift
        let p_t = self.covariance.t().to_owned();
        self.covariance = (&self.covariance + &p_t) * 0.5;

        // Non-PSD covariance is an estimator fault, not something to paper
        // over: revert to the predicted belief and count it.
        if (0..6).any(|i| self.covariance[[i, i]] < -1e-15) {
            self.state = prev_state;
            self.covariance = prev_cov;
            return self.skip(UpdateOutcome::SkippedNonPsd);
        }
        for i in 0..6 {
            if self.covariance[[i, i]] < 0.0 {
                self.covariance[[i, i]] = 0.0;
            }
        }

        self.clamp_to_workspace();

        self.field_updates += 1;
        self.consecutive_skips = 0;
        UpdateOutcome::Applied
    }

    fn skip(&mut self, outcome: UpdateOutcome) -> UpdateOutcome {
        self.skipped_corrections += 1;
        self.consecutive_skips += 1;
        if self.consecutive_skips == self.divergence_threshold {
            log::warn!(
                "filter divergence suspected: {} consecutive skipped corrections",
                self.consecutive_skips
            );
        }
        outcome
    }

    /// True once the run of skipped corrections has crossed the configured
    /// divergence threshold.
    pub fn divergence_warning(&self) -> bool {
        self.consecutive_skips >= self.divergence_threshold
    }

    pub fn skipped_corrections(&self) -> u64 {
        self.skipped_corrections
    }

    /// Length of the current run of skipped corrections; cleared by every
    /// applied update.
    pub fn consecutive_skips(&self) -> u64 {
        self.consecutive_skips
    }
}
