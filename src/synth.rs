// synth.rs — scripted jaw trajectories and synthetic sensor streams.
//
// Stands in for the magnetometer/IMU acquisition firmware during
// development: the same forward model the estimator uses generates the
// noiseless field, then seeded Gaussian noise is layered on top. A fixed
// seed reproduces the stream byte for byte, which the test fixtures rely on.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::config::SessionConfig;
use crate::field_model::CuboidMagnet;
use crate::types::{FieldSample, ImuSample, Pose, TrajectorySample};

const G: f64 = 9.81;

/// One scripted phase of jaw motion.
#[derive(Clone, Debug)]
pub enum JawPhase {
    /// Slow lateral wander (±2 mm at 0.5 rad/s), z between 10 and 12 mm
    Rest,
    /// Fast lateral cycling (±5 mm) at the configured grinding frequency,
    /// z between 8 and 10 mm
    Grinding,
    /// Near-still bite (±1 mm), z between 5 and 6 mm
    Clenching,
    /// Magnet held motionless at a fixed pose
    Hold { position: Vector3<f64> },
    /// Pure lateral sinusoid at `freq_hz`, fixed vertical separation
    LateralSweep {
        amplitude: f64,
        freq_hz: f64,
        z: f64,
    },
}

impl JawPhase {
    /// Magnet position at phase-local time `t` [s].
    fn position(&self, t: f64, grinding_freq_hz: f64) -> Vector3<f64> {
        use std::f64::consts::TAU;
        match self {
            JawPhase::Rest => Vector3::new(
                0.002 * (0.5 * t).sin(),
                0.002 * (0.5 * t).cos(),
                0.010 + 0.002 * (0.5 * t).sin(),
            ),
            JawPhase::Grinding => Vector3::new(
                0.005 * (grinding_freq_hz * TAU * t).sin(),
                0.005 * (grinding_freq_hz * TAU * t).cos(),
                0.008 + 0.002 * (TAU * t).sin(),
            ),
            JawPhase::Clenching => Vector3::new(
                0.001 * (0.5 * t).sin(),
                0.001 * (0.5 * t).cos(),
                0.005 + 0.001 * (0.5 * t).sin(),
            ),
            JawPhase::Hold { position } => *position,
            JawPhase::LateralSweep {
                amplitude,
                freq_hz,
                z,
            } => Vector3::new(amplitude * (freq_hz * TAU * t).sin(), 0.0, *z),
        }
    }
}

/// Generate a timestamped ground-truth trajectory from scripted phases.
///
/// Each phase runs for its paired duration in seconds; sampling follows the
/// session's magnetometer rate. Phase-local time restarts at each boundary,
/// matching the piecewise definition of the original simulation path.
pub fn scripted_trajectory(
    phases: &[(JawPhase, f64)],
    config: &SessionConfig,
) -> Vec<TrajectorySample> {
    let dt = config.dt();
    let mut out = Vec::new();
    let mut t0 = 0.0;
    for (phase, duration) in phases {
        let steps = (duration * config.sample_rate_hz).round() as usize;
        for i in 0..steps {
            let local = i as f64 * dt;
            out.push(TrajectorySample {
                timestamp: t0 + local,
                pose: Pose {
                    position: phase.position(local, config.grinding_freq_hz),
                    orientation: None,
                },
            });
        }
        t0 += duration;
    }
    out
}

/// The 15-second rest/grinding/clenching script from the prototype.
pub fn bruxism_session(config: &SessionConfig) -> Vec<TrajectorySample> {
    scripted_trajectory(
        &[
            (JawPhase::Rest, 5.0),
            (JawPhase::Grinding, 5.0),
            (JawPhase::Clenching, 5.0),
        ],
        config,
    )
}

/// One synthesized pipeline input: ground truth plus the noisy observations.
#[derive(Clone, Debug)]
pub struct SynthSample {
    pub truth: TrajectorySample,
    /// Noiseless field at the sensor [T]
    pub true_b: Vector3<f64>,
    /// Noise-corrupted field sample
    pub field: FieldSample,
    /// Present when IMU synthesis is enabled
    pub imu: Option<ImuSample>,
}

pub struct MeasurementSynthesizer {
    magnet: CuboidMagnet,
    mag_noise: Normal<f64>,
    accel_noise: Normal<f64>,
    gyro_noise: Normal<f64>,
    enable_imu: bool,
    dt: f64,
    rng: StdRng,
}

impl MeasurementSynthesizer {
    pub fn new(config: &SessionConfig, seed: u64) -> Self {
        MeasurementSynthesizer {
            magnet: CuboidMagnet::new(
                config.magnetization,
                config.magnet_dimensions,
                config.clamp_radius,
            ),
            mag_noise: Normal::new(0.0, config.mag_noise_floor).expect("noise floor must be >= 0"),
            accel_noise: Normal::new(0.0, config.accel_noise_floor)
                .expect("noise floor must be >= 0"),
            gyro_noise: Normal::new(0.0, config.gyro_noise_floor)
                .expect("noise floor must be >= 0"),
            enable_imu: config.enable_imu,
            dt: config.dt(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Run the forward model along `trajectory` and corrupt it with sensor
    /// noise. Deterministic for a given seed and trajectory.
    pub fn synthesize(&mut self, trajectory: &[TrajectorySample]) -> Vec<SynthSample> {
        let mut out = Vec::with_capacity(trajectory.len());
        for (i, sample) in trajectory.iter().enumerate() {
            let (true_b, clamped) = self.magnet.field_at(&sample.pose);
            let noise = Vector3::new(
                self.mag_noise.sample(&mut self.rng),
                self.mag_noise.sample(&mut self.rng),
                self.mag_noise.sample(&mut self.rng),
            );
            let field = FieldSample {
                timestamp: sample.timestamp,
                b: true_b + noise,
                clamped,
            };

            let imu = if self.enable_imu {
                Some(self.synthesize_imu(trajectory, i))
            } else {
                None
            };

            out.push(SynthSample {
                truth: sample.clone(),
                true_b,
                field,
                imu,
            });
        }
        out
    }

    /// Inertial observation implied by the trajectory: second difference of
    /// position for specific force (gravity added back), zero angular rate
    /// for the translational scripts. Interior points use the central
    /// stencil; the edges fall back to zero motion.
    fn synthesize_imu(&mut self, trajectory: &[TrajectorySample], i: usize) -> ImuSample {
        let accel_true = if i > 0 && i + 1 < trajectory.len() {
            let prev = &trajectory[i - 1].pose.position;
            let curr = &trajectory[i].pose.position;
            let next = &trajectory[i + 1].pose.position;
            (next - 2.0 * curr + prev) / (self.dt * self.dt)
        } else {
            Vector3::zeros()
        };

        let accel = accel_true
            + Vector3::new(0.0, 0.0, G)
            + Vector3::new(
                self.accel_noise.sample(&mut self.rng),
                self.accel_noise.sample(&mut self.rng),
                self.accel_noise.sample(&mut self.rng),
            );
        let gyro = Vector3::new(
            self.gyro_noise.sample(&mut self.rng),
            self.gyro_noise.sample(&mut self.rng),
            self.gyro_noise.sample(&mut self.rng),
        );

        ImuSample {
            timestamp: trajectory[i].timestamp,
            accel,
            gyro,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_reproduces_stream_exactly() {
        let config = SessionConfig::default();
        let traj = bruxism_session(&config);

        let a = MeasurementSynthesizer::new(&config, 42).synthesize(&traj);
        let b = MeasurementSynthesizer::new(&config, 42).synthesize(&traj);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.field.b, y.field.b);
            assert_eq!(x.true_b, y.true_b);
        }
    }

    #[test]
    fn different_seeds_differ() {
        let config = SessionConfig::default();
        let traj = bruxism_session(&config);
        let a = MeasurementSynthesizer::new(&config, 1).synthesize(&traj);
        let b = MeasurementSynthesizer::new(&config, 2).synthesize(&traj);
        assert!(a.iter().zip(b.iter()).any(|(x, y)| x.field.b != y.field.b));
    }

    #[test]
    fn session_script_covers_fifteen_seconds() {
        let config = SessionConfig::default();
        let traj = bruxism_session(&config);
        assert_eq!(traj.len(), 750);
        assert!((traj.last().unwrap().timestamp - 14.98).abs() < 1e-9);
        assert!(traj.iter().all(|s| s.pose.is_physical()));
    }

    #[test]
    fn noise_stays_near_the_floor() {
        let config = SessionConfig::default();
        let traj = scripted_trajectory(
            &[(
                JawPhase::Hold {
                    position: Vector3::new(0.0, 0.0, 0.01),
                },
                10.0,
            )],
            &config,
        );
        let samples = MeasurementSynthesizer::new(&config, 7).synthesize(&traj);
        let n = samples.len() as f64;
        let mean_err: f64 = samples
            .iter()
            .map(|s| (s.field.b - s.true_b).norm())
            .sum::<f64>()
            / n;
        // Mean norm of a 3D gaussian with sigma=0.2 µT is ~0.32 µT.
        assert!(mean_err < 1e-6, "noise too large: {mean_err}");
        assert!(mean_err > 1e-8, "noise suspiciously small: {mean_err}");
    }

    #[test]
    fn imu_samples_present_only_when_enabled() {
        let mut config = SessionConfig::default();
        let traj = bruxism_session(&config);
        let off = MeasurementSynthesizer::new(&config, 3).synthesize(&traj);
        assert!(off.iter().all(|s| s.imu.is_none()));

        config.enable_imu = true;
        let on = MeasurementSynthesizer::new(&config, 3).synthesize(&traj);
        assert!(on.iter().all(|s| s.imu.is_some()));

        // Gravity dominates the specific force for the gentle rest phase.
        let first = on[10].imu.as_ref().unwrap();
        assert!((first.accel.z - G).abs() < 1.0);
    }
}
