// config.rs — one immutable configuration value for the whole session.
//
// Every component takes the pieces it needs at construction time; nothing
// reads ambient globals, so tests can run several differently-configured
// pipelines side by side.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    // ── Magnet (N35, 5 x 5 x 2 mm) ──
    /// Remanent magnetization vector [A/m]
    pub magnetization: Vector3<f64>,
    /// Cuboid edge lengths [m]
    pub magnet_dimensions: Vector3<f64>,

    // ── Forward-model guard ──
    /// Minimum sensor-magnet separation the field model will evaluate at [m]
    pub clamp_radius: f64,

    // ── Sampling / sensor ──
    /// Magnetometer sampling rate [Hz]
    pub sample_rate_hz: f64,
    /// Magnetometer noise floor, per axis [T] (HMC5883L: 0.2 µT)
    pub mag_noise_floor: f64,
    /// Accelerometer noise floor [m/s²]
    pub accel_noise_floor: f64,
    /// Gyro noise floor [rad/s]
    pub gyro_noise_floor: f64,
    /// Synthesize and fuse inertial observations
    pub enable_imu: bool,

    // ── Trajectory defaults ──
    /// Grinding cycle frequency [Hz]; the source material quotes both
    /// 1.5 Hz and 12 Hz, we default to the simulation calibration.
    pub grinding_freq_hz: f64,

    // ── EKF ──
    /// Initial position estimate [m] (plausible rest pose)
    pub initial_position: Vector3<f64>,
    /// Initial position variance [m²]
    pub initial_pos_var: f64,
    /// Initial velocity variance [m²/s²]
    pub initial_vel_var: f64,
    /// Process-noise driving acceleration std [m/s²]
    pub process_accel_std: f64,
    /// Consecutive skipped corrections before a divergence warning
    pub divergence_threshold: u64,
    /// Central-difference step for the measurement Jacobian [m]
    pub jacobian_step: f64,
    /// Innovation norm above this multiple of the measured magnitude is
    /// rejected as an outlier (the linearization point is badly wrong)
    pub innovation_gate: f64,
    /// Largest position move one correction may apply [m]
    pub max_correction_step: f64,
    /// The estimate may not leave a sphere of this radius around the
    /// sensor [m]
    pub workspace_radius: f64,
    /// Speed ceiling on the velocity estimate [m/s]
    pub max_speed: f64,

    // ── Classifier ──
    /// Window length in samples (1 s at 50 Hz resolves 1-2 Hz per Nyquist)
    pub window_size: usize,
    /// Shorter windows are rejected as Unknown
    pub min_window: usize,
    /// Bruxism spectral band [Hz]
    pub band_lo_hz: f64,
    pub band_hi_hz: f64,
    /// Band power above this is grinding [scaled µT²]
    pub grind_power_min: f64,
    /// Mean |B| above this is clenching [µT]
    pub clench_magnitude_min: f64,
    /// Lateral field variance below this is rest [µT²]
    pub rest_variance_max: f64,

    // ── Export ──
    /// Viewer playback interval hint [ms]
    pub playback_rate_ms: u32,
    /// Downsampled playback length (0 = keep full resolution)
    pub playback_points: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            magnetization: Vector3::new(0.0, 0.0, 955_000.0),
            magnet_dimensions: Vector3::new(0.005, 0.005, 0.002),
            clamp_radius: 0.003,
            sample_rate_hz: 50.0,
            mag_noise_floor: 2e-7,
            accel_noise_floor: 0.05,
            gyro_noise_floor: 0.005,
            enable_imu: false,
            grinding_freq_hz: 1.5,
            initial_position: Vector3::new(0.0, 0.0, 0.01),
            initial_pos_var: 1e-4,
            initial_vel_var: 1e-2,
            process_accel_std: 0.5,
            divergence_threshold: 25,
            jacobian_step: 1e-6,
            innovation_gate: 3.0,
            max_correction_step: 0.005,
            workspace_radius: 0.05,
            max_speed: 1.0,
            window_size: 50,
            min_window: 25,
            band_lo_hz: 1.0,
            band_hi_hz: 2.0,
            grind_power_min: 5e4,
            clench_magnitude_min: 2e4,
            rest_variance_max: 1e6,
            playback_rate_ms: 100,
            playback_points: 150,
        }
    }
}

impl SessionConfig {
    pub fn dt(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = SessionConfig::default();
        assert!(cfg.min_window <= cfg.window_size);
        assert!(cfg.band_lo_hz < cfg.band_hi_hz);
        // Nyquist margin for the grinding band
        assert!(cfg.band_hi_hz < cfg.sample_rate_hz / 2.0);
        assert!(cfg.clamp_radius < cfg.initial_position.z);
        assert!(cfg.initial_position.norm() < cfg.workspace_radius);
        assert!(cfg.max_correction_step < cfg.workspace_radius);
        assert!(cfg.innovation_gate > 1.0);
    }

    #[test]
    fn config_serde_round_trip() {
        let cfg = SessionConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.window_size, cfg.window_size);
        assert_eq!(back.magnetization, cfg.magnetization);
    }
}
