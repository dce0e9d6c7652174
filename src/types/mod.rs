use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Relative pose of the upper-jaw magnet in the lower-jaw sensor frame.
///
/// Position is in meters; the sensor sits at the origin with +z pointing
/// toward the magnet, so `position.z` is the vertical separation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pose {
    /// Magnet center position in the sensor frame [m]
    pub position: Vector3<f64>,

    /// Magnet orientation in the sensor frame, if orientation tracking is on
    pub orientation: Option<UnitQuaternion<f64>>,
}

impl Pose {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Pose {
            position: Vector3::new(x, y, z),
            orientation: None,
        }
    }

    /// Finite components and positive vertical separation.
    pub fn is_physical(&self) -> bool {
        self.position.iter().all(|c| c.is_finite()) && self.position.z > 0.0
    }
}

/// One magnetometer reading: flux density at the sensor, in tesla.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSample {
    pub timestamp: f64,
    pub b: Vector3<f64>,

    /// Set when the forward model evaluated this field at the clamped
    /// minimum standoff instead of the true separation.
    pub clamped: bool,
}

impl FieldSample {
    pub fn magnitude(&self) -> f64 {
        self.b.norm()
    }
}

/// One inertial reading (accelerometer + gyro), body frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: f64,
    /// Specific force [m/s²], gravity included
    pub accel: Vector3<f64>,
    /// Angular rate [rad/s]
    pub gyro: Vector3<f64>,
}

/// A ground-truth trajectory point produced by the trajectory generator.
#[derive(Clone, Debug)]
pub struct TrajectorySample {
    pub timestamp: f64,
    pub pose: Pose,
}

/// Activity label emitted per classification window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLabel {
    Rest,
    Grinding,
    Clenching,
    Unknown,
}

impl ActivityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLabel::Rest => "rest",
            ActivityLabel::Grinding => "grinding",
            ActivityLabel::Clenching => "clenching",
            ActivityLabel::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_physicality() {
        assert!(Pose::at(0.0, 0.0, 0.01).is_physical());
        assert!(!Pose::at(0.0, 0.0, 0.0).is_physical());
        assert!(!Pose::at(f64::NAN, 0.0, 0.01).is_physical());
        assert!(!Pose::at(0.001, 0.002, -0.005).is_physical());
    }

    #[test]
    fn label_round_trip() {
        let json = serde_json::to_string(&ActivityLabel::Grinding).unwrap();
        assert_eq!(json, "\"grinding\"");
        let back: ActivityLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ActivityLabel::Grinding);
    }
}
