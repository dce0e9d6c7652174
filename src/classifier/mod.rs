// classifier — windowed feature extraction and activity labeling.
//
// Feature extraction and the labeling decision are deliberately separate:
// the decision table below can be swapped for a trained model without
// touching the feature contract.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::types::ActivityLabel;

/// One input row for a classification window: the noisy field vector and
/// the estimated vertical separation at that instant.
#[derive(Clone, Debug)]
pub struct WindowSample {
    /// Flux density [T]
    pub b: Vector3<f64>,
    /// Estimated magnet height above the sensor [m]
    pub est_z: f64,
}

/// Per-window derived statistics. Units follow the prototype's feature
/// scaling: magnitudes in µT, variances and band power in µT² (1e12 x T²),
/// gradient in µT/mm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub field_magnitude: f64,
    pub lateral_variance: f64,
    pub spectral_power: f64,
    pub field_gradient: f64,
}

/// Thresholds for the fixed decision table.
#[derive(Clone, Debug)]
pub struct Thresholds {
    pub grind_power_min: f64,
    pub clench_magnitude_min: f64,
    pub rest_variance_max: f64,
}

impl Thresholds {
    pub fn from_config(config: &SessionConfig) -> Self {
        Thresholds {
            grind_power_min: config.grind_power_min,
            clench_magnitude_min: config.clench_magnitude_min,
            rest_variance_max: config.rest_variance_max,
        }
    }
}

/// One named guard in the decision table.
pub struct DecisionRule {
    pub name: &'static str,
    pub label: ActivityLabel,
    pub guard: fn(&FeatureVector, &Thresholds) -> bool,
}

/// Ordered decision table; the first matching guard wins and anything that
/// matches nothing stays Unknown.
pub const DECISION_TABLE: &[DecisionRule] = &[
    DecisionRule {
        name: "grinding-band-power",
        label: ActivityLabel::Grinding,
        guard: |f, t| f.spectral_power >= t.grind_power_min,
    },
    DecisionRule {
        name: "clench-field-magnitude",
        label: ActivityLabel::Clenching,
        guard: |f, t| f.field_magnitude >= t.clench_magnitude_min,
    },
    DecisionRule {
        name: "rest-quiet",
        label: ActivityLabel::Rest,
        guard: |f, t| {
            f.lateral_variance <= t.rest_variance_max
                && f.field_magnitude < t.clench_magnitude_min
        },
    },
];

/// Walk the decision table; returns the label and the name of the rule
/// that fired.
pub fn classify(features: &FeatureVector, thresholds: &Thresholds) -> (ActivityLabel, &'static str) {
    for rule in DECISION_TABLE {
        if (rule.guard)(features, thresholds) {
            return (rule.label, rule.name);
        }
    }
    (ActivityLabel::Unknown, "no-rule-matched")
}

/// Computes `FeatureVector`s from fixed-length windows of samples.
pub struct FeatureExtractor {
    sample_rate_hz: f64,
    band_lo_hz: f64,
    band_hi_hz: f64,
    min_window: usize,
}

impl FeatureExtractor {
    pub fn new(config: &SessionConfig) -> Self {
        FeatureExtractor {
            sample_rate_hz: config.sample_rate_hz,
            band_lo_hz: config.band_lo_hz,
            band_hi_hz: config.band_hi_hz,
            min_window: config.min_window,
        }
    }

    /// Features for one window, or `None` when the window is too short to
    /// support a frequency estimate. Pure function of the window contents.
    pub fn features(&self, window: &[WindowSample]) -> Option<FeatureVector> {
        if window.len() < self.min_window.max(4) {
            return None;
        }

        let n = window.len() as f64;
        let field_magnitude = window.iter().map(|s| s.b.norm() * 1e6).sum::<f64>() / n;

        let var_bx = variance(window.iter().map(|s| s.b.x));
        let var_by = variance(window.iter().map(|s| s.b.y));
        let lateral_variance = (var_bx + var_by) / 2.0 * 1e12;

        let bx: Vec<f64> = window.iter().map(|s| s.b.x).collect();
        let spectral_power = self.band_power(&bx) * 1e12;

        let field_gradient = vertical_gradient(window);

        Some(FeatureVector {
            field_magnitude,
            lateral_variance,
            spectral_power,
            field_gradient,
        })
    }

    /// Hann-windowed periodogram power summed over the bruxism band.
    ///
    /// The signal is detrended linearly first; the slow jaw drift between
    /// activity phases otherwise leaks broadband energy into the 1-2 Hz
    /// bins and masks the rest/grinding contrast.
    fn band_power(&self, signal: &[f64]) -> f64 {
        let n = signal.len();
        let detrended = detrend_linear(signal);
        let weights = hann_window(n);
        let u: f64 = weights.iter().map(|w| w * w).sum();

        let mut power = 0.0;
        let df = self.sample_rate_hz / n as f64;
        for k in 1..=n / 2 {
            let freq = k as f64 * df;
            if freq < self.band_lo_hz || freq > self.band_hi_hz {
                continue;
            }
            let (mut re, mut im) = (0.0, 0.0);
            for (i, (x, w)) in detrended.iter().zip(weights.iter()).enumerate() {
                let angle = -2.0 * std::f64::consts::PI * (k * i) as f64 / n as f64;
                re += x * w * angle.cos();
                im += x * w * angle.sin();
            }
            // One-sided PSD estimate, matching a single-segment Welch
            let scale = if k == n / 2 && n % 2 == 0 { 1.0 } else { 2.0 };
            power += scale * (re * re + im * im) / (self.sample_rate_hz * u);
        }
        power
    }
}

fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count() as f64;
    if n < 1.0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n;
    values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

fn hann_window(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| {
            let angle = 2.0 * std::f64::consts::PI * i as f64 / (n as f64 - 1.0);
            0.5 - 0.5 * angle.cos()
        })
        .collect()
}

/// Subtract the least-squares line from the signal.
fn detrend_linear(signal: &[f64]) -> Vec<f64> {
    let n = signal.len() as f64;
    let mean_i = (n - 1.0) / 2.0;
    let mean_y = signal.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in signal.iter().enumerate() {
        let di = i as f64 - mean_i;
        num += di * (y - mean_y);
        den += di * di;
    }
    let slope = if den > 0.0 { num / den } else { 0.0 };
    signal
        .iter()
        .enumerate()
        .map(|(i, y)| y - mean_y - slope * (i as f64 - mean_i))
        .collect()
}

/// Mean dBx/dz across the window [µT/mm] by central differences against the
/// estimated vertical separation. Pairs with no measurable height change
/// are skipped; a perfectly still window reports zero gradient.
fn vertical_gradient(window: &[WindowSample]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 1..window.len().saturating_sub(1) {
        let dz_mm = (window[i + 1].est_z - window[i - 1].est_z) * 1e3;
        if dz_mm.abs() < 1e-6 {
            continue;
        }
        let dbx_ut = (window[i + 1].b.x - window[i - 1].b.x) * 1e6;
        sum += dbx_ut / dz_mm;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Feature extraction plus the fixed decision table, bundled for the
/// pipeline. Holds no state between windows.
pub struct WindowClassifier {
    extractor: FeatureExtractor,
    thresholds: Thresholds,
}

/// Label plus the evidence that produced it.
#[derive(Clone, Debug)]
pub struct WindowDecision {
    pub label: ActivityLabel,
    pub rule: &'static str,
    pub features: Option<FeatureVector>,
}

impl WindowClassifier {
    pub fn new(config: &SessionConfig) -> Self {
        WindowClassifier {
            extractor: FeatureExtractor::new(config),
            thresholds: Thresholds::from_config(config),
        }
    }

    /// Short windows are rejected with Unknown rather than an error; a
    /// confident frequency estimate cannot be formed below the minimum
    /// window length.
    pub fn classify_window(&self, window: &[WindowSample]) -> WindowDecision {
        match self.extractor.features(window) {
            Some(features) => {
                let (label, rule) = classify(&features, &self.thresholds);
                WindowDecision {
                    label,
                    rule,
                    features: Some(features),
                }
            }
            None => WindowDecision {
                label: ActivityLabel::Unknown,
                rule: "window-too-short",
                features: None,
            },
        }
    }
}
