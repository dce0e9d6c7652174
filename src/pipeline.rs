// pipeline.rs — the synchronous per-sample session loop.
//
// One pass over a measurement stream: time update, field correction,
// window accumulation, labeling, and document assembly. Events carry the
// operationally interesting moments (clamp hits, skipped corrections,
// divergence, window decisions) out to the caller instead of burying them
// in logs.

use chrono::Utc;

use crate::classifier::{WindowClassifier, WindowSample};
use crate::config::SessionConfig;
use crate::export::SimulationDocument;
use crate::filters::ekf::{JawEkf, JawEkfState, UpdateOutcome};
use crate::synth::{bruxism_session, MeasurementSynthesizer, SynthSample};
use crate::types::ActivityLabel;

/// Something the session loop observed that a caller may want to act on.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// The forward model clamped a field evaluation at this sample
    ClampHit { timestamp: f64 },

    /// A correction step was not applied
    CorrectionSkipped {
        timestamp: f64,
        outcome: UpdateOutcome,
    },

    /// The run of consecutive skips crossed the divergence threshold
    DivergenceWarning {
        timestamp: f64,
        consecutive_skips: u64,
    },

    /// A window was labeled
    WindowClassified {
        start: f64,
        end: f64,
        label: ActivityLabel,
        rule: &'static str,
    },
}

/// Everything a finished session produces.
pub struct SessionOutcome {
    pub document: SimulationDocument,
    pub events: Vec<PipelineEvent>,
    pub final_state: JawEkfState,
}

impl SessionOutcome {
    /// Per-label sample counts over the whole session.
    pub fn label_counts(&self) -> [(ActivityLabel, usize); 4] {
        let mut counts = [
            (ActivityLabel::Rest, 0),
            (ActivityLabel::Grinding, 0),
            (ActivityLabel::Clenching, 0),
            (ActivityLabel::Unknown, 0),
        ];
        for label in &self.document.labels {
            for slot in counts.iter_mut() {
                if slot.0 == *label {
                    slot.1 += 1;
                }
            }
        }
        counts
    }
}

/// Run the estimator and classifier over an already-synthesized stream.
///
/// Windows are non-overlapping, `window_size` samples each; the trailing
/// partial window is still classified (and comes back Unknown when it is
/// too short for a frequency estimate). Every sample carries the label of
/// the window that contains it.
pub fn run_session(config: &SessionConfig, samples: &[SynthSample]) -> SessionOutcome {
    let mut ekf = JawEkf::new(config);
    let classifier = WindowClassifier::new(config);

    let n = samples.len();
    let mut events = Vec::new();
    let mut t = Vec::with_capacity(n);
    let mut true_positions = Vec::with_capacity(n);
    let mut noisy_b = Vec::with_capacity(n);
    let mut estimated_positions = Vec::with_capacity(n);
    let mut field_magnitude = Vec::with_capacity(n);
    let mut labels = vec![ActivityLabel::Unknown; n];

    let mut window: Vec<WindowSample> = Vec::with_capacity(config.window_size);
    let mut window_start_idx = 0usize;
    let mut divergence_raised = false;

    let close_window = |window: &mut Vec<WindowSample>,
                            start_idx: usize,
                            end_idx: usize,
                            t: &[f64],
                            labels: &mut [ActivityLabel],
                            events: &mut Vec<PipelineEvent>| {
        let decision = classifier.classify_window(window);
        for label in labels[start_idx..end_idx].iter_mut() {
            *label = decision.label;
        }
        log::debug!(
            "window [{start_idx}, {end_idx}) labeled {} by rule '{}'",
            decision.label.as_str(),
            decision.rule
        );
        events.push(PipelineEvent::WindowClassified {
            start: t[start_idx],
            end: t[end_idx - 1],
            label: decision.label,
            rule: decision.rule,
        });
        window.clear();
    };

    for (i, sample) in samples.iter().enumerate() {
        ekf.predict(config.dt(), sample.imu.as_ref());

        if sample.field.clamped {
            events.push(PipelineEvent::ClampHit {
                timestamp: sample.field.timestamp,
            });
        }

        let outcome = ekf.update_field(&sample.field);
        if outcome != UpdateOutcome::Applied {
            events.push(PipelineEvent::CorrectionSkipped {
                timestamp: sample.field.timestamp,
                outcome,
            });
            if ekf.divergence_warning() && !divergence_raised {
                divergence_raised = true;
                events.push(PipelineEvent::DivergenceWarning {
                    timestamp: sample.field.timestamp,
                    consecutive_skips: ekf.consecutive_skips(),
                });
                // The filter has lost track; restart it from the
                // configured prior rather than skipping forever.
                ekf.reset();
            }
        } else {
            divergence_raised = false;
        }

        let est = ekf.position();
        t.push(sample.field.timestamp);
        true_positions.push([
            sample.truth.pose.position.x,
            sample.truth.pose.position.y,
            sample.truth.pose.position.z,
        ]);
        noisy_b.push([sample.field.b.x, sample.field.b.y, sample.field.b.z]);
        estimated_positions.push([est.x, est.y, est.z]);
        field_magnitude.push(sample.field.b.norm() * 1e6);

        window.push(WindowSample {
            b: sample.field.b,
            est_z: est.z,
        });
        if window.len() == config.window_size {
            close_window(
                &mut window,
                window_start_idx,
                i + 1,
                &t,
                &mut labels,
                &mut events,
            );
            window_start_idx = i + 1;
        }
    }
    if !window.is_empty() {
        close_window(&mut window, window_start_idx, n, &t, &mut labels, &mut events);
    }

    let dbx_dz_full = full_resolution_gradient(&noisy_b, &estimated_positions);

    let document = SimulationDocument {
        t,
        true_positions,
        noisy_b,
        estimated_positions,
        field_magnitude,
        dbx_dz_full,
        labels,
        original_length: n,
        playback_rate: config.playback_rate_ms,
        sample_rate_hz: config.sample_rate_hz,
        created_at: Utc::now().to_rfc3339(),
    };

    SessionOutcome {
        document,
        events,
        final_state: ekf.get_state(),
    }
}

/// Synthesize the scripted rest/grinding/clenching session and run it.
pub fn simulate_session(config: &SessionConfig, seed: u64) -> SessionOutcome {
    let trajectory = bruxism_session(config);
    let samples = MeasurementSynthesizer::new(config, seed).synthesize(&trajectory);
    run_session(config, &samples)
}

/// Per-sample dBx/dz [µT/mm] by central differences of the measured Bx
/// against the estimated height. Endpoints and still stretches report zero.
fn full_resolution_gradient(noisy_b: &[[f64; 3]], estimated: &[[f64; 3]]) -> Vec<f64> {
    let n = noisy_b.len();
    let mut out = vec![0.0; n];
    for i in 1..n.saturating_sub(1) {
        let dz_mm = (estimated[i + 1][2] - estimated[i - 1][2]) * 1e3;
        if dz_mm.abs() < 1e-6 {
            continue;
        }
        out[i] = (noisy_b[i + 1][0] - noisy_b[i - 1][0]) * 1e6 / dz_mm;
    }
    out
}
