// export.rs — the interchange document consumed by the playback viewer.
//
// The viewer indexes every series by the same integer offset with no time
// alignment of its own, so array-length equality and strictly increasing
// timestamps are contract requirements: violations reject the export
// instead of producing a document the viewer would misread.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ActivityLabel;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("series '{series}' has {got} entries, expected {expected}")]
    LengthMismatch {
        series: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("timestamps not strictly increasing at index {index}")]
    NonMonotonicTimestamps { index: usize },

    #[error("non-finite timestamp at index {index}")]
    NonFiniteTimestamp { index: usize },

    #[error("document is empty")]
    Empty,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One complete simulation/recording run, serialized for the viewer.
/// Field names match the prototype's `simulation_data.json` contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationDocument {
    /// Timestamps [s], strictly increasing
    pub t: Vec<f64>,

    /// Ground-truth magnet positions [m]
    pub true_positions: Vec<[f64; 3]>,

    /// Noisy field samples [T]
    #[serde(rename = "noisy_B")]
    pub noisy_b: Vec<[f64; 3]>,

    /// Estimated magnet positions [m]
    pub estimated_positions: Vec<[f64; 3]>,

    /// |B| [µT]
    pub field_magnitude: Vec<f64>,

    /// dBx/dz [µT/mm]
    #[serde(rename = "dBx_dz_full")]
    pub dbx_dz_full: Vec<f64>,

    /// Per-sample activity labels (the owning window's label)
    pub labels: Vec<ActivityLabel>,

    /// Sample count before playback downsampling
    pub original_length: usize,

    /// Recommended playback interval [ms]
    pub playback_rate: u32,

    /// Acquisition rate [Hz]
    pub sample_rate_hz: f64,

    /// Export wall-clock time, RFC 3339
    pub created_at: String,
}

impl SimulationDocument {
    /// Enforce the viewer contract: equal lengths everywhere and strictly
    /// increasing time. Any violation is fatal for the export.
    pub fn validate(&self) -> Result<(), ExportError> {
        let n = self.t.len();
        if n == 0 {
            return Err(ExportError::Empty);
        }
        let checks: [(&'static str, usize); 5] = [
            ("true_positions", self.true_positions.len()),
            ("noisy_B", self.noisy_b.len()),
            ("estimated_positions", self.estimated_positions.len()),
            ("field_magnitude", self.field_magnitude.len()),
            ("dBx_dz_full", self.dbx_dz_full.len()),
        ];
        for (series, got) in checks {
            if got != n {
                return Err(ExportError::LengthMismatch {
                    series,
                    expected: n,
                    got,
                });
            }
        }
        if self.labels.len() != n {
            return Err(ExportError::LengthMismatch {
                series: "labels",
                expected: n,
                got: self.labels.len(),
            });
        }
        // NaN timestamps would slip through the monotonicity comparison
        // (every NaN comparison is false), so finiteness is checked first.
        for (i, v) in self.t.iter().enumerate() {
            if !v.is_finite() {
                return Err(ExportError::NonFiniteTimestamp { index: i });
            }
        }
        for i in 1..n {
            if self.t[i] <= self.t[i - 1] {
                return Err(ExportError::NonMonotonicTimestamps { index: i });
            }
        }
        Ok(())
    }

    /// Linearly resample every series down to `points` for smooth playback
    /// (the prototype reduced 750 samples to 150 at a 100 ms frame hint).
    /// Labels take the nearest source sample. No-op when `points` leaves
    /// nothing to interpolate between (fewer than two) or is not smaller
    /// than the current length.
    pub fn resample(&self, points: usize) -> SimulationDocument {
        let n = self.t.len();
        if points < 2 || points >= n || n < 2 {
            return self.clone();
        }

        let pick = |values: &Vec<f64>, x: f64| -> f64 {
            let lo = x.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = x - lo as f64;
            values[lo] * (1.0 - frac) + values[hi] * frac
        };
        let pick3 = |values: &Vec<[f64; 3]>, x: f64| -> [f64; 3] {
            let lo = x.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = x - lo as f64;
            let mut out = [0.0; 3];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = values[lo][i] * (1.0 - frac) + values[hi][i] * frac;
            }
            out
        };

        let mut out = SimulationDocument {
            t: Vec::with_capacity(points),
            true_positions: Vec::with_capacity(points),
            noisy_b: Vec::with_capacity(points),
            estimated_positions: Vec::with_capacity(points),
            field_magnitude: Vec::with_capacity(points),
            dbx_dz_full: Vec::with_capacity(points),
            labels: Vec::with_capacity(points),
            original_length: self.original_length,
            playback_rate: self.playback_rate,
            sample_rate_hz: self.sample_rate_hz,
            created_at: self.created_at.clone(),
        };
        for i in 0..points {
            let x = i as f64 * (n - 1) as f64 / (points - 1) as f64;
            out.t.push(pick(&self.t, x));
            out.true_positions.push(pick3(&self.true_positions, x));
            out.noisy_b.push(pick3(&self.noisy_b, x));
            out.estimated_positions
                .push(pick3(&self.estimated_positions, x));
            out.field_magnitude.push(pick(&self.field_magnitude, x));
            out.dbx_dz_full.push(pick(&self.dbx_dz_full, x));
            out.labels.push(self.labels[x.round() as usize]);
        }
        out
    }

    /// Validate, then write as plain JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), ExportError> {
        self.validate()?;
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Validate, then write as gzipped JSON.
    pub fn write_json_gz(&self, path: &Path) -> Result<(), ExportError> {
        self.validate()?;
        let encoder = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
        serde_json::to_writer(encoder, self)?;
        Ok(())
    }

    /// Read a document back; `.gz` extension selects gzip transparently,
    /// the same convention the session replay logs use.
    pub fn read(path: &Path) -> Result<SimulationDocument, ExportError> {
        let file = File::open(path)?;
        let doc: SimulationDocument = if path.extension().map(|e| e == "gz").unwrap_or(false) {
            serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
        } else {
            serde_json::from_reader(BufReader::new(file))?
        };
        doc.validate()?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_doc(n: usize) -> SimulationDocument {
        SimulationDocument {
            t: (0..n).map(|i| i as f64 * 0.02).collect(),
            true_positions: (0..n).map(|i| [0.0, 0.0, 0.01 + i as f64 * 1e-5]).collect(),
            noisy_b: (0..n).map(|i| [1e-3, -2e-3, 5e-3 + i as f64 * 1e-6]).collect(),
            estimated_positions: (0..n).map(|i| [0.0, 0.0, 0.0101 + i as f64 * 1e-5]).collect(),
            field_magnitude: (0..n).map(|i| 8000.0 + i as f64).collect(),
            dbx_dz_full: vec![-2.5; n],
            labels: vec![ActivityLabel::Rest; n],
            original_length: n,
            playback_rate: 100,
            sample_rate_hz: 50.0,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn valid_document_passes() {
        small_doc(10).validate().unwrap();
    }

    #[test]
    fn length_mismatch_is_fatal() {
        let mut doc = small_doc(10);
        doc.field_magnitude.pop();
        match doc.validate() {
            Err(ExportError::LengthMismatch {
                series: "field_magnitude",
                expected: 10,
                got: 9,
            }) => {}
            other => panic!("expected length mismatch, got {other:?}"),
        }
    }

    #[test]
    fn non_monotonic_time_is_fatal() {
        let mut doc = small_doc(10);
        doc.t[5] = doc.t[4];
        match doc.validate() {
            Err(ExportError::NonMonotonicTimestamps { index: 5 }) => {}
            other => panic!("expected monotonicity failure, got {other:?}"),
        }
    }

    #[test]
    fn serde_round_trip_is_exact() {
        let doc = small_doc(25);
        let json = serde_json::to_string(&doc).unwrap();
        let back: SimulationDocument = serde_json::from_str(&json).unwrap();
        // Bit-exact: serde_json emits shortest round-trippable floats.
        assert_eq!(back, doc);

        // Viewer contract field names, not the Rust ones.
        assert!(json.contains("\"noisy_B\""));
        assert!(json.contains("\"dBx_dz_full\""));
    }

    #[test]
    fn gz_file_round_trip() {
        let doc = small_doc(40);
        let path = std::env::temp_dir().join(format!("jaw_doc_{}.json.gz", std::process::id()));
        doc.write_json_gz(&path).unwrap();
        let back = SimulationDocument::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back, doc);
    }

    #[test]
    fn resample_preserves_contract_and_endpoints() {
        let doc = small_doc(100);
        let small = doc.resample(20);
        small.validate().unwrap();
        assert_eq!(small.t.len(), 20);
        assert_eq!(small.original_length, 100);
        assert_eq!(small.t[0], doc.t[0]);
        assert_eq!(*small.t.last().unwrap(), *doc.t.last().unwrap());

        // Not smaller: untouched.
        assert_eq!(doc.resample(0), doc);
        assert_eq!(doc.resample(200), doc);
    }

    #[test]
    fn degenerate_resample_targets_keep_the_document_intact() {
        // A single point leaves nothing to interpolate between; it must
        // not divide by a zero span and poison the series with NaN.
        let doc = small_doc(100);
        let one = doc.resample(1);
        assert_eq!(one, doc);
        assert!(one.t.iter().all(|v| v.is_finite()));
        one.validate().unwrap();
    }

    #[test]
    fn non_finite_timestamps_are_fatal() {
        let mut doc = small_doc(10);
        doc.t[3] = f64::NAN;
        match doc.validate() {
            Err(ExportError::NonFiniteTimestamp { index: 3 }) => {}
            other => panic!("expected finiteness failure, got {other:?}"),
        }
    }

    #[test]
    fn invalid_document_refuses_to_write() {
        let mut doc = small_doc(10);
        doc.labels.pop();
        let path = std::env::temp_dir().join("jaw_doc_should_not_exist.json");
        assert!(doc.write_json(&path).is_err());
        assert!(!path.exists());
    }
}
