pub mod calibration;
pub mod classifier;
pub mod config;
pub mod export;
pub mod field_model;
pub mod filters;
pub mod pipeline;
pub mod synth;
pub mod types;

pub use classifier::{FeatureExtractor, FeatureVector, WindowClassifier, WindowDecision};
pub use config::SessionConfig;
pub use export::{ExportError, SimulationDocument};
pub use field_model::CuboidMagnet;
pub use filters::ekf::{JawEkf, JawEkfState, UpdateOutcome};
pub use pipeline::{run_session, simulate_session, PipelineEvent, SessionOutcome};
pub use synth::{bruxism_session, scripted_trajectory, JawPhase, MeasurementSynthesizer};
pub use types::{ActivityLabel, FieldSample, ImuSample, Pose, TrajectorySample};
