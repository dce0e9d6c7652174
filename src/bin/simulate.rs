use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use jaw_tracker_rs::pipeline::{run_session, PipelineEvent};
use jaw_tracker_rs::synth::{bruxism_session, scripted_trajectory, JawPhase, MeasurementSynthesizer};
use jaw_tracker_rs::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "simulate")]
#[command(about = "Run the scripted bruxism session and export the viewer document", long_about = None)]
struct Args {
    /// Output path (.json or .json.gz)
    #[arg(long, default_value = "simulation_data.json")]
    output: PathBuf,

    /// Noise seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Seconds per phase (rest, grinding, clenching)
    #[arg(long, default_value = "5.0")]
    phase_secs: f64,

    /// Grinding cycle frequency [Hz]
    #[arg(long)]
    grinding_freq: Option<f64>,

    /// Synthesize and fuse IMU observations
    #[arg(long, default_value_t = false)]
    enable_imu: bool,

    /// Keep full resolution instead of downsampling for playback
    #[arg(long, default_value_t = false)]
    full_resolution: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = SessionConfig::default();
    config.enable_imu = args.enable_imu;
    if let Some(f) = args.grinding_freq {
        config.grinding_freq_hz = f;
    }

    let trajectory = if (args.phase_secs - 5.0).abs() < f64::EPSILON {
        bruxism_session(&config)
    } else {
        scripted_trajectory(
            &[
                (JawPhase::Rest, args.phase_secs),
                (JawPhase::Grinding, args.phase_secs),
                (JawPhase::Clenching, args.phase_secs),
            ],
            &config,
        )
    };
    log::info!(
        "synthesizing {} samples at {} Hz (seed {})",
        trajectory.len(),
        config.sample_rate_hz,
        args.seed
    );
    let samples = MeasurementSynthesizer::new(&config, args.seed).synthesize(&trajectory);
    let outcome = run_session(&config, &samples);

    for (label, count) in outcome.label_counts() {
        println!("  {:>9}: {count} samples", label.as_str());
    }
    let skipped = outcome.final_state.skipped_corrections;
    if skipped > 0 {
        println!("  skipped corrections: {skipped}");
    }
    for event in &outcome.events {
        if let PipelineEvent::DivergenceWarning {
            timestamp,
            consecutive_skips,
        } = event
        {
            println!("  divergence warning at t={timestamp:.2}s ({consecutive_skips} skips)");
        }
    }

    let document = if args.full_resolution {
        outcome.document
    } else {
        outcome.document.resample(config.playback_points)
    };
    let gz = args
        .output
        .extension()
        .map(|e| e == "gz")
        .unwrap_or(false);
    if gz {
        document.write_json_gz(&args.output)
    } else {
        document.write_json(&args.output)
    }
    .with_context(|| format!("writing {}", args.output.display()))?;

    println!(
        "wrote {} ({} of {} samples)",
        args.output.display(),
        document.t.len(),
        document.original_length
    );
    Ok(())
}
