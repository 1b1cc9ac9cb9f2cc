// src/tools.rs
//! One-shot operations over the instrument RPC set, used by the CLI
//! subcommands that do not need a live console.
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use log::{info, warn};
use serde::Serialize;

use crate::drivers::preset::sorted_keys;
use crate::drivers::{CancelToken, ConsoleError, Instrument, TdrPreset};
use crate::types::{Frame, TdrConfiguration, TdrWorkingState};

const PING_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_SAMPLES: usize = 16_000;

/// `"ready"` or `"error: <detail>"`.
pub fn ping(instrument: &dyn Instrument) -> String {
    match instrument.is_ready(PING_TIMEOUT) {
        Ok(()) => "ready".to_owned(),
        Err(err) => format!("error: {err}"),
    }
}

pub fn list_presets() -> Vec<String> {
    sorted_keys()
}

/// Resolves and applies a preset, then reads the configuration back. A failed
/// read-back is logged and reported as `None`.
pub fn configure_preset(
    instrument: &dyn Instrument,
    alias: &str,
) -> Result<Option<TdrConfiguration>, ConsoleError> {
    let preset = TdrPreset::resolve(alias)?;
    info!("Configuring TDR preset: {preset}");
    instrument.configure_tdr_preset(preset)?;
    match instrument.tdr_configuration() {
        Ok(config) => Ok(Some(config)),
        Err(err) => {
            warn!("configuration read-back failed: {err}");
            Ok(None)
        }
    }
}

pub fn read_configuration(instrument: &dyn Instrument) -> Option<TdrConfiguration> {
    instrument.tdr_configuration().ok()
}

pub fn enable_tdr(
    instrument: &dyn Instrument,
    enable: bool,
) -> Result<TdrWorkingState, ConsoleError> {
    info!("{} TDR", if enable { "Enabling" } else { "Disabling" });
    instrument.enable_tdr(enable)?;
    instrument.tdr_working_state()
}

/// Configures the slowest preset if nothing is configured, then enables
/// acquisition if it is not already running.
pub fn ensure_acquiring(instrument: &dyn Instrument) -> Result<(), ConsoleError> {
    let state = instrument.state()?;
    if !state.has_configuration() {
        let fallback = TdrPreset::resolve("16.0ns/100.0ps")?;
        info!("Configuring TDR preset: {fallback}");
        instrument.configure_tdr_preset(fallback)?;
    }
    if !state.acquiring {
        enable_tdr(instrument, true)?;
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    pub include_samples: bool,
    pub max_samples: usize,
    pub timeout: Duration,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            include_samples: false,
            max_samples: DEFAULT_MAX_SAMPLES,
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SampleSummary {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapshotMetadata {
    pub sample_spacing_ps: f64,
    pub pulse_period_ns: f64,
    pub ref_50ohm: f64,
    pub ref_unit_amp: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub count: usize,
    pub summary: SampleSummary,
    pub metadata: SnapshotMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<f64>>,
}

impl Snapshot {
    pub fn from_frame(frame: &Frame, options: &SnapshotOptions) -> Self {
        let summary = if frame.is_empty() {
            SampleSummary::default()
        } else {
            let min = frame.samples.iter().copied().fold(f64::INFINITY, f64::min);
            let max = frame.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mean = frame.samples.iter().sum::<f64>() / frame.len() as f64;
            SampleSummary {
                min: Some(min),
                max: Some(max),
                mean: Some(mean),
            }
        };
        let samples = options.include_samples.then(|| {
            frame
                .samples
                .iter()
                .take(options.max_samples)
                .map(|v| (v * 10.0).round() / 10.0)
                .collect()
        });
        Self {
            count: frame.len(),
            summary,
            metadata: SnapshotMetadata {
                sample_spacing_ps: frame.sample_spacing_ps,
                pulse_period_ns: frame.pulse_period_ns,
                ref_50ohm: frame.ref_50ohm,
                ref_unit_amp: frame.ref_unit_amp,
            },
            samples,
        }
    }
}

/// Takes exactly one frame off the sample stream. The listener is cancelled
/// afterwards whatever the outcome, and after `timeout` if nothing arrives.
pub fn capture_frame(
    instrument: &dyn Instrument,
    timeout: Duration,
) -> Result<Frame, ConsoleError> {
    let cancel = CancelToken::new();
    let mut stream = instrument.listen_sample_stream(&cancel)?;
    let (done_tx, done_rx) = channel::bounded::<()>(1);
    let watchdog_cancel = cancel.clone();
    let watchdog = thread::Builder::new()
        .name("snapshot_watchdog".to_owned())
        .spawn(move || {
            if done_rx.recv_timeout(timeout).is_err() {
                watchdog_cancel.cancel();
            }
        })?;

    let result = stream.next_item();
    done_tx.send(()).ok();
    cancel.cancel();
    if watchdog.join().is_err() {
        warn!("snapshot watchdog panicked");
    }
    result.map_err(|err| match err {
        ConsoleError::Cancelled => {
            ConsoleError::Transport(format!("no frame within {}ms", timeout.as_millis()))
        }
        other => other,
    })
}

pub fn snapshot(
    instrument: &dyn Instrument,
    options: &SnapshotOptions,
) -> Result<Snapshot, ConsoleError> {
    let frame = capture_frame(instrument, options.timeout)?;
    Ok(Snapshot::from_frame(&frame, options))
}
