// src/recorder.rs
//! CSV interchange for a single displayed frame.
//!
//! Layout:
//! ```text
//! #ref_50ohm = 0.5
//! #ref_unit_amp = 0.25
//! Time[sec],Sn
//! 0.000000000000e+00,5.000000e-01
//! ```
//! The value column is always raw `S_n`, whatever the display mode.
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::drivers::ConsoleError;
use crate::types::Frame;

pub const CSV_HEADER: &str = "Time[sec],Sn";

static REF_50OHM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#ref_50ohm\s*=\s*([\d.eE+-]+)").expect("valid regex"));
static REF_UNIT_AMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#ref_unit_amp\s*=\s*([\d.eE+-]+)").expect("valid regex"));

/// `mtdr_YYYYmmdd_HHMMSS.csv` in local time.
pub fn default_file_name() -> String {
    Local::now().format("mtdr_%Y%m%d_%H%M%S.csv").to_string()
}

pub fn write_csv<W: Write>(mut writer: W, frame: &Frame) -> Result<(), ConsoleError> {
    writeln!(writer, "#ref_50ohm = {}", frame.ref_50ohm)?;
    writeln!(writer, "#ref_unit_amp = {}", frame.ref_unit_amp)?;
    writeln!(writer, "{CSV_HEADER}")?;
    for (idx, sample) in frame.samples.iter().enumerate() {
        let time_sec = idx as f64 * frame.sample_spacing_ps * 1e-12;
        writeln!(
            writer,
            "{},{}",
            format_scientific(time_sec, 12),
            format_scientific(*sample, 6)
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_csv(path: impl AsRef<Path>, frame: &Frame) -> Result<(), ConsoleError> {
    let file = File::create(path.as_ref())?;
    write_csv(BufWriter::new(file), frame)
}

pub fn read_csv<R: Read>(reader: R) -> Result<Frame, ConsoleError> {
    let lines = BufReader::new(reader)
        .lines()
        .collect::<Result<Vec<_>, _>>()?;

    let mut ref_50ohm = None;
    let mut ref_unit_amp = None;
    for line in lines.iter().filter(|l| l.starts_with('#')) {
        if let Some(caps) = REF_50OHM.captures(line) {
            ref_50ohm = caps[1].parse::<f64>().ok();
        }
        if let Some(caps) = REF_UNIT_AMP.captures(line) {
            ref_unit_amp = caps[1].parse::<f64>().ok();
        }
    }

    let header_idx = lines
        .iter()
        .position(|l| l.trim() == CSV_HEADER)
        .ok_or_else(|| ConsoleError::Csv(format!("missing header: {CSV_HEADER}")))?;
    let (Some(ref_50ohm), Some(ref_unit_amp)) = (ref_50ohm, ref_unit_amp) else {
        return Err(ConsoleError::Csv(
            "missing ref_50ohm or ref_unit_amp in comments".into(),
        ));
    };

    let mut times = Vec::new();
    let mut samples = Vec::new();
    for line in lines[header_idx + 1..].iter().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split(',').map(|f| f.trim().parse::<f64>());
        match (fields.next(), fields.next(), fields.next()) {
            (Some(Ok(t)), Some(Ok(v)), None) => {
                times.push(t);
                samples.push(v);
            }
            _ => return Err(ConsoleError::Csv(format!("invalid data row '{line}'"))),
        }
    }
    if times.len() < 2 {
        return Err(ConsoleError::Csv("at least two data rows are required".into()));
    }

    let sample_spacing_ps = (times[1] - times[0]) * 1e12;
    let pulse_period_ns = times.len() as f64 * sample_spacing_ps / 1000.0;
    Ok(Frame {
        samples,
        sample_spacing_ps,
        pulse_period_ns,
        ref_50ohm,
        ref_unit_amp,
    })
}

pub fn load_csv(path: impl AsRef<Path>) -> Result<Frame, ConsoleError> {
    read_csv(File::open(path.as_ref())?)
}

/// printf-style `%.Ne`: two-digit signed exponent.
fn format_scientific(value: f64, precision: usize) -> String {
    let formatted = format!("{value:.precision$e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}
