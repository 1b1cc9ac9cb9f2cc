use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::drivers::ConsoleError;

/// Pulse period / sample spacing pairs the instrument accepts as presets.
const PRESET_TABLE: [(f64, f64); 11] = [
    (3.2, 0.2),
    (6.4, 0.4),
    (12.8, 0.8),
    (16.0, 1.0),
    (32.0, 2.0),
    (64.0, 4.0),
    (80.0, 5.0),
    (128.0, 8.0),
    (160.0, 10.0),
    (16.0, 50.0),
    (16.0, 100.0),
];

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));

/// A TDR configuration preset. Only the entries of the preset table can be constructed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TdrPreset {
    pulse_period_ns: f64,
    sample_spacing_ps: f64,
}

impl TdrPreset {
    pub fn all() -> impl Iterator<Item = TdrPreset> {
        PRESET_TABLE
            .iter()
            .map(|&(pulse_period_ns, sample_spacing_ps)| TdrPreset {
                pulse_period_ns,
                sample_spacing_ps,
            })
    }

    pub fn pulse_period_ns(&self) -> f64 {
        self.pulse_period_ns
    }

    pub fn sample_spacing_ps(&self) -> f64 {
        self.sample_spacing_ps
    }

    /// Canonical key, e.g. `16.0ns/1.0ps`.
    pub fn key(&self) -> String {
        canonical_key(self.pulse_period_ns, self.sample_spacing_ps)
    }

    /// Resolves a preset from its canonical key or a loosely formatted alias
    /// such as `16/1` or `16ns/1ps`.
    pub fn resolve(alias: &str) -> Result<TdrPreset, ConsoleError> {
        let normalized = alias.trim().to_lowercase();
        if let Some(preset) = Self::by_key(&normalized) {
            return Ok(preset);
        }
        let numbers: Vec<f64> = NUMBER
            .find_iter(&normalized)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        if let [pulse_period_ns, sample_spacing_ps, ..] = numbers[..] {
            if let Some(preset) = Self::by_key(&canonical_key(pulse_period_ns, sample_spacing_ps)) {
                return Ok(preset);
            }
        }
        Err(ConsoleError::Config(format!(
            "Unrecognized preset '{alias}'. Try one of: {}",
            sorted_keys().join(", ")
        )))
    }

    fn by_key(key: &str) -> Option<TdrPreset> {
        Self::all().find(|preset| preset.key() == key)
    }
}

impl fmt::Display for TdrPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl TryFrom<String> for TdrPreset {
    type Error = ConsoleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TdrPreset::resolve(&value)
    }
}

impl From<TdrPreset> for String {
    fn from(value: TdrPreset) -> Self {
        value.key()
    }
}

fn canonical_key(pulse_period_ns: f64, sample_spacing_ps: f64) -> String {
    format!("{pulse_period_ns:.1}ns/{sample_spacing_ps:.1}ps")
}

/// All valid preset keys in lexicographic order.
pub fn sorted_keys() -> Vec<String> {
    let mut keys: Vec<String> = TdrPreset::all().map(|preset| preset.key()).collect();
    keys.sort();
    keys
}
