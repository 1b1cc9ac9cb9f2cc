// src/types.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::drivers::preset::TdrPreset;

/// One acquired waveform plus the acquisition metadata needed to interpret it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub samples: Vec<f64>,
    pub sample_spacing_ps: f64,
    pub pulse_period_ns: f64,
    pub ref_50ohm: f64,
    pub ref_unit_amp: f64,
}

impl Frame {
    pub fn epoch(&self) -> ConfigEpoch {
        ConfigEpoch {
            sample_spacing_ps: self.sample_spacing_ps,
            pulse_period_ns: self.pulse_period_ns,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time axis in picoseconds: `index * sample_spacing_ps`.
    pub fn time_axis_ps(&self) -> Vec<f64> {
        (0..self.samples.len())
            .map(|i| i as f64 * self.sample_spacing_ps)
            .collect()
    }
}

/// Identity of a configuration interval. Frames from different epochs are never averaged together.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigEpoch {
    pub sample_spacing_ps: f64,
    pub pulse_period_ns: f64,
}

/// Physical representation used for the value axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Raw normalized samples (S_n).
    #[default]
    Normalized,
    /// Reflection coefficient (rho).
    #[serde(alias = "rho")]
    ReflectionCoefficient,
    /// Characteristic impedance in ohms.
    Impedance,
    /// Impedance plotted as log10(Z).
    #[serde(alias = "impedance-log")]
    ImpedanceLog,
}

impl DisplayMode {
    pub const ALL: [DisplayMode; 4] = [
        DisplayMode::Normalized,
        DisplayMode::ReflectionCoefficient,
        DisplayMode::Impedance,
        DisplayMode::ImpedanceLog,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DisplayMode::Normalized => "Sn",
            DisplayMode::ReflectionCoefficient => "Γ",
            DisplayMode::Impedance | DisplayMode::ImpedanceLog => "Ω",
        }
    }

    /// Whether stored values are log10 of the physical quantity.
    pub fn is_log(self) -> bool {
        matches!(self, DisplayMode::ImpedanceLog)
    }

    pub fn name(self) -> &'static str {
        match self {
            DisplayMode::Normalized => "normalized",
            DisplayMode::ReflectionCoefficient => "rho",
            DisplayMode::Impedance => "impedance",
            DisplayMode::ImpedanceLog => "impedance-log",
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normalized" | "sn" | "s_n" => Ok(DisplayMode::Normalized),
            "rho" | "reflection" | "reflection-coefficient" | "reflection_coefficient" => {
                Ok(DisplayMode::ReflectionCoefficient)
            }
            "impedance" | "z" => Ok(DisplayMode::Impedance),
            "impedance-log" | "impedance_log" | "logz" | "log-impedance" => {
                Ok(DisplayMode::ImpedanceLog)
            }
            other => {
                let known: Vec<&str> = DisplayMode::ALL.iter().map(|mode| mode.name()).collect();
                Err(format!(
                    "unknown display mode '{other}' (expected one of {})",
                    known.join(", ")
                ))
            }
        }
    }
}

// 连接模式
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ConnectionMode {
    Simulation,
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient: a listener failed and the link is being torn down.
    Errored,
}

/// Full instrument state as returned by `GetState()`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub acquiring: bool,
    #[serde(default)]
    pub acquisition_stalled: bool,
    #[serde(default)]
    pub pulse_period_ns: Option<f64>,
    #[serde(default)]
    pub sample_spacing_ps: Option<f64>,
    #[serde(default)]
    pub configuration_preset: Option<TdrPreset>,
}

impl InstrumentState {
    /// Acquisition can only be enabled once both timing parameters are known.
    pub fn has_configuration(&self) -> bool {
        self.pulse_period_ns.is_some() && self.sample_spacing_ps.is_some()
    }

    /// Preset selector text: the preset key, `Custom`, or nothing at all.
    pub fn preset_label(&self) -> Option<String> {
        match self.configuration_preset {
            Some(preset) => Some(preset.key()),
            None if self.has_configuration() => Some("Custom".to_owned()),
            None => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TdrConfiguration {
    pub pulse_period_ns: f64,
    pub sample_spacing_ps: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TdrWorkingState {
    pub acquisition_enabled: bool,
    pub acquiring: bool,
    #[serde(default)]
    pub acquisition_stalled: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedId {
    Red,
    Green,
    Blue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    pub led_id: LedId,
    pub brightness: u8,
}

impl LedState {
    pub const FULL_BRIGHTNESS: u8 = 255;

    pub fn is_lit(&self) -> bool {
        self.brightness == Self::FULL_BRIGHTNESS
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedSelectors {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
}

impl LedSelectors {
    pub fn red_only() -> Self {
        Self {
            red: true,
            green: false,
            blue: false,
        }
    }

    pub fn selects(&self, led: LedId) -> bool {
        match led {
            LedId::Red => self.red,
            LedId::Green => self.green,
            LedId::Blue => self.blue,
        }
    }
}

/// The three blocking listen operations, one ingestion thread each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Listener {
    StateEvents,
    SampleStream,
    LedState,
}

impl Listener {
    pub fn thread_name(self) -> &'static str {
        match self {
            Listener::StateEvents => "state_event_worker",
            Listener::SampleStream => "sample_stream_worker",
            Listener::LedState => "led_state_worker",
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Listener::StateEvents => "state event",
            Listener::SampleStream => "sample stream",
            Listener::LedState => "led state",
        };
        f.write_str(name)
    }
}

// 后台发给控制台的消息
#[derive(Clone, Debug)]
pub enum ConsoleEvent {
    /// An averaged frame was pushed to the handoff queue.
    FrameReady,
    StateChanged(InstrumentState),
    LedChanged(LedState),
    /// A listener failed while the link was intentionally running.
    StreamFailed { listener: Listener, detail: String },
}
