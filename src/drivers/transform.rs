//! Conversion between the four value-axis representations.
//!
//! `S_n` is the canonical basis. With `rho = (s - ref_50ohm) / ref_unit_amp`:
//! - `Z = 50 * (1 + rho) / (1 - rho)`
//! - `rho = (Z - 50) / (Z + 50)`
//! - log mode stores `log10(Z)`, non-positive impedances become NaN first.
//!
//! `|rho| >= 1` is the region where the impedance is not invertible. NaN flows
//! through every conversion unchanged and nothing here can fail.
use crate::types::DisplayMode;

/// Reference impedance of the measurement system, in ohms.
pub const REFERENCE_IMPEDANCE_OHMS: f64 = 50.0;

/// Converts a whole waveform. `from == to` returns an exact copy.
pub fn convert(
    samples: &[f64],
    from: DisplayMode,
    to: DisplayMode,
    ref_50ohm: f64,
    ref_unit_amp: f64,
) -> Vec<f64> {
    if from == to {
        return samples.to_vec();
    }
    samples
        .iter()
        .map(|&v| convert_value(v, from, to, ref_50ohm, ref_unit_amp))
        .collect()
}

/// Scalar form of [`convert`], used for cursor positions.
pub fn convert_value(
    value: f64,
    from: DisplayMode,
    to: DisplayMode,
    ref_50ohm: f64,
    ref_unit_amp: f64,
) -> f64 {
    use DisplayMode::*;
    match (from, to) {
        _ if from == to => value,
        (Normalized, ReflectionCoefficient) => sn_to_rho(value, ref_50ohm, ref_unit_amp),
        (Normalized, Impedance) => rho_to_impedance(sn_to_rho(value, ref_50ohm, ref_unit_amp)),
        (Normalized, ImpedanceLog) => {
            log_impedance(rho_to_impedance(sn_to_rho(value, ref_50ohm, ref_unit_amp)))
        }
        (ReflectionCoefficient, Normalized) => rho_to_sn(value, ref_50ohm, ref_unit_amp),
        (ReflectionCoefficient, Impedance) => rho_to_impedance(value),
        (ReflectionCoefficient, ImpedanceLog) => log_impedance(rho_to_impedance(value)),
        (Impedance, Normalized) => rho_to_sn(impedance_to_rho(value), ref_50ohm, ref_unit_amp),
        (Impedance, ReflectionCoefficient) => impedance_to_rho(value),
        (Impedance, ImpedanceLog) => log_impedance(value),
        (ImpedanceLog, Impedance) => 10f64.powf(value),
        (ImpedanceLog, ReflectionCoefficient) => impedance_to_rho(10f64.powf(value)),
        (ImpedanceLog, Normalized) => {
            rho_to_sn(impedance_to_rho(10f64.powf(value)), ref_50ohm, ref_unit_amp)
        }
        // Covered by the guard above.
        (Normalized, Normalized)
        | (ReflectionCoefficient, ReflectionCoefficient)
        | (Impedance, Impedance)
        | (ImpedanceLog, ImpedanceLog) => value,
    }
}

fn sn_to_rho(sn: f64, ref_50ohm: f64, ref_unit_amp: f64) -> f64 {
    (sn - ref_50ohm) / ref_unit_amp
}

fn rho_to_sn(rho: f64, ref_50ohm: f64, ref_unit_amp: f64) -> f64 {
    rho * ref_unit_amp + ref_50ohm
}

fn rho_to_impedance(rho: f64) -> f64 {
    REFERENCE_IMPEDANCE_OHMS * (1.0 + rho) / (1.0 - rho)
}

fn impedance_to_rho(z: f64) -> f64 {
    (z - REFERENCE_IMPEDANCE_OHMS) / (z + REFERENCE_IMPEDANCE_OHMS)
}

fn log_impedance(z: f64) -> f64 {
    if z <= 0.0 {
        f64::NAN
    } else {
        z.log10()
    }
}
