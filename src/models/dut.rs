use std::str::FromStr;

use derive_more::Display;
use thiserror::Error;

/// Lowest ESR of a simulated capacitor in Ohms.
pub const MIN_ESR: f64 = 0.01;

/// Device under test between two probes.
///
/// Written and parsed as `open`, `r=<ohm>` or
/// `c=<farad>[,esr=<ohm>][,leak=<ohm>]`, values taking the SI prefixes
/// p, n, u, m, k and M.
#[derive(Debug, Display, Clone, Copy, PartialEq)]
pub enum Dut {
    #[display(fmt = "open")]
    Open,
    #[display(fmt = "r={}", _0)]
    Resistor(f64),
    /// Capacitor with its series resistance and a parallel leakage
    /// resistance, infinite for none.
    #[display(fmt = "c={},esr={},leak={}", farad, esr, leakage)]
    Capacitor { farad: f64, esr: f64, leakage: f64 },
}

#[derive(Error, Debug, PartialEq)]
pub enum DutError {
    #[error("Invalid value '{0}'")]
    InvalidValue(String),
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("Either a capacitance (c=) or a resistance (r=) is required")]
    MissingKind,
    #[error("Values must be positive")]
    NotPositive,
}

/// Parse a number with an optional SI prefix.
pub fn parse_si(text: &str) -> Result<f64, DutError> {
    let text = text.trim();
    let (number, factor) = match text.chars().last() {
        Some('p') => (&text[..text.len() - 1], 1e-12),
        Some('n') => (&text[..text.len() - 1], 1e-9),
        Some('u') => (&text[..text.len() - 1], 1e-6),
        Some('m') => (&text[..text.len() - 1], 1e-3),
        Some('k') => (&text[..text.len() - 1], 1e3),
        Some('M') => (&text[..text.len() - 1], 1e6),
        _ => (text, 1.0),
    };
    let value = number
        .parse::<f64>()
        .map_err(|_| DutError::InvalidValue(text.to_string()))?;
    Ok(value * factor)
}

impl FromStr for Dut {
    type Err = DutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("open") {
            return Ok(Dut::Open);
        }

        let mut farad = None;
        let mut ohm = None;
        let mut esr = MIN_ESR;
        let mut leakage = f64::INFINITY;
        for part in s.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| DutError::InvalidValue(part.to_string()))?;
            let value = parse_si(value)?;
            if value.is_nan() || value <= 0.0 {
                return Err(DutError::NotPositive);
            }
            match key.trim() {
                "c" => farad = Some(value),
                "r" => ohm = Some(value),
                "esr" => esr = value.max(MIN_ESR),
                "leak" => leakage = value,
                other => return Err(DutError::UnknownParameter(other.to_string())),
            }
        }

        match (farad, ohm) {
            (Some(farad), _) => Ok(Dut::Capacitor {
                farad,
                esr,
                leakage,
            }),
            (None, Some(ohm)) => Ok(Dut::Resistor(ohm)),
            (None, None) => Err(DutError::MissingKind),
        }
    }
}
