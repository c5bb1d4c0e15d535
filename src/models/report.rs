use std::fmt::Display;

use common::physical::ScaledValue;
use tester_core::{Calibration, Capacitor, Component};

use super::probe_pair::ProbePair;

/// Outcome of one measurement on the bench.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub pair: ProbePair,
    pub found: Component,
    pub capacitor: Capacitor,
    /// ESR in 0.01 Ohms, if measured.
    pub esr: Option<u16>,
    pub calibration: Calibration,
}

/// `value` with an SI prefix, three significant digits.
pub fn engineering(value: f64, unit: &str) -> String {
    const PREFIXES: [(f64, &str); 7] = [
        (1e6, "M"),
        (1e3, "k"),
        (1.0, ""),
        (1e-3, "m"),
        (1e-6, "u"),
        (1e-9, "n"),
        (1e-12, "p"),
    ];
    if value == 0.0 {
        return format!("0{}", unit);
    }
    let (factor, prefix) = PREFIXES
        .iter()
        .copied()
        .find(|(factor, _)| value.abs() >= *factor)
        .unwrap_or((1e-12, "p"));
    let scaled = value / factor;
    let decimals = match scaled.abs() {
        x if x >= 100.0 => 1,
        x if x >= 10.0 => 2,
        _ => 3,
    };
    format!("{:.*}{}{}", decimals, scaled, prefix, unit)
}

fn to_f64(value: ScaledValue) -> f64 {
    value.value() as f64 * 10f64.powi(value.scale() as i32)
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cap = &self.capacitor;
        write!(f, "Probes {}: {:?}", self.pair, self.found)?;
        if cap.value == 0 && cap.raw == 0 {
            return write!(f, ", no capacitance");
        }

        let raw = ScaledValue::new(cap.raw, cap.scale);
        write!(
            f,
            ", C = {} (raw {})",
            engineering(to_f64(cap.capacitance()), "F"),
            engineering(to_f64(raw), "F")
        )?;
        if let Some(esr) = self.esr {
            write!(f, ", ESR = {}.{:02} Ohm", esr / 100, esr % 100)?;
        }
        if cap.i_leak.value() > 0 {
            write!(f, ", I_leak = {}", engineering(to_f64(cap.i_leak), "A"))?;
        }
        if cap.u_loss.value() > 0 {
            write!(f, ", U_loss = {}", cap.u_loss)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engineering() {
        assert_eq!(engineering(94.4e-6, "F"), "94.40uF");
        assert_eq!(engineering(1.2e-9, "F"), "1.200nF");
        assert_eq!(engineering(470e3, "Ohm"), "470.0kOhm");
        assert_eq!(engineering(0.0, "A"), "0A");
    }

    #[test]
    fn test_report_line() {
        let report = Report {
            pair: ProbePair::default(),
            found: Component::Capacitor,
            capacitor: Capacitor {
                a: 1,
                b: 0,
                scale: -9,
                raw: 102_990,
                value: 94_400,
                ..Capacitor::EMPTY
            },
            esr: Some(97),
            calibration: Calibration::default(),
        };
        assert_eq!(
            report.to_string(),
            "Probes 1-2: Capacitor, C = 94.40uF (raw 103.0uF), ESR = 0.97 Ohm"
        );
    }

    #[test]
    fn test_empty_report() {
        let report = Report {
            pair: ProbePair::default(),
            found: Component::None,
            capacitor: Capacitor::EMPTY,
            esr: None,
            calibration: Calibration::default(),
        };
        assert_eq!(report.to_string(), "Probes 1-2: None, no capacitance");
    }
}
