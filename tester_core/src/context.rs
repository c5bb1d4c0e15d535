use common::physical::{Permille, ScaledValue};
use core::cmp::Ordering;
use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::{
    calibration::Calibration,
    config::{ADC_SAMPLES, UREF_BANDGAP},
    hardware::Reference,
    probes::ProbeAssignment,
};

/// Kind of component found on the probes, ordered by precedence. A finding
/// is only ever replaced by one of higher precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Component {
    #[default]
    None,
    Error,
    Resistor,
    Capacitor,
    Diode,
    Bjt,
    Fet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resistor {
    pub a: u8,
    pub b: u8,
    /// Resistance in Ohms.
    pub value: ScaledValue,
}

impl Resistor {
    /// Check if the resistor sits between both probes, in any direction.
    pub fn connects(&self, probe_1: u8, probe_2: u8) -> bool {
        (self.a == probe_1 && self.b == probe_2) || (self.a == probe_2 && self.b == probe_1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diode {
    pub anode: u8,
    pub cathode: u8,
    /// Forward voltage in mV.
    pub v_f: u16,
}

/// Results of the component checks run so far.
#[derive(Debug, Clone, Default)]
pub struct Check {
    pub found: Component,
    pub resistors: Vec<Resistor, 3>,
    pub diodes: Vec<Diode, 6>,
}

impl Check {
    /// Diode with its anode at `anode` and cathode at `cathode`.
    pub fn search_diode(&self, anode: u8, cathode: u8) -> Option<&Diode> {
        self.diodes
            .iter()
            .find(|diode| diode.anode == anode && diode.cathode == cathode)
    }

    /// Check for a resistor below 10 Ohms between both probes. Such a
    /// resistor may be a large capacitor in disguise.
    pub fn has_low_resistance(&self, probe_1: u8, probe_2: u8) -> bool {
        self.resistors.iter().any(|resistor| {
            resistor.connects(probe_1, probe_2)
                && resistor.value.cmp_to(10, 0) == Ordering::Less
        })
    }
}

/// State of the ADC shared by all readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcSettings {
    /// Supply voltage in mV.
    pub vcc_mv: u16,
    /// Bandgap reference voltage in mV, offset already applied.
    pub bandgap_mv: u16,
    /// Reference used by the last conversion, `None` after power up.
    pub reference: Option<Reference>,
    /// Number of samples of a regular reading.
    pub samples: u8,
    /// Switch to the bandgap reference for low voltages.
    pub auto_scale: bool,
}

impl Default for AdcSettings {
    fn default() -> Self {
        Self {
            vcc_mv: crate::config::UREF_VCC,
            bandgap_mv: UREF_BANDGAP,
            reference: None,
            samples: ADC_SAMPLES,
            auto_scale: true,
        }
    }
}

/// Measured capacitor.
///
/// The capacitance is `value * 10^scale` Farad, `raw` holds the value before
/// the zero offset got subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacitor {
    /// Probe pulled down during the measurement.
    pub a: u8,
    /// Probe pulled up during the measurement.
    pub b: u8,
    pub scale: i8,
    pub raw: u32,
    pub value: u32,
    /// Leakage current in A.
    pub i_leak: ScaledValue,
    /// Voltage loss caused by self-discharge.
    pub u_loss: Permille,
}

impl Capacitor {
    pub const EMPTY: Self = Self {
        a: 0,
        b: 0,
        scale: -12,
        raw: 0,
        value: 0,
        i_leak: ScaledValue::new(0, 0),
        u_loss: Permille::ZERO,
    };

    pub fn capacitance(&self) -> ScaledValue {
        ScaledValue::new(self.value, self.scale)
    }
}

impl Default for Capacitor {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Everything a measurement reads and updates besides the hardware.
#[derive(Debug, Clone)]
pub struct MeasurementContext {
    pub calibration: Calibration,
    pub adc: AdcSettings,
    pub check: Check,
    pub probes: ProbeAssignment,
    pub caps: [Capacitor; 3],
}

impl MeasurementContext {
    /// Build the context for a session. `bandgap_mv` is the uncorrected
    /// bandgap voltage, the calibrated reference offset is applied here.
    pub fn new(calibration: Calibration, bandgap_mv: u16) -> Self {
        let bandgap_mv = (bandgap_mv as i32 + calibration.ref_offset as i32).max(0) as u16;
        Self {
            adc: AdcSettings {
                vcc_mv: calibration.vcc_mv,
                bandgap_mv,
                ..AdcSettings::default()
            },
            calibration,
            check: Check::default(),
            probes: ProbeAssignment::new(0, 1),
            caps: [Capacitor::EMPTY; 3],
        }
    }
}

impl Default for MeasurementContext {
    fn default() -> Self {
        Self::new(Calibration::default(), UREF_BANDGAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_precedence() {
        assert!(Component::None < Component::Error);
        assert!(Component::Error < Component::Resistor);
        assert!(Component::Resistor < Component::Capacitor);
        assert!(Component::Capacitor < Component::Diode);
        assert!(Component::Diode < Component::Bjt);
    }

    #[test]
    fn test_low_resistance_between_probes() {
        let mut check = Check::default();
        let _ = check.resistors.push(Resistor {
            a: 2,
            b: 0,
            value: ScaledValue::new(47, -1),
        });
        let _ = check.resistors.push(Resistor {
            a: 1,
            b: 2,
            value: ScaledValue::new(10, 0),
        });

        assert!(check.has_low_resistance(0, 2));
        assert!(check.has_low_resistance(2, 0));
        assert!(!check.has_low_resistance(1, 2));
        assert!(!check.has_low_resistance(0, 1));
    }

    #[test]
    fn test_search_diode_respects_direction() {
        let mut check = Check::default();
        let _ = check.diodes.push(Diode {
            anode: 0,
            cathode: 1,
            v_f: 650,
        });

        assert_eq!(check.search_diode(0, 1).map(|d| d.v_f), Some(650));
        assert!(check.search_diode(1, 0).is_none());
    }

    #[test]
    fn test_context_applies_reference_offset() {
        let calibration = Calibration {
            ref_offset: -12,
            ..Calibration::default()
        };
        let ctx = MeasurementContext::new(calibration, 1100);
        assert_eq!(ctx.adc.bandgap_mv, 1088);
        assert_eq!(ctx.adc.vcc_mv, 5000);
    }
}
