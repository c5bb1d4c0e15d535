use serde::{Deserialize, Serialize};

/// MCU clock in Hz.
pub const CPU_HZ: u32 = 8_000_000;
/// ADC clock in Hz.
pub const ADC_HZ: u32 = 125_000;

/// Low value probe resistor (Rl) in Ohms.
pub const R_LOW: u32 = 680;
/// High value probe resistor (Rh) in Ohms.
pub const R_HIGH: u32 = 470_000;

/// Internal resistance of a port pin driving low, in 0.1 Ohms.
pub const R_MCU_LOW: u16 = 200;
/// Internal resistance of a port pin driving high, in 0.1 Ohms.
pub const R_MCU_HIGH: u16 = 220;
/// Resistance of probe leads and contacts, in 0.01 Ohms.
pub const R_ZERO: u16 = 20;
/// Capacitance of probe leads and wiring, in pF.
pub const C_ZERO: u16 = 43;

/// Supply voltage in mV.
pub const UREF_VCC: u16 = 5000;
/// Typical bandgap reference voltage in mV.
pub const UREF_BANDGAP: u16 = 1100;
/// Typical offset of the analog comparator in mV.
pub const COMPARATOR_OFFSET: i8 = 15;

/// Capacitance compensation factors in 0.1%, applied as
/// `C * 1000 / (1000 - factor)`.
pub const CAP_FACTOR_SMALL: i16 = 0;
pub const CAP_FACTOR_MID: i16 = -40;
pub const CAP_FACTOR_LARGE: i16 = -90;

/// A probe at or below this voltage (mV) counts as discharged.
pub const CAP_DISCHARGED: u16 = 2;
/// Number of ADC samples averaged by a regular voltage reading.
pub const ADC_SAMPLES: u8 = 25;
/// Readings below this voltage (mV) switch to the bandgap reference.
pub const AUTOSCALE_LIMIT: u16 = 1000;

/// Optional parts of the measurement, selected per board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    /// Determine the self-discharge of a capacitor as voltage loss.
    pub voltage_loss: bool,
    /// Keep a resistance zero offset per probe pair instead of one.
    pub r_multi_offset: bool,
    /// Keep a capacitance zero offset per probe pair instead of one.
    pub c_multi_offset: bool,
    /// The board carries a fixed reference capacitor. The reference and
    /// comparator offsets are adjusted with it instead of the DUT.
    pub fixed_ref_cap: bool,
}

/// How the ESR gets measured, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EsrMethod {
    /// Short pulses synchronized with the ADC's sample and hold, from 10nF.
    #[default]
    Synchronized,
    /// Older method with longer pulses, from 180nF.
    Legacy,
    Disabled,
}

/// Ceilings of every loop waiting for the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of charge pulses of the large cap measurement.
    pub charge_pulses: u16,
    /// Pulse count at which a slowly charging cap is given up.
    pub slow_charge_pulses: u16,
    /// Voltage (mV) a cap has to exceed after `slow_charge_pulses`.
    pub slow_charge_mv: u16,
    /// Voltage (mV) ending the charge pulses.
    pub target_mv: u16,
    /// A single pulse charging above this voltage (mV) means the cap is
    /// too small for the selected pulse length.
    pub single_pulse_mv: u16,
    /// Maximum voltage drop (mV) during the self-discharge check.
    pub max_drop_mv: u16,
    /// Number of ESR pulse cycles.
    pub esr_cycles: u8,
    /// Maximum number of capture timer overflows.
    pub timer_overflows: u16,
    /// Initial number of rounds the probe discharge may stall.
    pub discharge_rounds: u16,
    /// Maximum number of readings while waiting for a cap to discharge
    /// below the bandgap voltage.
    pub adjust_reads: u16,
}

impl Limits {
    pub const fn new(cpu_hz: u32) -> Self {
        Self {
            charge_pulses: 500,
            slow_charge_pulses: 126,
            slow_charge_mv: 75,
            target_mv: 300,
            single_pulse_mv: 1300,
            max_drop_mv: 100,
            esr_cycles: 255,
            // about 10 periods of a 16 bit counter at 8MHz
            timer_overflows: (cpu_hz / 5000) as u16,
            discharge_rounds: 40,
            adjust_reads: 1000,
        }
    }
}

/// Fixed reference capacitor wiring, see [`Features::fixed_ref_cap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCapWiring {
    /// ADC channel the capacitor is connected to.
    pub channel: u8,
    /// Mask of the Rh control pin on [`crate::Port::Adjust`].
    pub rh_mask: u8,
}

/// Runtime settings of the measurement core, built from the defaults above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub cpu_hz: u32,
    pub adc_hz: u32,
    pub cap_factor_small: i16,
    pub cap_factor_mid: i16,
    pub cap_factor_large: i16,
    pub features: Features,
    pub esr: EsrMethod,
    pub limits: Limits,
    pub ref_cap: Option<RefCapWiring>,
}

impl Config {
    pub const fn new(cpu_hz: u32) -> Self {
        Self {
            cpu_hz,
            adc_hz: ADC_HZ,
            cap_factor_small: CAP_FACTOR_SMALL,
            cap_factor_mid: CAP_FACTOR_MID,
            cap_factor_large: CAP_FACTOR_LARGE,
            features: Features {
                voltage_loss: false,
                r_multi_offset: false,
                c_multi_offset: false,
                fixed_ref_cap: false,
            },
            esr: EsrMethod::Synchronized,
            limits: Limits::new(cpu_hz),
            ref_cap: None,
        }
    }

    pub fn cycles_per_us(&self) -> u32 {
        self.cpu_hz / 1_000_000
    }

    pub fn cycles_per_adc(&self) -> u32 {
        self.cpu_hz / self.adc_hz
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(CPU_HZ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_clock_derivations() {
        let config = Config::default();
        assert_eq!(config.cycles_per_us(), 8);
        assert_eq!(config.cycles_per_adc(), 64);
        assert_eq!(config.limits.timer_overflows, 1600);
    }

    #[test]
    fn test_overflow_ceiling_follows_clock() {
        assert_eq!(Config::new(16_000_000).limits.timer_overflows, 3200);
    }

    #[test]
    fn test_board_selection_persists() {
        let features = Features {
            voltage_loss: true,
            fixed_ref_cap: true,
            ..Features::default()
        };
        let bytes = postcard::to_vec::<_, 8>(&(features, EsrMethod::Legacy))
            .expect("Failed to serialize board selection");
        let restored: (Features, EsrMethod) =
            postcard::from_bytes(&bytes).expect("Failed to deserialize board selection");
        assert_eq!(restored, (features, EsrMethod::Legacy));
    }
}
