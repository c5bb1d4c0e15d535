//! Factor tables turning charge time into capacitance.
//!
//! Charging a capacitor through a resistor to a voltage `U` takes
//! `t = -R * C * ln(1 - U / Vcc)`, so `C = t * factor(U)`. The tables hold
//! that factor for a range of target voltages and get interpolated linearly
//! in between.

/// Factor table over evenly spaced voltages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactorTable {
    /// Voltage of the first entry in mV.
    pub start_mv: u16,
    /// Voltage step between two entries in mV.
    pub step_mv: u16,
    pub factors: &'static [u16],
}

/// Charging via Rl with pulses of 10ms, from 300mV in 25mV steps.
/// The factor gives nF per pulse times ten.
pub const LARGE_CAP: FactorTable = FactorTable {
    start_mv: 300,
    step_mv: 25,
    factors: &[
        23022, 21195, 19629, 18272, 17084, 16036, 15104, 14271, 13520, 12841, 12224, 11660, 11143,
        10668, 10229, 9822, 9445, 9093, 8765, 8458, 8170, 7900, 7645, 7405, 7178, 6963, 6760, 6567,
        6384, 6209, 6043, 5885, 5733, 5589, 5450, 5318, 5191, 5069, 4952, 4839, 4731, 4627, 4526,
        4430, 4336,
    ],
};

/// Charging via Rh up to the bandgap voltage, from 1000mV in 50mV steps.
pub const SMALL_CAP: FactorTable = FactorTable {
    start_mv: 1000,
    step_mv: 50,
    factors: &[954, 903, 856, 814, 775, 740, 707, 676, 648],
};

impl FactorTable {
    /// Voltage of the last entry in mV.
    pub fn end_mv(&self) -> u16 {
        self.start_mv + self.step_mv * (self.factors.len() as u16).saturating_sub(1)
    }

    /// Factor for `u_mv`, interpolated between the neighbouring entries.
    /// Voltages outside the table get the factor of the nearest end.
    ///
    /// ```
    /// use tester_core::factor::SMALL_CAP;
    /// assert_eq!(SMALL_CAP.factor(1000), 954);
    /// assert_eq!(SMALL_CAP.factor(1025), 928);
    /// assert_eq!(SMALL_CAP.factor(2000), 648);
    /// ```
    pub fn factor(&self, u_mv: u16) -> u16 {
        let u = u_mv.clamp(self.start_mv, self.end_mv()) - self.start_mv;
        let index = (u / self.step_mv) as usize;
        let remainder = (u % self.step_mv) as u32;

        let (Some(&upper), Some(&lower)) = (self.factors.get(index), self.factors.get(index + 1))
        else {
            return self.factors.last().copied().unwrap_or(0);
        };

        let diff = upper.saturating_sub(lower) as u32;
        let step = self.step_mv as u32;
        upper - ((diff * remainder + step / 2) / step) as u16
    }
}
