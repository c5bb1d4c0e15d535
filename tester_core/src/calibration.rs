use serde::{Deserialize, Serialize};

use crate::config::{
    Features, COMPARATOR_OFFSET, C_ZERO, R_MCU_HIGH, R_MCU_LOW, R_ZERO, UREF_VCC,
};

/// Largest comparator offset (mV, either sign) accepted by a self-adjustment.
pub const MAX_COMP_OFFSET: i16 = 50;
/// Smallest difference (mV) between a Vcc and a bandgap referenced reading
/// which leads to a reference offset correction.
pub const MIN_REF_DEVIATION: i32 = 4;

/// Persistent calibration values of the tester.
///
/// Owned by the surrounding firmware and handed to the measurements as part
/// of the [`crate::MeasurementContext`]. The self-adjustments update
/// `ref_offset` and `comp_offset` in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    /// Supply voltage in mV.
    pub vcc_mv: u16,
    /// Pin resistance driving low, in 0.1 Ohms.
    pub ri_low: u16,
    /// Pin resistance driving high, in 0.1 Ohms.
    pub ri_high: u16,
    /// Resistance zero offsets in 0.01 Ohms, one per probe pair.
    pub r_zero: [u16; 3],
    /// Capacitance zero offsets in pF, one per probe pair.
    pub cap_zero: [u16; 3],
    /// Correction of the bandgap reference voltage in mV.
    pub ref_offset: i8,
    /// Offset of the analog comparator in mV.
    pub comp_offset: i8,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            vcc_mv: UREF_VCC,
            ri_low: R_MCU_LOW,
            ri_high: R_MCU_HIGH,
            r_zero: [R_ZERO; 3],
            cap_zero: [C_ZERO; 3],
            ref_offset: 0,
            comp_offset: COMPARATOR_OFFSET,
        }
    }
}

impl Calibration {
    /// Resistance zero offset for the probe pair with `index`.
    pub fn r_zero(&self, features: &Features, index: usize) -> u16 {
        match features.r_multi_offset {
            true => self.r_zero.get(index).copied().unwrap_or(self.r_zero[0]),
            false => self.r_zero[0],
        }
    }

    /// Capacitance zero offset for the probe pair with `index`.
    pub fn cap_zero(&self, features: &Features, index: usize) -> u16 {
        match features.c_multi_offset {
            true => self.cap_zero.get(index).copied().unwrap_or(self.cap_zero[0]),
            false => self.cap_zero[0],
        }
    }

    /// Apply a correction to the reference offset, saturating at the
    /// limits of the stored value.
    pub fn shift_ref_offset(&mut self, correction: i8) {
        self.ref_offset = self.ref_offset.saturating_add(correction);
    }

    /// Take over a new comparator offset if it lies within the accepted
    /// window. Returns whether the offset was taken over.
    pub fn update_comp_offset(&mut self, offset: i16) -> bool {
        if !(-MAX_COMP_OFFSET..=MAX_COMP_OFFSET).contains(&offset) {
            return false;
        }
        // the window fits into an i8
        self.comp_offset = offset as i8;
        true
    }
}

/// Reference offset correction derived from two readings of the same
/// voltage, `vcc_read` taken against Vcc and `bandgap_read` against the
/// bandgap reference currently assumed to be `bandgap_mv`.
///
/// Returns `None` for deviations of up to [`MIN_REF_DEVIATION`].
///
/// ```
/// use tester_core::calibration::ref_correction;
/// // The bandgap reads 20mV low, so the reference is about 20mV higher.
/// assert_eq!(ref_correction(1000, 980, 1080), Some(22));
/// assert_eq!(ref_correction(1000, 997, 1100), None);
/// ```
pub fn ref_correction(vcc_read: u16, bandgap_read: u16, bandgap_mv: u16) -> Option<i8> {
    let deviation = vcc_read as i32 - bandgap_read as i32;
    if deviation.abs() <= MIN_REF_DEVIATION || bandgap_read == 0 {
        return None;
    }

    let correction = deviation * bandgap_mv as i32 / bandgap_read as i32;
    Some(correction.clamp(i8::MIN as i32, i8::MAX as i32) as i8)
}
