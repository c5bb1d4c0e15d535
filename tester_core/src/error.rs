use thiserror_no_std::Error;

/// Conditions aborting a measurement early.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MeasureError {
    #[error("Probe {probe} does not discharge, stuck at {voltage}mV")]
    Discharge { probe: u8, voltage: u16 },
    #[error("Delay of {0} MCU cycles is too short for the delay timer")]
    DelayTooShort(u32),
    #[error("Delay of {0} MCU cycles exceeds the delay timer")]
    DelayTooLong(u32),
}
