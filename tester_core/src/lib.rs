#![cfg_attr(not(test), no_std)]

//! Capacitance and ESR measurement core of a three probe component tester.
//!
//! The engines only talk to the hardware through the driver traits in
//! [`hardware`], so the same code runs on the MCU and against a simulated
//! bench on the host. All state shared with the rest of the firmware lives in
//! a [`MeasurementContext`] which is handed to every measurement.

pub mod adc;
pub mod adjust;
pub mod calibration;
pub mod config;
pub mod context;
pub mod error;
pub mod esr;
pub mod factor;
pub mod hardware;
pub mod large_cap;
pub mod measure;
pub mod probes;
pub mod small_cap;

#[cfg(test)]
mod mock;

pub use calibration::Calibration;
pub use config::{Config, EsrMethod, Features, Limits};
pub use context::{AdcSettings, Capacitor, Check, Component, Diode, MeasurementContext, Resistor};
pub use error::MeasureError;
pub use esr::ESR_NONE;
pub use hardware::{
    AdcDriver, AnalogComparator, Board, CaptureTimer, CycleTimer, PinDriver, Port, Reference,
    TimerFlags,
};
pub use measure::CapOutcome;

/// The measurement engines bound to one board.
///
/// The tester owns the board exclusively: no other routine can touch the
/// ADC, comparator or timers while a measurement runs, and every public
/// measurement leaves them in the idle configuration again.
pub struct Tester<B: Board> {
    board: B,
    config: Config,
}

impl<B: Board> Tester<B> {
    pub fn new(board: B, config: Config) -> Self {
        Self { board, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    /// Give the board back, e.g. to hand it to another measurement routine.
    pub fn release(self) -> B {
        self.board
    }
}
