use embedded_hal::{
    blocking::delay::{DelayMs, DelayUs},
    watchdog::Watchdog,
};

/// The groups of pins the probes are wired to. Every group is written as a
/// whole byte, bit `n` controls the pin with mask `1 << n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Pins tied directly to the probes, they double as ADC inputs.
    Probe,
    /// Pins driving the probes through the 680 Ohm and 470 kOhm resistors.
    Resistor,
    /// Pin driving the optional fixed reference capacitor through its own
    /// 470 kOhm resistor.
    Adjust,
}

/// Digital side of the probe wiring.
///
/// A pin is driven when its direction bit is set and then follows its level
/// bit. With the direction bit cleared it is high impedance and a set level
/// bit has no effect.
pub trait PinDriver {
    fn set_direction(&mut self, port: Port, mask: u8);
    fn set_level(&mut self, port: Port, mask: u8);
}

/// Reference voltage of the ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// The supply voltage.
    Vcc,
    /// Internal bandgap reference, about 1.1V.
    Bandgap,
}

/// 10 bit successive approximation ADC with an input multiplexer.
pub trait AdcDriver {
    /// Route `channel` to the converter and select the reference.
    fn select(&mut self, channel: u8, reference: Reference);
    fn start_conversion(&mut self);
    /// Poll the converter, true once the started conversion has finished.
    fn conversion_done(&mut self) -> bool;
    /// Result of the last finished conversion.
    fn result(&mut self) -> u16;
    /// Power the converter up or down. While it is down the analog comparator
    /// may use the input multiplexer.
    fn set_enabled(&mut self, enabled: bool);
}

/// Analog comparator with the bandgap reference on its positive input. The
/// comparator output triggers the input capture of the [`CaptureTimer`].
pub trait AnalogComparator {
    /// Compare the voltage on `channel` against the bandgap reference.
    fn connect_comparator(&mut self, channel: u8);
    fn disconnect_comparator(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerFlags {
    /// The comparator tripped and the counter was captured.
    pub capture: bool,
    /// The counter wrapped around.
    pub overflow: bool,
}

/// 16 bit timer running at the MCU clock with input capture.
pub trait CaptureTimer {
    /// Stop the timer, zero the counter and clear all flags.
    fn reset_timer(&mut self);
    fn start_timer(&mut self);
    fn stop_timer(&mut self);
    fn timer_flags(&mut self) -> TimerFlags;
    /// Clear the flags set in `flags`.
    fn clear_timer_flags(&mut self, flags: TimerFlags);
    /// Counter value latched by the last capture event.
    fn captured_ticks(&self) -> u16;
    /// Current counter value.
    fn timer_ticks(&self) -> u16;
}

/// 8 bit timer for short delays synchronized to the ADC clock.
pub trait CycleTimer {
    /// Compare value in MCU cycles, excluding the fixed cost of a run.
    fn set_cycles(&mut self, cycles: u8);
    /// Run the timer once up to the compare value and stop it again.
    fn run_cycles(&mut self);
    fn stop_cycles(&mut self);
}

/// Everything a measurement needs from the board.
pub trait Board:
    PinDriver
    + AdcDriver
    + AnalogComparator
    + CaptureTimer
    + CycleTimer
    + DelayUs<u16>
    + DelayMs<u16>
    + Watchdog
{
}

impl<T> Board for T where
    T: PinDriver
        + AdcDriver
        + AnalogComparator
        + CaptureTimer
        + CycleTimer
        + DelayUs<u16>
        + DelayMs<u16>
        + Watchdog
{
}

/// Put the board back into its idle configuration: all probe, resistor and
/// adjust pins high impedance and low, comparator off, timers stopped and the
/// ADC powered for regular readings.
pub fn idle<B: Board>(board: &mut B) {
    for port in [Port::Probe, Port::Resistor, Port::Adjust] {
        board.set_direction(port, 0);
        board.set_level(port, 0);
    }
    board.disconnect_comparator();
    board.reset_timer();
    board.stop_cycles();
    board.set_enabled(true);
}
