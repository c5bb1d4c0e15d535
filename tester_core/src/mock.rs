//! Scripted board for the engine tests.
//!
//! Voltages are static per channel, except for channel 0 which may follow a
//! curve indexed by the number of charge pulses applied through the Rl of
//! probe 1. Any discharge path on probe 1 resets the pulse count. The
//! references are 5120mV and 1024mV so every voltage divisible by five
//! converts without loss.

use embedded_hal::{
    blocking::delay::{DelayMs, DelayUs},
    watchdog::Watchdog,
};

use crate::{
    calibration::Calibration,
    context::MeasurementContext,
    hardware::{
        AdcDriver, AnalogComparator, CaptureTimer, CycleTimer, PinDriver, Port, Reference,
        TimerFlags,
    },
    probes::PROBE_PINS,
};

pub struct MockBoard {
    /// Voltage in mV per ADC channel.
    pub probe_mv: [u16; 4],
    /// Voltage of channel 0 after n charge pulses, the last entry holds.
    pub curve: Vec<u16>,
    pub pulses: usize,
    /// Counter ticks until the comparator trips, `None` for never.
    pub capture_at: Option<u32>,
    pub vcc_mv: u16,
    pub bandgap_mv: u16,

    pub conversions: usize,
    pub feeds: usize,
    pub slept_ms: u64,
    pub cycle_runs: usize,
    pub overflows: u32,
    /// Overflows over all timer runs, kept across resets.
    pub total_overflows: u32,

    directions: [u8; 3],
    levels: [u8; 3],
    channel: u8,
    reference: Reference,
    result: u16,
    adc_enabled: bool,
    comparator: Option<u8>,
    timer_running: bool,
    flags: TimerFlags,
    captured: u16,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self {
            probe_mv: [0; 4],
            curve: Vec::new(),
            pulses: 0,
            capture_at: None,
            vcc_mv: 5120,
            bandgap_mv: 1024,
            conversions: 0,
            feeds: 0,
            slept_ms: 0,
            cycle_runs: 0,
            overflows: 0,
            total_overflows: 0,
            directions: [0; 3],
            levels: [0; 3],
            channel: 0,
            reference: Reference::Vcc,
            result: 0,
            adc_enabled: true,
            comparator: None,
            timer_running: false,
            flags: TimerFlags::default(),
            captured: 0,
        }
    }
}

impl MockBoard {
    /// Context matching the references of the mock.
    pub fn context() -> MeasurementContext {
        let calibration = Calibration {
            vcc_mv: 5120,
            ..Calibration::default()
        };
        MeasurementContext::new(calibration, 1024)
    }

    pub fn direction(&self, port: Port) -> u8 {
        self.directions[Self::index(port)]
    }

    pub fn level(&self, port: Port) -> u8 {
        self.levels[Self::index(port)]
    }

    pub fn comparator_connected(&self) -> bool {
        self.comparator.is_some()
    }

    pub fn timer_running(&self) -> bool {
        self.timer_running
    }

    pub fn adc_enabled(&self) -> bool {
        self.adc_enabled
    }

    fn index(port: Port) -> usize {
        match port {
            Port::Probe => 0,
            Port::Resistor => 1,
            Port::Adjust => 2,
        }
    }

    fn voltage(&self, channel: u8) -> u16 {
        match (channel, self.curve.is_empty()) {
            (0, false) => self.curve[self.pulses.min(self.curve.len() - 1)],
            _ => self.probe_mv.get(channel as usize).copied().unwrap_or(0),
        }
    }
}

impl PinDriver for MockBoard {
    fn set_direction(&mut self, port: Port, mask: u8) {
        let probe = PROBE_PINS[0];
        let level = self.levels[Self::index(port)];
        match port {
            Port::Resistor if mask & level & probe.rl != 0 => self.pulses += 1,
            Port::Resistor if mask & probe.rh != 0 && level & probe.rh == 0 => self.pulses = 0,
            Port::Probe if mask & probe.pin != 0 && level & probe.pin == 0 => self.pulses = 0,
            _ => {}
        }
        self.directions[Self::index(port)] = mask;
    }

    fn set_level(&mut self, port: Port, mask: u8) {
        self.levels[Self::index(port)] = mask;
    }
}

impl AdcDriver for MockBoard {
    fn select(&mut self, channel: u8, reference: Reference) {
        self.channel = channel;
        self.reference = reference;
    }

    fn start_conversion(&mut self) {
        let u_ref = match self.reference {
            Reference::Vcc => self.vcc_mv,
            Reference::Bandgap => self.bandgap_mv,
        };
        let raw = self.voltage(self.channel) as u32 * 1024 / u_ref as u32;
        self.result = raw.min(1023) as u16;
        self.conversions += 1;
    }

    fn conversion_done(&mut self) -> bool {
        true
    }

    fn result(&mut self) -> u16 {
        self.result
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.adc_enabled = enabled;
    }
}

impl AnalogComparator for MockBoard {
    fn connect_comparator(&mut self, channel: u8) {
        self.comparator = Some(channel);
    }

    fn disconnect_comparator(&mut self) {
        self.comparator = None;
    }
}

impl CaptureTimer for MockBoard {
    fn reset_timer(&mut self) {
        self.timer_running = false;
        self.overflows = 0;
        self.flags = TimerFlags::default();
        self.captured = 0;
    }

    fn start_timer(&mut self) {
        self.timer_running = true;
    }

    fn stop_timer(&mut self) {
        self.timer_running = false;
    }

    fn timer_flags(&mut self) -> TimerFlags {
        if self.timer_running && !self.flags.capture && !self.flags.overflow {
            let period_end = (self.overflows + 1) * 0x1_0000;
            match self.capture_at {
                Some(at) if self.comparator.is_some() && at < period_end => {
                    self.flags.capture = true;
                    self.captured = (at & 0xFFFF) as u16;
                }
                _ => {
                    self.flags.overflow = true;
                    self.overflows += 1;
                    self.total_overflows += 1;
                }
            }
        }
        self.flags
    }

    fn clear_timer_flags(&mut self, flags: TimerFlags) {
        self.flags.capture &= !flags.capture;
        self.flags.overflow &= !flags.overflow;
    }

    fn captured_ticks(&self) -> u16 {
        self.captured
    }

    fn timer_ticks(&self) -> u16 {
        self.captured
    }
}

impl CycleTimer for MockBoard {
    fn set_cycles(&mut self, _cycles: u8) {}

    fn run_cycles(&mut self) {
        self.cycle_runs += 1;
    }

    fn stop_cycles(&mut self) {}
}

impl DelayUs<u16> for MockBoard {
    fn delay_us(&mut self, _us: u16) {}
}

impl DelayMs<u16> for MockBoard {
    fn delay_ms(&mut self, ms: u16) {
        self.slept_ms += ms as u64;
    }
}

impl Watchdog for MockBoard {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}
