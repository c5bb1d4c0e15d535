//! ESR measurement.
//!
//! The capacitor is fed with short current pulses of alternating polarity
//! through Rl. For each polarity the ADC samples the voltage across the
//! pin resistance of the low side without the DUT and, in the middle of a
//! pulse, the voltage across pin resistance plus DUT. With the current known
//! from the first reading the difference yields the ESR. Alternating the
//! polarity keeps the capacitor's charge around zero.

use core::cmp::Ordering;

use common::physical::ScaledValue;
use tracing::{debug, trace};

use crate::{
    config::EsrMethod,
    context::{Capacitor, MeasurementContext},
    error::MeasureError,
    hardware::{self, Board, Port, Reference},
    probes::ProbeAssignment,
    Tester,
};

/// Raw value for "no ESR", for collaborators storing plain integers.
pub const ESR_NONE: u16 = u16::MAX;

/// MCU cycles a delay timer run costs besides the compare value.
pub const DELAY_TIMER_OVERHEAD: u32 = 17;
/// Loaded readings (raw) below this get an extra pre-charge pulse.
const RUNAWAY_FLOOR: u16 = 50;
/// Loaded readings (raw) up to this get an extra pulse, older method.
const LEGACY_RUNAWAY_FLOOR: u16 = 100;
/// Half-pulse length in us.
const HALF_PULSE_US: u16 = 2;

/// Sums of the raw readings over all cycles. Both start at one so an empty
/// measurement can't divide by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsrSums {
    /// Readings across the pin resistance only.
    pub no_load: u32,
    /// Readings across pin resistance and DUT.
    pub loaded: u32,
}

impl Default for EsrSums {
    fn default() -> Self {
        Self {
            no_load: 1,
            loaded: 1,
        }
    }
}

impl EsrSums {
    /// ESR in 0.01 Ohms with the probe resistance `r_zero` (0.01 Ohms)
    /// removed. `ri_low` is the low side pin resistance in 0.1 Ohms.
    ///
    /// A result at or below the probe resistance is no result, unless
    /// `zero_for_large` is set and the capacitor is larger than 1000uF,
    /// which can be expected to have next to no ESR.
    pub fn esr(
        &self,
        ri_low: u16,
        r_zero: u16,
        capacitance: ScaledValue,
        zero_for_large: bool,
    ) -> Option<u16> {
        let across_dut = self.loaded.saturating_sub(self.no_load);
        let esr = ri_low as u64 * 10 * across_dut as u64 / self.no_load.max(1) as u64;
        let esr = esr.min(ESR_NONE as u64 - 1) as u16;

        if esr > r_zero {
            return Some(esr - r_zero);
        }
        if zero_for_large
            && across_dut > 0
            && capacitance.cmp_to(1000, -6) == Ordering::Greater
        {
            return Some(0);
        }
        None
    }
}

/// Compare value for the delay timer, fails when the delay can't be timed.
pub fn delay_timer_cycles(cycles: i32) -> Result<u8, MeasureError> {
    if cycles < DELAY_TIMER_OVERHEAD as i32 {
        return Err(MeasureError::DelayTooShort(cycles.max(0) as u32));
    }
    u8::try_from(cycles as u32 - DELAY_TIMER_OVERHEAD)
        .map_err(|_| MeasureError::DelayTooLong(cycles as u32))
}

impl<B: Board> Tester<B> {
    /// Measure the ESR of the capacitor in slot `slot`.
    ///
    /// Returns the ESR in 0.01 Ohms or `None` if the capacitor is too small
    /// for the configured method or the measurement didn't work out.
    pub fn measure_esr(&mut self, ctx: &mut MeasurementContext, slot: usize) -> Option<u16> {
        let cap = *ctx.caps.get(slot)?;
        let floor = match self.config.esr {
            EsrMethod::Synchronized => 10,
            EsrMethod::Legacy => 180,
            EsrMethod::Disabled => return None,
        };
        if cap.capacitance().cmp_to(floor, -9) == Ordering::Less {
            trace!("No ESR for {}F", cap.capacitance());
            return None;
        }

        let result = match self.config.esr {
            EsrMethod::Legacy => self.esr_legacy(ctx, &cap),
            _ => self.esr_synchronized(ctx, &cap),
        };

        let esr = match result {
            Ok(esr) => esr,
            Err(err) => {
                debug!("ESR measurement failed: {}", err);
                None
            }
        };
        debug!("ESR {:?} (0.01 Ohm) for {}F", esr, cap.capacitance());

        let _ = self.discharge_probes(ctx);
        hardware::idle(&mut self.board);
        esr
    }

    fn esr_prepare(
        &mut self,
        ctx: &mut MeasurementContext,
        cap: &Capacitor,
        delay_cycles: i32,
    ) -> Result<ProbeAssignment, MeasureError> {
        self.discharge_probes(ctx)?;
        self.discharge_cap(ctx, cap.a, cap.b);

        let probes = ProbeAssignment::new(cap.a, cap.b);
        ctx.probes = probes;
        self.board.set_cycles(delay_timer_cycles(delay_cycles)?);

        self.board.set_level(Port::Probe, 0);
        self.board.select(probes.ch_1, Reference::Bandgap);
        ctx.adc.reference = Some(Reference::Bandgap);
        self.board.delay_ms(10);
        Ok(probes)
    }

    fn esr_synchronized(
        &mut self,
        ctx: &mut MeasurementContext,
        cap: &Capacitor,
    ) -> Result<Option<u16>, MeasureError> {
        // Place the sample and hold 2.5 ADC clocks after the dummy conversion
        // at the end of the first half-pulse.
        let per_us = self.config.cycles_per_us() as i32;
        let mut cycles = self.config.cycles_per_adc() as i32 * 25 / 10 - per_us * 10 - per_us * 2 - 10;
        if self.config.cpu_hz == 8_000_000 {
            // compensates the missing second half-pulse
            cycles -= 4;
        }
        let half_pulses = if self.config.cpu_hz < 8_000_000 { 2 } else { 1 };
        let probes = self.esr_prepare(ctx, cap, cycles)?;

        let mut sums = EsrSums::default();
        let mut loaded_forward = RUNAWAY_FLOOR;
        let mut loaded_reverse = 0;

        for _ in 0..self.config.limits.esr_cycles {
            self.board.feed();

            if loaded_reverse < RUNAWAY_FLOOR {
                self.esr_pulse(probes.pin_2, probes.rl_1);
            }
            if loaded_forward < RUNAWAY_FLOOR {
                self.esr_pulse(probes.pin_1, probes.rl_2);
            }

            let no_load_forward = self.esr_no_load(probes.pin_1, probes.rl_1, probes.ch_1);
            loaded_forward = self.esr_loaded(probes.ch_2, probes.rl_2, half_pulses);
            let no_load_reverse = self.esr_no_load(probes.pin_2, probes.rl_2, probes.ch_2);
            loaded_reverse = self.esr_loaded(probes.ch_1, probes.rl_1, half_pulses);

            sums.no_load += (no_load_forward + no_load_reverse) as u32;
            sums.loaded += (loaded_forward + loaded_reverse) as u32;
        }

        self.board.set_direction(Port::Probe, 0);
        self.board.set_level(Port::Resistor, 0);
        trace!("ESR sums {:?}", sums);

        let r_zero = ctx
            .calibration
            .r_zero(&self.config.features, probes.offset_index());
        Ok(sums.esr(ctx.calibration.ri_low, r_zero, cap.capacitance(), true))
    }

    /// Pre-charge pulse: `low_pin` pulled down directly, the probe behind
    /// `rl` pulled up for a half-pulse.
    fn esr_pulse(&mut self, low_pin: u8, rl: u8) {
        self.board.set_direction(Port::Probe, low_pin);
        self.board.set_level(Port::Resistor, rl);
        self.board.set_direction(Port::Resistor, rl);
        self.board.delay_us(HALF_PULSE_US);
        self.board.set_direction(Port::Resistor, 0);
        self.board.set_level(Port::Resistor, 0);
    }

    /// Voltage across the low side pin resistance: the probe is pulled down
    /// directly and up via Rl at the same time, the DUT's other end floats.
    fn esr_no_load(&mut self, pin: u8, rl: u8, channel: u8) -> u16 {
        self.board.set_direction(Port::Probe, pin);
        self.board.set_level(Port::Resistor, rl);
        self.board.set_direction(Port::Resistor, rl);
        self.board.select(channel, Reference::Bandgap);
        self.convert();
        self.convert()
    }

    /// Voltage across pin resistance and DUT, sampled within a pulse via
    /// the `rl` of the probe on `channel`.
    fn esr_loaded(&mut self, channel: u8, rl: u8, half_pulses: u8) -> u16 {
        self.board.select(channel, Reference::Bandgap);
        self.convert();

        self.board.start_conversion();
        self.board.delay_us(10);
        self.board.run_cycles();
        self.board.set_level(Port::Resistor, rl);
        self.board.set_direction(Port::Resistor, rl);
        for _ in 0..half_pulses {
            self.board.delay_us(HALF_PULSE_US);
        }
        self.board.set_direction(Port::Resistor, 0);
        while !self.board.conversion_done() {}
        self.board.result()
    }

    fn esr_legacy(
        &mut self,
        ctx: &mut MeasurementContext,
        cap: &Capacitor,
    ) -> Result<Option<u16>, MeasureError> {
        // half-pulse: 2.5 ADC clocks minus the 5us pre-delay
        let per_us = self.config.cycles_per_us() as i32;
        let cycles = self.config.cycles_per_adc() as i32 * 25 / 10 - per_us * 5 - 10;
        let probes = self.esr_prepare(ctx, cap, cycles)?;

        // negative half-pulse to start around zero
        self.board.set_direction(Port::Probe, probes.pin_2);
        self.board.set_level(Port::Resistor, probes.rl_1);
        self.board.set_direction(Port::Resistor, probes.rl_1);
        self.board.run_cycles();
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, 0);

        let mut sums = EsrSums::default();
        for _ in 0..self.config.limits.esr_cycles {
            self.board.feed();
            let no_load_forward = self.esr_no_load(probes.pin_1, probes.rl_1, probes.ch_1);
            let loaded_forward = self.esr_loaded_legacy(probes.ch_2, probes.rl_2);

            self.board.feed();
            let no_load_reverse = self.esr_no_load(probes.pin_2, probes.rl_2, probes.ch_2);
            let loaded_reverse = self.esr_loaded_legacy(probes.ch_1, probes.rl_1);

            sums.no_load += (no_load_forward + no_load_reverse) as u32;
            sums.loaded += (loaded_forward + loaded_reverse) as u32;
        }

        self.board.set_direction(Port::Probe, 0);
        self.board.set_level(Port::Resistor, 0);
        trace!("ESR sums {:?}", sums);

        let r_zero = ctx
            .calibration
            .r_zero(&self.config.features, probes.offset_index());
        Ok(sums.esr(ctx.calibration.ri_low, r_zero, cap.capacitance(), false))
    }

    /// Loaded reading of the older method: a full pulse of two delay timer
    /// runs after a 5us pre-delay, plus a top-up pulse for low readings.
    fn esr_loaded_legacy(&mut self, channel: u8, rl: u8) -> u16 {
        self.board.select(channel, Reference::Bandgap);
        self.convert();

        self.board.start_conversion();
        self.board.delay_us(5);
        self.board.set_level(Port::Resistor, rl);
        self.board.set_direction(Port::Resistor, rl);
        self.board.run_cycles();
        self.board.run_cycles();
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, 0);
        while !self.board.conversion_done() {}
        let loaded = self.board.result();

        if loaded <= LEGACY_RUNAWAY_FLOOR {
            self.board.set_level(Port::Resistor, rl);
            self.board.set_direction(Port::Resistor, rl);
            self.board.delay_us(HALF_PULSE_US);
            self.board.run_cycles();
            self.board.set_direction(Port::Resistor, 0);
            self.board.set_level(Port::Resistor, 0);
        }
        loaded
    }
}
