//! Capacitors from about 4.7uF up: charge pulses of 10ms or 1ms through Rl
//! until the capacitor reaches 300mV, then look up the capacitance for the
//! number of pulses and the voltage reached.

use common::physical::{reduce, Permille, ScaledValue};
use tracing::{debug, trace};

use crate::{
    context::{Capacitor, MeasurementContext},
    error::MeasureError,
    factor::LARGE_CAP,
    hardware::{self, Board, Port},
    measure::CapOutcome,
    probes::Pulse,
    Tester,
};

/// Leakage readings are reduced to stay within 32 bits.
const LEAKAGE_REDUCE_LIMIT: u64 = 800_000;

/// Result of the charge pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charge {
    Charged { pulses: u16, u_cap: u16 },
    /// Still below the target voltage when giving up.
    TooSlow,
    /// A single pulse charged the capacitor too far.
    TooFast,
}

/// Capacitance for `pulses` charge pulses reaching `u_mv`, compensated with
/// `cap_factor` (0.1%). Returns the raw value, the compensated value and
/// their exponent.
///
/// ```
/// use tester_core::{large_cap::large_cap_value, probes::Pulse};
/// // three 10ms pulses to 300mV: about 633uF
/// assert_eq!(large_cap_value(300, 3, Pulse::Long, -90), (690_660, 633_633, -9));
/// ```
pub fn large_cap_value(u_mv: u16, pulses: u16, pulse: Pulse, cap_factor: i16) -> (u32, u32, i8) {
    let mut raw = LARGE_CAP.factor(u_mv) as u64 * pulses as u64;
    if pulse == Pulse::Long {
        raw *= 10;
    }

    let (raw, scale) = reduce(raw, -9, (u32::MAX / 1000) as u64, 3);
    let divisor = (1000 - cap_factor as i64).max(1) as u64;
    let value = raw * 1000 / divisor;
    (raw as u32, value.min(u32::MAX as u64) as u32, scale)
}

/// Leakage current for a voltage drop of `u_leak_mv` within the leakage
/// window (1s for long pulses, 100ms for short) of a capacitor
/// `value * 10^scale`.
pub fn leakage_current(value: u32, scale: i8, u_leak_mv: u16, pulse: Pulse) -> ScaledValue {
    let (value, mut scale) = reduce(value as u64, scale, LEAKAGE_REDUCE_LIMIT, 1);
    let current = value * u_leak_mv as u64 / 1000;
    if pulse == Pulse::Short {
        scale += 1;
    }
    ScaledValue::fit(current, scale, u16::MAX as u32)
}

impl<B: Board> Tester<B> {
    /// Measure a large capacitor between the probes of the current
    /// assignment and store it in slot `slot`.
    pub fn large_cap(&mut self, ctx: &mut MeasurementContext, slot: usize) -> CapOutcome {
        let outcome = self.large_cap_inner(ctx, slot);
        debug!("Large cap: {:?}", outcome);
        hardware::idle(&mut self.board);
        outcome
    }

    fn large_cap_inner(&mut self, ctx: &mut MeasurementContext, slot: usize) -> CapOutcome {
        for pulse in [Pulse::Long, Pulse::Short] {
            let charge = match self.charge_pulses(ctx, pulse) {
                Ok(charge) => charge,
                Err(_) => return CapOutcome::Failed,
            };

            match charge {
                Charge::TooSlow => return CapOutcome::TooHigh,
                Charge::TooFast => {
                    trace!("Single {}ms pulse overcharged", pulse.ms());
                    continue;
                }
                Charge::Charged { pulses, u_cap } => {
                    return self.store_large_cap(ctx, slot, pulse, pulses, u_cap);
                }
            }
        }
        CapOutcome::TooLow
    }

    fn charge_pulses(
        &mut self,
        ctx: &mut MeasurementContext,
        pulse: Pulse,
    ) -> Result<Charge, MeasureError> {
        self.discharge_probes(ctx)?;
        let probes = ctx.probes;
        let limits = self.config.limits;

        // zero offset: probe 2 down directly and up via Rl
        self.board.set_level(Port::Probe, 0);
        self.board.set_direction(Port::Probe, probes.pin_2);
        self.board.set_level(Port::Resistor, probes.rl_2);
        self.board.set_direction(Port::Resistor, probes.rl_2);
        let u_zero = self.read_voltage(&mut ctx.adc, probes.ch_1) as i32
            - self.read_voltage(&mut ctx.adc, probes.ch_2) as i32;
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, 0);

        let mut pulses: u16 = 0;
        let mut u_cap: u16;
        loop {
            pulses += 1;
            self.pull_probe(probes.rl_1, pulse);
            let u = self.read_voltage(&mut ctx.adc, probes.ch_1) as i32;
            u_cap = (u - u_zero).max(0) as u16;
            self.board.feed();

            if u_cap >= limits.target_mv
                || (pulses == limits.slow_charge_pulses && u_cap < limits.slow_charge_mv)
                || pulses >= limits.charge_pulses
            {
                break;
            }
        }
        trace!("{} pulses of {}ms to {}mV", pulses, pulse.ms(), u_cap);

        if u_cap < limits.target_mv {
            return Ok(Charge::TooSlow);
        }
        if pulses == 1 && u_cap > limits.single_pulse_mv {
            return Ok(Charge::TooFast);
        }
        Ok(Charge::Charged { pulses, u_cap })
    }

    fn store_large_cap(
        &mut self,
        ctx: &mut MeasurementContext,
        slot: usize,
        pulse: Pulse,
        pulses: u16,
        u_cap: u16,
    ) -> CapOutcome {
        let probes = ctx.probes;

        // self-discharge for as long as the charging took
        let u_start = self.read_voltage(&mut ctx.adc, probes.ch_1);
        let mut u_end = u_start;
        for _ in 0..pulses {
            u_end = self.read_voltage(&mut ctx.adc, probes.ch_1);
            self.board.feed();
        }
        let u_drop = u_start.saturating_sub(u_end);
        if u_drop > self.config.limits.max_drop_mv {
            debug!("Lost {}mV, not a capacitor", u_drop);
            return CapOutcome::Failed;
        }
        let u_loss = match self.config.features.voltage_loss && u_drop > 0 {
            true => Permille::ratio(u_drop as u32, u_cap as u32).unwrap_or(Permille::ZERO),
            false => Permille::ZERO,
        };

        // leakage
        let window_ms = match pulse {
            Pulse::Long => 1000,
            Pulse::Short => 100,
        };
        let u_before = self.read_voltage(&mut ctx.adc, probes.ch_1);
        self.board.feed();
        self.board.delay_ms(window_ms);
        let u_after = self.read_voltage(&mut ctx.adc, probes.ch_1);
        self.board.feed();
        let u_leak = u_before.saturating_sub(u_after);

        // the drop adds to the voltage reached by the pulses
        let cap_factor = match pulse {
            Pulse::Long => self.config.cap_factor_large,
            Pulse::Short => self.config.cap_factor_mid,
        };
        let (raw, value, scale) = large_cap_value(u_cap + u_drop, pulses, pulse, cap_factor);
        let i_leak = leakage_current(value, scale, u_leak, pulse);

        let Some(cap) = ctx.caps.get_mut(slot) else {
            return CapOutcome::Failed;
        };
        *cap = Capacitor {
            a: probes.id_2,
            b: probes.id_1,
            scale,
            raw,
            value,
            i_leak,
            u_loss,
        };
        CapOutcome::Success
    }
}
