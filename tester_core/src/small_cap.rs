//! Capacitors up to about 4.7uF: charge via Rh and let the 16 bit timer
//! count MCU cycles until the analog comparator sees the bandgap voltage.

use core::cmp::Ordering;

use common::physical::{reduce, Permille, ScaledValue};
use tracing::{debug, trace};

use crate::{
    adc::ReadMode,
    adjust::DischargePath,
    context::{Capacitor, Component, MeasurementContext},
    error::MeasureError,
    factor::SMALL_CAP,
    hardware::{self, Board, Port, Reference, TimerFlags},
    measure::CapOutcome,
    probes::ALL_PINS,
    Tester,
};

/// Timer ticks spent between starting the timer and releasing the probe.
const TIMER_OVERHEAD: u64 = 2;
/// Samples of the voltage loss readings, few to keep the loss of charge low.
const VOLTAGE_LOSS_SAMPLES: u8 = 5;
/// Time unit of the voltage loss measurement in us, per 10nF.
const VOLTAGE_LOSS_UNIT_US: u16 = 5;

/// Counter state when the comparator tripped or the timer gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Capture {
    pub ticks: u16,
    pub overflows: u16,
    /// Flags seen when leaving the poll loop.
    pub flags: TimerFlags,
}

/// Capacitance for a charge time of `overflows * 2^16 + ticks` MCU cycles
/// up to the comparator threshold `threshold_mv`. Returns the raw value
/// and its exponent, either -12 or -9.
///
/// ```
/// use tester_core::small_cap::small_cap_value;
/// assert_eq!(small_cap_value(948, 0, 1039, 8_000_000, 0), (1_080, -12));
/// ```
pub fn small_cap_value(
    ticks: u16,
    overflows: u16,
    threshold_mv: u16,
    cpu_hz: u32,
    cap_factor: i16,
) -> (u32, i8) {
    let mut raw = ticks as u64 | (overflows as u64) << 16;
    if raw > TIMER_OVERHEAD {
        raw -= TIMER_OVERHEAD;
    }

    let (raw, scale) = reduce(raw, -12, (u32::MAX / 1000) as u64, 3);
    let mut raw = raw * SMALL_CAP.factor(threshold_mv) as u64 / (cpu_hz / 10_000).max(1) as u64;
    if cap_factor != 0 {
        raw = raw * 1000 / (1000 - cap_factor as i64).max(1) as u64;
    }
    (raw.min(u32::MAX as u64) as u32, scale)
}

/// Voltage loss of the self-discharge check. The drop over the full wait
/// is related to the voltage after half of the charge time, hence the
/// halved ratio.
pub fn self_discharge_loss(u_start: u16, u_end: u16) -> Permille {
    if u_start <= u_end {
        return Permille::ZERO;
    }
    Permille::ratio((u_start - u_end) as u32, 2 * u_start as u32).unwrap_or(Permille::ZERO)
}

/// Whether a capacitor is a suitable source for the self-adjustment:
/// 100nF up to 20uF.
pub fn suits_self_adjust(value: u32, scale: i8) -> bool {
    (scale == -12 && value >= 100_000) || (scale == -9 && value <= 20_000)
}

impl<B: Board> Tester<B> {
    /// Measure a small capacitor between the probes of the current
    /// assignment and store it in slot `slot`.
    pub fn small_cap(&mut self, ctx: &mut MeasurementContext, slot: usize) -> CapOutcome {
        let outcome = match self.small_cap_inner(ctx, slot) {
            Ok(outcome) => outcome,
            Err(_) => CapOutcome::Failed,
        };
        debug!("Small cap: {:?}", outcome);
        hardware::idle(&mut self.board);
        outcome
    }

    fn small_cap_inner(
        &mut self,
        ctx: &mut MeasurementContext,
        slot: usize,
    ) -> Result<CapOutcome, MeasureError> {
        self.discharge_probes(ctx)?;
        let probes = ctx.probes;
        let features = self.config.features;

        // all probes down directly, probe 1 also via Rh
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Probe, ALL_PINS);
        self.board.set_level(Port::Probe, 0);
        self.board.set_direction(Port::Resistor, probes.rh_1);

        self.board.select(probes.ch_1, Reference::Vcc);
        ctx.adc.reference = Some(Reference::Vcc);
        self.board.set_enabled(false);
        self.board.connect_comparator(probes.ch_1);
        self.board.delay_us(200);

        self.board.reset_timer();
        self.board.set_level(Port::Resistor, probes.rh_1);
        // C_GS of a FET: keep gate and source low
        let keep_low = match ctx.check.found {
            Component::Fet => ALL_PINS & !probes.pin_1,
            _ => probes.pin_2,
        };
        self.board.start_timer();
        self.board.set_direction(Port::Probe, keep_low);

        let mut capture = self.wait_for_capture();
        self.board.set_direction(Port::Resistor, 0);
        if self.board.timer_ticks() > capture.ticks && capture.flags.overflow {
            // overflow right before the capture
            self.board.clear_timer_flags(TimerFlags {
                capture: false,
                overflow: true,
            });
            capture.overflows += 1;
        }

        self.board.set_enabled(true);
        self.board.disconnect_comparator();
        let u_c = match features.fixed_ref_cap {
            true => None,
            false => Some(self.read_voltage(&mut ctx.adc, probes.ch_1)),
        };
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, probes.rh_1);

        trace!("Small cap: {:?}", capture);
        if capture.overflows >= self.config.limits.timer_overflows {
            return Ok(CapOutcome::TooHigh);
        }

        let threshold = (ctx.adc.bandgap_mv as i32 + ctx.calibration.comp_offset as i32)
            .clamp(0, u16::MAX as i32) as u16;
        let (raw, scale) = small_cap_value(
            capture.ticks,
            capture.overflows,
            threshold,
            self.config.cpu_hz,
            self.config.cap_factor_small,
        );
        let value = match scale {
            -12 => {
                let zero = ctx.calibration.cap_zero(&features, probes.offset_index());
                raw.saturating_sub(zero as u32)
            }
            _ => raw,
        };

        let Some(cap) = ctx.caps.get_mut(slot) else {
            return Ok(CapOutcome::Failed);
        };
        *cap = Capacitor {
            a: probes.id_2,
            b: probes.id_1,
            scale,
            raw,
            value,
            ..Capacitor::EMPTY
        };

        if let Some(u_c) = u_c {
            if suits_self_adjust(value, scale) {
                let path = DischargePath {
                    channel: probes.ch_1,
                    port: Port::Resistor,
                    rh_mask: probes.rh_1,
                };
                self.self_adjust(ctx, path, u_c, false);
            }
        }

        let capacitance = ScaledValue::new(value, scale);
        if features.voltage_loss && capacitance.cmp_to(50, -9) == Ordering::Greater {
            let u_loss = self.voltage_loss(ctx, capacitance)?;
            if let Some(cap) = ctx.caps.get_mut(slot) {
                cap.u_loss = u_loss;
            }
        }
        Ok(CapOutcome::Success)
    }

    /// Poll the capture timer until the comparator trips or the overflow
    /// ceiling is reached. The timer is stopped afterwards.
    pub(crate) fn wait_for_capture(&mut self) -> Capture {
        let limit = self.config.limits.timer_overflows;
        let mut overflows: u16 = 0;

        let flags = loop {
            let flags = self.board.timer_flags();
            if flags.capture {
                break flags;
            }
            if flags.overflow {
                self.board.clear_timer_flags(TimerFlags {
                    capture: false,
                    overflow: true,
                });
                self.board.feed();
                overflows += 1;
                if overflows >= limit {
                    break flags;
                }
            }
        };

        self.board.stop_timer();
        self.board.clear_timer_flags(TimerFlags {
            capture: true,
            overflow: false,
        });
        Capture {
            ticks: self.board.captured_ticks(),
            overflows,
            flags,
        }
    }

    /// Self-discharge of a capacitor above 50nF: charge for a time matching
    /// the capacitance, then compare the voltage at the start and the end of
    /// the same time without charging.
    fn voltage_loss(
        &mut self,
        ctx: &mut MeasurementContext,
        capacitance: ScaledValue,
    ) -> Result<Permille, MeasureError> {
        // time units of 10nF
        let units = capacitance
            .rescale(-8)
            .map(|c| c.value().min(u16::MAX as u32) as u16)
            .unwrap_or(u16::MAX);

        self.discharge_probes(ctx)?;
        let probes = ctx.probes;
        let mode = ReadMode {
            samples: VOLTAGE_LOSS_SAMPLES,
            auto_scale: ctx.adc.auto_scale,
        };

        self.board.set_level(Port::Probe, 0);
        self.board.set_direction(Port::Probe, probes.pin_2);
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, probes.rl_1);
        let u_zero = self.read_voltage(&mut ctx.adc, probes.ch_1);

        self.board.set_level(Port::Resistor, probes.rl_1);
        for _ in 0..units / 2 {
            self.board.delay_us(VOLTAGE_LOSS_UNIT_US);
        }
        self.board.set_direction(Port::Resistor, 0);
        self.board.set_level(Port::Resistor, 0);
        self.board.feed();

        let u_start = self
            .read_voltage_with(&mut ctx.adc, probes.ch_1, mode)
            .saturating_sub(u_zero);
        for _ in 0..units {
            self.board.delay_us(VOLTAGE_LOSS_UNIT_US);
        }
        let u_end = self
            .read_voltage_with(&mut ctx.adc, probes.ch_1, mode)
            .saturating_sub(u_zero);
        self.board.feed();

        Ok(self_discharge_loss(u_start, u_end))
    }
}
