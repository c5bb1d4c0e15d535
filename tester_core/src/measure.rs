//! Capacitance measurement of a probe pair: guards against components that
//! only look like capacitors, runs the large and small capacitor engines and
//! updates the classification.

use core::cmp::Ordering;

use tracing::{debug, trace};

use crate::{
    context::{Capacitor, Component, MeasurementContext},
    hardware::{self, Board},
    probes::ProbeAssignment,
    Tester,
};

/// Diodes with a lower forward voltage (mV) would conduct during the charge.
const DIODE_MIN_VF_MV: u16 = 1500;
/// Anything below this many pF is considered noise.
const GHOST_PF: u32 = 5;

/// Result of a capacitance engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapOutcome {
    /// Not a capacitor, or the probes couldn't be discharged.
    Failed = 0,
    /// Too large for the engine.
    TooHigh = 1,
    /// Too small for the engine, the next one should take over.
    TooLow = 2,
    Success = 3,
}

/// Classification after measuring `cap`, starting from `found`.
///
/// A low resistance turns into a capacitor only above 4.3uF, nothing else
/// but an empty finding gets upgraded.
///
/// ```
/// use tester_core::{measure::classify, Capacitor, Component};
/// let cap = Capacitor { value: 22, ..Capacitor::EMPTY };
/// assert_eq!(classify(Component::None, &cap), Component::Capacitor);
/// assert_eq!(classify(Component::Resistor, &cap), Component::Resistor);
/// ```
pub fn classify(found: Component, cap: &Capacitor) -> Component {
    match found {
        Component::None if cap.scale > -12 || cap.value >= GHOST_PF => Component::Capacitor,
        Component::Resistor if cap.capacitance().cmp_to(43, -7) == Ordering::Greater => {
            Component::Capacitor
        }
        _ => found,
    }
}

impl<B: Board> Tester<B> {
    /// Measure the capacitance between `probe_1` and `probe_2` and store it
    /// in slot `slot`, which is cleared first. The classification in `ctx`
    /// may be upgraded to [`Component::Capacitor`].
    pub fn measure_cap(
        &mut self,
        ctx: &mut MeasurementContext,
        probe_1: u8,
        probe_2: u8,
        slot: usize,
    ) {
        if let Some(cap) = ctx.caps.get_mut(slot) {
            *cap = Capacitor::EMPTY;
            self.measure_cap_inner(ctx, probe_1, probe_2, slot);
        }
        hardware::idle(&mut self.board);
    }

    fn measure_cap_inner(
        &mut self,
        ctx: &mut MeasurementContext,
        probe_1: u8,
        probe_2: u8,
        slot: usize,
    ) {
        match ctx.check.found {
            Component::Error => return,
            // a low resistance might be a large capacitor
            Component::Resistor if !ctx.check.has_low_resistance(probe_1, probe_2) => {
                trace!("Resistor between {} and {}, skipping", probe_1, probe_2);
                return;
            }
            _ => {}
        }
        if let Some(diode) = ctx.check.search_diode(probe_1, probe_2) {
            if diode.v_f < DIODE_MIN_VF_MV {
                trace!("Diode with {}mV between {} and {}, skipping", diode.v_f, probe_1, probe_2);
                return;
            }
        }

        ctx.probes = ProbeAssignment::new(probe_1, probe_2);
        let mut outcome = self.large_cap(ctx, slot);
        if outcome == CapOutcome::TooLow {
            outcome = self.small_cap(ctx, slot);
        }

        let found = ctx.check.found;
        ctx.check.found = classify(found, &ctx.caps[slot]);
        debug!(
            "Capacitor {}-{}: {:?}, {} ({:?} -> {:?})",
            probe_1,
            probe_2,
            outcome,
            ctx.caps[slot].capacitance(),
            found,
            ctx.check.found
        );

        // NOTE: a failure is already recorded in the classification
        let _ = self.discharge_probes(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Diode, Resistor};
    use crate::hardware::Port;
    use crate::mock::MockBoard;
    use crate::Config;
    use common::physical::ScaledValue;

    /// Board with a capacitor too small for the large cap engine, tripping
    /// the comparator after 948 ticks (about 1nF).
    fn small_cap_board() -> MockBoard {
        let mut board = MockBoard::default();
        board.curve = vec![0, 1500];
        board.capture_at = Some(948);
        board
    }

    fn low_resistance(ctx: &mut MeasurementContext, tenths: u32) {
        ctx.check.found = Component::Resistor;
        let _ = ctx.check.resistors.push(Resistor {
            a: 1,
            b: 0,
            value: ScaledValue::new(tenths, -1),
        });
    }

    fn assert_idle(board: &MockBoard) {
        for port in [Port::Probe, Port::Resistor, Port::Adjust] {
            assert_eq!(board.direction(port), 0);
            assert_eq!(board.level(port), 0);
        }
        assert!(!board.comparator_connected());
        assert!(board.adc_enabled());
    }

    #[test]
    fn test_classify() {
        let ghost = Capacitor {
            value: 4,
            ..Capacitor::EMPTY
        };
        assert_eq!(classify(Component::None, &ghost), Component::None);

        let small = Capacitor {
            value: 1,
            scale: -9,
            ..Capacitor::EMPTY
        };
        assert_eq!(classify(Component::None, &small), Component::Capacitor);

        let at_limit = Capacitor {
            value: 4_300,
            scale: -9,
            ..Capacitor::EMPTY
        };
        assert_eq!(classify(Component::Resistor, &at_limit), Component::Resistor);

        let large = Capacitor {
            value: 4_301,
            scale: -9,
            ..Capacitor::EMPTY
        };
        assert_eq!(classify(Component::Resistor, &large), Component::Capacitor);
        assert_eq!(classify(Component::Diode, &large), Component::Diode);
        assert_eq!(classify(Component::Error, &large), Component::Error);
        assert_eq!(classify(Component::Fet, &large), Component::Fet);
    }

    #[test]
    fn test_outcome_ordinals() {
        assert_eq!(CapOutcome::Failed as u8, 0);
        assert_eq!(CapOutcome::TooHigh as u8, 1);
        assert_eq!(CapOutcome::TooLow as u8, 2);
        assert_eq!(CapOutcome::Success as u8, 3);
    }

    #[test]
    fn test_error_skips_and_clears_slot() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();
        ctx.check.found = Component::Error;
        ctx.caps[2] = Capacitor {
            value: 7,
            scale: -9,
            ..Capacitor::EMPTY
        };

        tester.measure_cap(&mut ctx, 0, 1, 2);
        assert_eq!(ctx.caps[2], Capacitor::EMPTY);
        assert_eq!(ctx.check.found, Component::Error);
        assert_eq!(tester.board().conversions, 0);
        assert_idle(tester.board());
    }

    #[test]
    fn test_small_cap_fallback() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();

        tester.measure_cap(&mut ctx, 0, 1, 1);
        let cap = ctx.caps[1];
        assert_eq!((cap.raw, cap.value, cap.scale), (1080, 1037, -12));
        assert_eq!((cap.a, cap.b), (1, 0));
        assert_eq!(ctx.check.found, Component::Capacitor);
        assert_idle(tester.board());
    }

    #[test]
    fn test_ghost_is_not_a_capacitor() {
        let mut board = small_cap_board();
        board.capture_at = Some(30);
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();

        tester.measure_cap(&mut ctx, 0, 1, 0);
        assert_eq!(ctx.caps[0].value, 0);
        assert_eq!(ctx.check.found, Component::None);
    }

    #[test]
    fn test_resistor_is_skipped() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();
        low_resistance(&mut ctx, 1_000);

        tester.measure_cap(&mut ctx, 0, 1, 0);
        assert_eq!(tester.board().conversions, 0);
        assert_eq!(ctx.check.found, Component::Resistor);
    }

    #[test]
    fn test_low_resistance_large_cap_overrides_resistor() {
        let mut board = MockBoard::default();
        board.curve = vec![0, 100, 200, 300];
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();
        low_resistance(&mut ctx, 47);

        tester.measure_cap(&mut ctx, 0, 1, 0);
        assert_eq!(ctx.caps[0].value, 633_633);
        assert_eq!(ctx.caps[0].scale, -9);
        assert_eq!(ctx.check.found, Component::Capacitor);
        assert_idle(tester.board());
    }

    #[test]
    fn test_low_resistance_small_cap_stays_resistor() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();
        low_resistance(&mut ctx, 47);

        tester.measure_cap(&mut ctx, 0, 1, 0);
        assert_eq!(ctx.caps[0].value, 1037);
        assert_eq!(ctx.check.found, Component::Resistor);
    }

    #[test]
    fn test_low_forward_voltage_diode_is_skipped() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();
        let _ = ctx.check.diodes.push(Diode {
            anode: 0,
            cathode: 1,
            v_f: 650,
        });

        tester.measure_cap(&mut ctx, 0, 1, 0);
        assert_eq!(tester.board().conversions, 0);
        assert_eq!(ctx.caps[0], Capacitor::EMPTY);
        assert_idle(tester.board());
    }

    #[test]
    fn test_diode_finding_is_kept() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();
        ctx.check.found = Component::Diode;
        let _ = ctx.check.diodes.push(Diode {
            anode: 0,
            cathode: 1,
            v_f: 2_000,
        });

        tester.measure_cap(&mut ctx, 0, 1, 0);
        assert_eq!(ctx.caps[0].value, 1037);
        assert_eq!(ctx.check.found, Component::Diode);
    }

    #[test]
    fn test_slot_out_of_range() {
        let mut tester = Tester::new(small_cap_board(), Config::default());
        let mut ctx = MockBoard::context();

        tester.measure_cap(&mut ctx, 0, 1, 3);
        assert_eq!(tester.board().conversions, 0);
        assert_idle(tester.board());
    }
}
