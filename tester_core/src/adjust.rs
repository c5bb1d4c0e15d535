//! Self-adjustment of the bandgap reference offset and the analog
//! comparator offset, using a charged capacitor as common voltage source.

use tracing::{debug, trace};

use crate::{
    adc::ReadMode,
    calibration::ref_correction,
    config::CAP_DISCHARGED,
    context::MeasurementContext,
    hardware::{self, Board, Port, Reference, TimerFlags},
    Tester,
};

/// The capacitor is discharged below this voltage (mV) before comparing
/// both references, so the bandgap reference can read it.
const BELOW_BANDGAP_MV: u16 = 980;
/// Discharge polls of the reference capacitor.
const REF_CAP_DISCHARGE_POLLS: u8 = 50;
/// Pause between two of those polls in ms.
const REF_CAP_DISCHARGE_PAUSE_MS: u16 = 20;

/// How the capacitor used for an adjustment is read and discharged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DischargePath {
    /// ADC channel of the capacitor.
    pub channel: u8,
    /// Port of the Rh pin discharging it.
    pub port: Port,
    pub rh_mask: u8,
}

impl<B: Board> Tester<B> {
    /// Adjust the calibration with a capacitor which the comparator tripped
    /// at `u_c` (mV) and which is discharging via `path`.
    ///
    /// The reference offset gets corrected if the capacitor's voltage reads
    /// differently against Vcc and the bandgap. The comparator offset is
    /// replaced by the difference between `u_c` and the corrected bandgap
    /// voltage if that lies within +/-50mV. With `update_session` the
    /// corrected bandgap voltage is used right away by the following readings.
    ///
    /// Returns whether any calibration value changed.
    pub(crate) fn self_adjust(
        &mut self,
        ctx: &mut MeasurementContext,
        path: DischargePath,
        u_c: u16,
        update_session: bool,
    ) -> bool {
        let mut reads: u16 = 0;
        while self.read_voltage(&mut ctx.adc, path.channel) > BELOW_BANDGAP_MV {
            self.board.feed();
            reads += 1;
            if reads >= self.config.limits.adjust_reads {
                debug!("Capacitor doesn't discharge below the bandgap, no adjustment");
                return false;
            }
        }

        self.board.set_direction(path.port, 0);
        let samples = ctx.adc.samples;
        let vcc_read = self.read_voltage_with(
            &mut ctx.adc,
            path.channel,
            ReadMode {
                samples,
                auto_scale: false,
            },
        );
        let bandgap_read = self.read_voltage_with(
            &mut ctx.adc,
            path.channel,
            ReadMode {
                samples,
                auto_scale: true,
            },
        );
        self.board.set_direction(path.port, path.rh_mask);
        trace!("Adjusting with {}mV (Vcc) and {}mV (bandgap)", vcc_read, bandgap_read);

        let mut changed = false;
        let mut bandgap = ctx.adc.bandgap_mv;
        if let Some(correction) = ref_correction(vcc_read, bandgap_read, bandgap) {
            ctx.calibration.shift_ref_offset(correction);
            bandgap = (bandgap as i32 + correction as i32).max(0) as u16;
            if update_session {
                ctx.adc.bandgap_mv = bandgap;
            }
            debug!(
                "Reference offset {}mV (corrected by {}mV)",
                ctx.calibration.ref_offset, correction
            );
            changed = true;
        }

        let comp_offset = u_c as i16 - bandgap as i16;
        if ctx.calibration.update_comp_offset(comp_offset) {
            debug!("Comparator offset {}mV", comp_offset);
            changed = true;
        }
        changed
    }

    /// Adjust the calibration with the fixed reference capacitor.
    ///
    /// Returns false if there is none, it doesn't discharge or it takes too
    /// long to charge.
    pub fn ref_cap(&mut self, ctx: &mut MeasurementContext) -> bool {
        let Some(wiring) = self.config.ref_cap else {
            return false;
        };
        let path = DischargePath {
            channel: wiring.channel,
            port: Port::Adjust,
            rh_mask: wiring.rh_mask,
        };

        let adjusted = self.ref_cap_inner(ctx, path);
        hardware::idle(&mut self.board);
        adjusted
    }

    fn ref_cap_inner(&mut self, ctx: &mut MeasurementContext, path: DischargePath) -> bool {
        self.board.set_level(Port::Adjust, 0);
        self.board.set_direction(Port::Adjust, path.rh_mask);

        let mut discharged = false;
        for _ in 0..=REF_CAP_DISCHARGE_POLLS {
            if self.read_voltage(&mut ctx.adc, path.channel) <= CAP_DISCHARGED {
                discharged = true;
                break;
            }
            self.board.feed();
            self.board.delay_ms(REF_CAP_DISCHARGE_PAUSE_MS);
        }
        if !discharged {
            debug!("Reference capacitor doesn't discharge");
            return false;
        }

        self.board.select(path.channel, Reference::Vcc);
        ctx.adc.reference = Some(Reference::Vcc);
        self.board.set_enabled(false);
        self.board.connect_comparator(path.channel);
        self.board.delay_us(200);

        self.board.reset_timer();
        self.board.start_timer();
        self.board.set_level(Port::Adjust, path.rh_mask);

        let capture = self.wait_for_capture();
        self.board.set_direction(Port::Adjust, 0);
        self.board.clear_timer_flags(TimerFlags {
            capture: false,
            overflow: true,
        });

        self.board.set_enabled(true);
        self.board.disconnect_comparator();
        let u_c = self.read_voltage(&mut ctx.adc, path.channel);
        self.board.set_level(Port::Adjust, 0);
        self.board.set_direction(Port::Adjust, path.rh_mask);

        if capture.overflows >= self.config.limits.timer_overflows {
            debug!("Reference capacitor takes too long to charge");
            return false;
        }

        self.self_adjust(ctx, path, u_c, true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RefCapWiring};
    use crate::mock::MockBoard;

    const REF_CHANNEL: u8 = 3;

    fn ref_cap_tester(board: MockBoard) -> Tester<MockBoard> {
        let config = Config {
            ref_cap: Some(RefCapWiring {
                channel: REF_CHANNEL,
                rh_mask: 1,
            }),
            ..Config::default()
        };
        Tester::new(board, config)
    }

    fn path() -> DischargePath {
        DischargePath {
            channel: 0,
            port: Port::Resistor,
            rh_mask: 0b10,
        }
    }

    #[test]
    fn test_matching_references_only_adjust_comparator() {
        // 600mV reads the same against both references of the mock
        let mut board = MockBoard::default();
        board.probe_mv[0] = 600;
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();

        assert!(tester.self_adjust(&mut ctx, path(), 1044, false));
        assert_eq!(ctx.calibration.ref_offset, 0);
        assert_eq!(ctx.calibration.comp_offset, 20);
        assert_eq!(ctx.adc.bandgap_mv, 1024);
    }

    #[test]
    fn test_comparator_offset_outside_window_is_kept() {
        let mut board = MockBoard::default();
        board.probe_mv[0] = 600;
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();

        assert!(!tester.self_adjust(&mut ctx, path(), 1100, false));
        assert_eq!(ctx.calibration.comp_offset, 15);
    }

    #[test]
    fn test_deviating_bandgap_corrects_reference() {
        let mut board = MockBoard::default();
        board.probe_mv[0] = 600;
        // the real bandgap is 20mV higher than assumed
        board.bandgap_mv = 1044;
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();

        // 600mV against 1044mV: 588 steps, read back as 588mV
        assert!(tester.self_adjust(&mut ctx, path(), 1059, true));
        assert_eq!(ctx.calibration.ref_offset, 20);
        assert_eq!(ctx.adc.bandgap_mv, 1044);
        assert_eq!(ctx.calibration.comp_offset, 15);
    }

    #[test]
    fn test_adjust_gives_up_on_charged_capacitor() {
        let mut board = MockBoard::default();
        board.probe_mv[0] = 2000;
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();

        assert!(!tester.self_adjust(&mut ctx, path(), 1044, false));
        assert_eq!(ctx.calibration, MockBoard::context().calibration);
        assert_eq!(tester.board().feeds, 1000);
    }

    #[test]
    fn test_ref_cap_without_wiring() {
        let mut tester = Tester::new(MockBoard::default(), Config::default());
        let mut ctx = MockBoard::context();
        assert!(!tester.ref_cap(&mut ctx));
        assert_eq!(tester.board().conversions, 0);
    }

    #[test]
    fn test_ref_cap_not_discharging() {
        let mut board = MockBoard::default();
        board.probe_mv[REF_CHANNEL as usize] = 500;
        let mut tester = ref_cap_tester(board);
        let mut ctx = MockBoard::context();

        assert!(!tester.ref_cap(&mut ctx));
        assert_eq!(tester.board().slept_ms, 51 * 20);
        assert_eq!(tester.board().direction(Port::Adjust), 0);
    }

    #[test]
    fn test_ref_cap_charge_timeout() {
        let mut tester = ref_cap_tester(MockBoard::default());
        let mut ctx = MockBoard::context();

        assert!(!tester.ref_cap(&mut ctx));
        assert_eq!(tester.board().total_overflows, 1600);
        assert!(!tester.board().comparator_connected());
    }
}
