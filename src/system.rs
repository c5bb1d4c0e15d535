use tester_core::{
    config::UREF_BANDGAP, Calibration, Check, Component, Config, MeasurementContext, Tester,
};
use tracing::{info, instrument};

use crate::{
    externals::bench::adapters::BenchBoard,
    models::{probe_pair::ProbePair, report::Report},
};

/// Slot of the capacitor records used by the bench.
const SLOT: usize = 0;

/// The measurement core running on the bench, with the state of one power
/// cycle of the tester.
pub struct Session {
    tester: Tester<BenchBoard>,
    ctx: MeasurementContext,
}

impl Session {
    pub fn new(board: BenchBoard, config: Config, calibration: Calibration) -> Self {
        Self {
            tester: Tester::new(board, config),
            ctx: MeasurementContext::new(calibration, UREF_BANDGAP),
        }
    }

    /// Adjust the calibration with the fixed reference capacitor, if the
    /// board has one.
    #[instrument(skip_all)]
    pub fn adjust(&mut self) -> bool {
        let adjusted = self.tester.ref_cap(&mut self.ctx);
        info!(
            "Reference capacitor: adjusted {}, bandgap {}mV",
            adjusted, self.ctx.adc.bandgap_mv
        );
        adjusted
    }

    /// Measure the capacitor between `pair`, on top of the findings of the
    /// earlier component checks in `check`. The ESR follows for anything
    /// classified as a capacitor.
    #[instrument(skip(self, check))]
    pub fn measure(&mut self, pair: ProbePair, check: Check) -> Report {
        self.ctx.check = check;
        let (first, second) = pair.probes();
        self.tester.measure_cap(&mut self.ctx, first, second, SLOT);

        let esr = match self.ctx.check.found {
            Component::Capacitor => self.tester.measure_esr(&mut self.ctx, SLOT),
            _ => None,
        };

        let report = Report {
            pair,
            found: self.ctx.check.found,
            capacitor: self.ctx.caps[SLOT],
            esr,
            calibration: self.ctx.calibration,
        };
        info!("{}", report);
        report
    }

    pub fn calibration(&self) -> Calibration {
        self.ctx.calibration
    }

    pub fn context(&self) -> &MeasurementContext {
        &self.ctx
    }

    pub fn board(&self) -> &BenchBoard {
        self.tester.board()
    }
}
