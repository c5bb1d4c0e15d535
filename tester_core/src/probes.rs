use tracing::{debug, trace};

use crate::{
    config::CAP_DISCHARGED,
    context::{Component, MeasurementContext},
    error::MeasureError,
    hardware::{Board, Port},
    Tester,
};

/// Wiring of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePins {
    /// ADC channel of the probe.
    pub channel: u8,
    /// Mask of the direct pin on [`Port::Probe`].
    pub pin: u8,
    /// Mask of the Rl pin on [`Port::Resistor`].
    pub rl: u8,
    /// Mask of the Rh pin on [`Port::Resistor`].
    pub rh: u8,
}

impl ProbePins {
    const fn of(id: u8) -> Self {
        Self {
            channel: id,
            pin: 1 << id,
            rl: 1 << (2 * id),
            rh: 2 << (2 * id),
        }
    }
}

/// Pins of probe 1, 2 and 3, indexed by probe id 0 to 2.
pub const PROBE_PINS: [ProbePins; 3] = [ProbePins::of(0), ProbePins::of(1), ProbePins::of(2)];
/// Direct pins of all probes.
pub const ALL_PINS: u8 = 0b0000_0111;
/// Rh pins of all probes.
pub const ALL_RH: u8 = 0b0010_1010;

/// Discharge via Rh until this voltage (mV), then pull the probe down directly.
const DIRECT_DISCHARGE_MV: u16 = 800;
/// Pause between two rounds of the probe discharge in ms.
const DISCHARGE_PAUSE_MS: u16 = 50;
/// Upper bound of the sliding discharge limit.
const MAX_DISCHARGE_ROUNDS: u16 = 235;
/// Readings of the additional cap discharge through Rl.
const CAP_DISCHARGE_READS: u16 = 200;

/// Pin and channel selection for a measurement between two probes.
/// Probe 1 is the one pulled up, probe 2 the one pulled down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeAssignment {
    pub id_1: u8,
    pub id_2: u8,
    /// The remaining probe.
    pub id_3: u8,
    pub ch_1: u8,
    pub ch_2: u8,
    pub pin_1: u8,
    pub pin_2: u8,
    pub rl_1: u8,
    pub rl_2: u8,
    pub rh_1: u8,
    pub rh_2: u8,
}

impl ProbeAssignment {
    /// Both ids have to be distinct probe ids from 0 to 2.
    pub fn new(probe_1: u8, probe_2: u8) -> Self {
        let first = PROBE_PINS[probe_1 as usize % 3];
        let second = PROBE_PINS[probe_2 as usize % 3];
        Self {
            id_1: probe_1,
            id_2: probe_2,
            id_3: (6 - probe_1 % 3 - probe_2 % 3) % 3,
            ch_1: first.channel,
            ch_2: second.channel,
            pin_1: first.pin,
            pin_2: second.pin,
            rl_1: first.rl,
            rl_2: second.rl,
            rh_1: first.rh,
            rh_2: second.rh,
        }
    }

    pub fn offset_index(&self) -> usize {
        offset_index(self.id_1, self.id_2)
    }
}

/// Index of the zero offset for a probe pair: 1-2 is 0, 1-3 is 1 and
/// 2-3 is 2, the order of the probes does not matter.
///
/// ```
/// use tester_core::probes::offset_index;
/// assert_eq!(offset_index(0, 2), 1);
/// assert_eq!(offset_index(2, 0), 1);
/// ```
pub fn offset_index(probe_1: u8, probe_2: u8) -> usize {
    (probe_1 + probe_2).saturating_sub(1).min(2) as usize
}

/// Length of a charge pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    Long,
    Short,
}

impl Pulse {
    pub fn ms(&self) -> u16 {
        match self {
            Pulse::Long => 10,
            Pulse::Short => 1,
        }
    }
}

impl<B: Board> Tester<B> {
    /// Discharge whatever sits on the probes.
    ///
    /// On failure the component is flagged as [`Component::Error`]. All pins
    /// are high impedance afterwards.
    pub fn discharge_probes(&mut self, ctx: &mut MeasurementContext) -> Result<(), MeasureError> {
        let result = self.discharge_all(ctx);
        self.board.set_direction(Port::Resistor, 0);
        self.board.set_direction(Port::Probe, 0);

        if let Err(err) = result {
            debug!("{}", err);
            ctx.check.found = Component::Error;
        }
        result
    }

    fn discharge_all(&mut self, ctx: &mut MeasurementContext) -> Result<(), MeasureError> {
        self.board.set_direction(Port::Probe, 0);
        self.board.set_level(Port::Probe, 0);
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, ALL_RH);

        let mut last = [0u16; 3];
        for (id, pins) in PROBE_PINS.iter().enumerate() {
            last[id] = self.read_voltage(&mut ctx.adc, pins.channel);
        }

        let mut limit = self.config.limits.discharge_rounds;
        let mut stalled: u16 = 1;
        let mut done: u8 = 0;
        let mut direct: u8 = 0;
        let mut id = 2;

        loop {
            id = (id + 1) % 3;
            let pins = PROBE_PINS[id];
            if done & pins.pin != 0 {
                continue;
            }

            let u = self.read_voltage(&mut ctx.adc, pins.channel);
            if u < last[id] {
                last[id] = u;
                if limit.saturating_sub(stalled) < 20 {
                    limit = (limit + 20).min(MAX_DISCHARGE_ROUNDS);
                }
                stalled = 1;
            } else {
                // a probe sitting near zero may need longer to settle
                if u < 10 && limit <= 40 {
                    limit = 80;
                }
                stalled += 1;
            }

            if u <= CAP_DISCHARGED {
                done |= pins.pin;
            } else if u < DIRECT_DISCHARGE_MV {
                direct |= pins.pin;
                self.board.set_direction(Port::Probe, direct);
            }

            if done == ALL_PINS {
                trace!("Probes discharged");
                return Ok(());
            }
            if stalled > limit {
                return Err(MeasureError::Discharge {
                    probe: id as u8,
                    voltage: u,
                });
            }

            self.board.feed();
            self.board.delay_ms(DISCHARGE_PAUSE_MS);
        }
    }

    /// Additional discharge of a capacitor between probe `a` and `b` via
    /// both Rl to ground, finished by a short circuit to ground.
    pub fn discharge_cap(&mut self, ctx: &mut MeasurementContext, a: u8, b: u8) {
        let first = PROBE_PINS[a as usize % 3];
        let second = PROBE_PINS[b as usize % 3];

        self.board.set_direction(Port::Probe, 0);
        self.board.set_level(Port::Probe, 0);
        self.board.set_level(Port::Resistor, 0);
        self.board.set_direction(Port::Resistor, first.rl | second.rl);

        for _ in 0..CAP_DISCHARGE_READS {
            let u_a = self.read_voltage(&mut ctx.adc, first.channel);
            let u_b = self.read_voltage(&mut ctx.adc, second.channel);
            if u_a <= CAP_DISCHARGED && u_b <= CAP_DISCHARGED {
                break;
            }
            self.board.feed();
        }

        self.board.set_direction(Port::Probe, first.pin | second.pin);
        self.board.delay_ms(10);
        self.board.set_direction(Port::Probe, 0);
        self.board.set_direction(Port::Resistor, 0);
    }

    /// Pull up the probe behind the resistor pins `mask` for one pulse and
    /// release it again.
    pub fn pull_probe(&mut self, mask: u8, pulse: Pulse) {
        self.board.set_level(Port::Resistor, mask);
        self.board.set_direction(Port::Resistor, mask);
        self.board.delay_ms(pulse.ms());
        self.board.set_direction(Port::Resistor, 0);
        self.board.set_level(Port::Resistor, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBoard;
    use crate::Config;

    #[test]
    fn test_probe_table() {
        let assignment = ProbeAssignment::new(2, 0);
        assert_eq!(assignment.id_3, 1);
        assert_eq!(assignment.ch_1, 2);
        assert_eq!(assignment.pin_1, 0b100);
        assert_eq!(assignment.rl_1, 0b01_0000);
        assert_eq!(assignment.rh_1, 0b10_0000);
        assert_eq!(assignment.pin_2, 0b001);
        assert_eq!(assignment.rl_2, 0b00_0001);
        assert_eq!(assignment.rh_2, 0b00_0010);
        assert_eq!(ALL_RH, PROBE_PINS.iter().fold(0, |acc, p| acc | p.rh));
    }

    #[test]
    fn test_offset_index_is_order_insensitive() {
        for (a, b, index) in [(0, 1, 0), (0, 2, 1), (1, 2, 2)] {
            assert_eq!(offset_index(a, b), index);
            assert_eq!(offset_index(b, a), index);
        }
    }

    #[test]
    fn test_discharge_probes_of_idle_board() {
        let mut tester = Tester::new(MockBoard::default(), Config::default());
        let mut ctx = MockBoard::context();

        assert_eq!(tester.discharge_probes(&mut ctx), Ok(()));
        assert_eq!(ctx.check.found, Component::None);
        assert_eq!(tester.board().direction(Port::Probe), 0);
        assert_eq!(tester.board().direction(Port::Resistor), 0);
    }

    #[test]
    fn test_discharge_probes_gives_up_on_stuck_probe() {
        let mut board = MockBoard::default();
        board.probe_mv[1] = 1500;
        let mut tester = Tester::new(board, Config::default());
        let mut ctx = MockBoard::context();

        let result = tester.discharge_probes(&mut ctx);
        assert_eq!(
            result,
            Err(MeasureError::Discharge {
                probe: 1,
                voltage: 1500
            })
        );
        assert_eq!(ctx.check.found, Component::Error);
        assert!(tester.board().feeds > 0);
        assert_eq!(tester.board().direction(Port::Probe), 0);
    }
}
