use embedded_hal::{
    blocking::delay::{DelayMs, DelayUs},
    watchdog::Watchdog,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tester_core::{
    config::{R_HIGH, R_LOW, R_MCU_HIGH, R_MCU_LOW},
    esr::DELAY_TIMER_OVERHEAD,
    probes::PROBE_PINS,
    AdcDriver, AnalogComparator, CaptureTimer, CycleTimer, PinDriver, Port, Reference, TimerFlags,
};
use tracing::trace;

use crate::models::dut::Dut;

use super::circuit::{Circuit, CircuitError, Drive, REF_NODE};

/// ADC channel of the reference capacitor.
pub const REF_CHANNEL: u8 = REF_NODE as u8;
/// Mask of the Rh pin of the reference capacitor on [`Port::Adjust`].
pub const REF_RH_MASK: u8 = 0b1;

/// Longest stretch of time simulated with one set of sources.
const MAX_STEP: f64 = 100e-6;
/// Time a poll of a stopped timer takes.
const IDLE_POLL: f64 = 1e-6;
/// Halvings when looking for the moment the comparator trips.
const BISECTIONS: usize = 48;
/// Clamp diodes of the port pins, conducting beyond the supply rails.
const CLAMP_OHM: f64 = 50.0;
const CLAMP_MARGIN: f64 = 1e-3;
/// Sample and hold and end of a conversion, in ADC clocks after the start.
/// A started conversion waits for the next ADC clock edge first.
const SAMPLE_CLOCKS: f64 = 2.125;
const CONVERSION_CLOCKS: f64 = 13.0;
const TIMER_PERIOD: f64 = 65_536.0;

/// Physical properties of the simulated tester.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchParams {
    /// Supply voltage in V.
    pub vcc: f64,
    /// Actual bandgap reference voltage in V.
    pub bandgap: f64,
    /// Actual offset of the analog comparator in V.
    pub comparator_offset: f64,
    pub cpu_hz: u32,
    pub adc_hz: u32,
    /// Capacitance of each probe to ground in F.
    pub stray: f64,
    /// The fixed reference capacitor in F.
    pub ref_cap: f64,
    /// Seed of the ADC's quantization noise.
    pub seed: u64,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            vcc: 5.0,
            bandgap: 1.1,
            comparator_offset: 0.015,
            cpu_hz: tester_core::config::CPU_HZ,
            adc_hz: tester_core::config::ADC_HZ,
            stray: 40e-12,
            ref_cap: 1e-6,
            seed: 0,
        }
    }
}

/// State of the clamp diodes of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Clamp {
    #[default]
    Off,
    /// Conducting from ground.
    Low,
    /// Conducting to Vcc.
    High,
}

#[derive(Debug, Clone, Copy)]
struct Conversion {
    channel: u8,
    u_ref: f64,
    sample_at: f64,
    done_at: f64,
    sample: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timer {
    running: bool,
    /// Ticks counted before the last start.
    base: f64,
    started_at: f64,
    overflows: u32,
    flags: TimerFlags,
    captured: u16,
}

/// Simulated tester: the MCU peripherals in front of the probe circuit.
///
/// Time only passes when the measurement waits for something, i.e. on
/// delays, conversions and timer polls.
pub struct BenchBoard {
    circuit: Circuit,
    params: BenchParams,
    rng: StdRng,
    time: f64,

    directions: [u8; 3],
    levels: [u8; 3],
    channel: u8,
    reference: Reference,
    conversion: Option<Conversion>,
    result: u16,
    adc_enabled: bool,
    comparator: Option<u8>,
    timer: Timer,
    cycles: u8,
    clamps: [Clamp; REF_NODE + 1],

    last_feed: f64,
    longest_gap: f64,
    feeds: usize,
}

impl BenchBoard {
    /// Bench with `dut` between probe `a` and `b` (0 to 2).
    pub fn new(dut: &Dut, a: usize, b: usize, params: BenchParams) -> Result<Self, CircuitError> {
        let circuit = Circuit::new(dut, a, b, params.stray, params.ref_cap)?;
        Ok(Self {
            circuit,
            params,
            rng: StdRng::seed_from_u64(params.seed),
            time: 0.0,
            directions: [0; 3],
            levels: [0; 3],
            channel: 0,
            reference: Reference::Vcc,
            conversion: None,
            result: 0,
            adc_enabled: true,
            comparator: None,
            timer: Timer::default(),
            cycles: 0,
            clamps: [Clamp::Off; REF_NODE + 1],
            last_feed: 0.0,
            longest_gap: 0.0,
            feeds: 0,
        })
    }

    /// Simulated time since power up in s.
    pub fn elapsed(&self) -> f64 {
        self.time
    }

    /// Longest time the watchdog went without a feed in s.
    pub fn longest_feed_gap(&self) -> f64 {
        self.longest_gap.max(self.time - self.last_feed)
    }

    pub fn feeds(&self) -> usize {
        self.feeds
    }

    /// Voltage on an ADC channel in V.
    pub fn voltage(&self, channel: u8) -> f64 {
        match channel as usize {
            node if node <= REF_NODE => self.circuit.voltage(node),
            _ => 0.0,
        }
    }

    fn index(port: Port) -> usize {
        match port {
            Port::Probe => 0,
            Port::Resistor => 1,
            Port::Adjust => 2,
        }
    }

    /// Level of the pin `mask` on `port`, `None` while it is high impedance.
    fn driven(&self, port: Port, mask: u8) -> Option<bool> {
        let i = Self::index(port);
        (self.directions[i] & mask != 0).then(|| self.levels[i] & mask != 0)
    }

    /// Sources of the current pin configuration and clamp diodes.
    fn drive(&self) -> Drive {
        let mut drive = Drive::default();
        let vcc = self.params.vcc;
        let pin = |high: bool| match high {
            true => (R_MCU_HIGH as f64 / 10.0, vcc),
            false => (R_MCU_LOW as f64 / 10.0, 0.0),
        };

        for (node, pins) in PROBE_PINS.iter().enumerate() {
            let outputs = [
                (Port::Probe, pins.pin, 0.0),
                (Port::Resistor, pins.rl, R_LOW as f64),
                (Port::Resistor, pins.rh, R_HIGH as f64),
            ];
            for (port, mask, series) in outputs {
                if let Some(high) = self.driven(port, mask) {
                    let (ohm, volt) = pin(high);
                    drive.connect(node, series + ohm, volt);
                }
            }
        }
        if let Some(high) = self.driven(Port::Adjust, REF_RH_MASK) {
            let (ohm, volt) = pin(high);
            drive.connect(REF_NODE, R_HIGH as f64 + ohm, volt);
        }

        for (node, clamp) in self.clamps.iter().enumerate() {
            match clamp {
                Clamp::Low => drive.connect(node, CLAMP_OHM, 0.0),
                Clamp::High => drive.connect(node, CLAMP_OHM, vcc),
                Clamp::Off => {}
            }
        }
        drive
    }

    /// A diode starts to conduct beyond the margin and keeps conducting
    /// as long as the node stays beyond the rail.
    fn update_clamps(&mut self) {
        let vcc = self.params.vcc;
        for (node, clamp) in self.clamps.iter_mut().enumerate() {
            let v = self.circuit.voltage(node);
            *clamp = match *clamp {
                Clamp::Low if v < 0.0 => Clamp::Low,
                Clamp::High if v > vcc => Clamp::High,
                _ if v < -CLAMP_MARGIN => Clamp::Low,
                _ if v > vcc + CLAMP_MARGIN => Clamp::High,
                _ => Clamp::Off,
            };
        }
    }

    fn advance(&mut self, dt: f64) {
        self.advance_to(self.time + dt, None);
    }

    /// Let time pass up to `until`. With `trip` set, stop as soon as the
    /// voltage on that node exceeds the threshold and return true.
    fn advance_to(&mut self, until: f64, trip: Option<(usize, f64)>) -> bool {
        if let Some((node, threshold)) = trip {
            if self.circuit.voltage(node) > threshold {
                return true;
            }
        }

        while self.time < until {
            let mut next = until.min(self.time + MAX_STEP);
            if let Some(conversion) = self.conversion {
                if conversion.sample.is_none() && conversion.sample_at > self.time {
                    next = next.min(conversion.sample_at);
                }
            }

            self.update_clamps();
            let start = self.circuit.voltages();
            let drive = self.drive();
            let dt = next - self.time;
            let end = self.circuit.evolve(&start, &drive, dt);

            if let Some((node, threshold)) = trip {
                if end[node] > threshold {
                    let (mut low, mut high) = (0.0, dt);
                    for _ in 0..BISECTIONS {
                        let mid = 0.5 * (low + high);
                        match self.circuit.evolve(&start, &drive, mid)[node] > threshold {
                            true => high = mid,
                            false => low = mid,
                        }
                    }
                    let tripped = self.circuit.evolve(&start, &drive, high);
                    self.circuit.set_voltages(tripped);
                    self.time += high;
                    self.take_sample();
                    return true;
                }
            }

            self.circuit.set_voltages(end);
            self.time = next;
            self.take_sample();
        }
        false
    }

    fn take_sample(&mut self) {
        let time = self.time;
        if let Some(conversion) = self.conversion.as_mut() {
            if conversion.sample.is_none() && time >= conversion.sample_at {
                let node = conversion.channel as usize;
                conversion.sample = Some(match node <= REF_NODE {
                    true => self.circuit.voltage(node),
                    false => 0.0,
                });
            }
        }
    }

    fn quantize(&mut self, volt: f64, u_ref: f64) -> u16 {
        let dither: f64 = self.rng.gen();
        let raw = (volt / u_ref * 1024.0 + dither).floor();
        raw.clamp(0.0, 1023.0) as u16
    }

    fn ticks(&self) -> f64 {
        match self.timer.running {
            true => self.timer.base + (self.time - self.timer.started_at) * self.params.cpu_hz as f64,
            false => self.timer.base,
        }
    }

    /// Node watched by the comparator and its switching threshold.
    fn comparator_trip(&self) -> Option<(usize, f64)> {
        let node = self.comparator? as usize;
        (node <= REF_NODE).then(|| (node, self.params.bandgap + self.params.comparator_offset))
    }
}

impl PinDriver for BenchBoard {
    fn set_direction(&mut self, port: Port, mask: u8) {
        self.directions[Self::index(port)] = mask;
    }

    fn set_level(&mut self, port: Port, mask: u8) {
        self.levels[Self::index(port)] = mask;
    }
}

impl AdcDriver for BenchBoard {
    fn select(&mut self, channel: u8, reference: Reference) {
        self.channel = channel;
        self.reference = reference;
    }

    fn start_conversion(&mut self) {
        if !self.adc_enabled {
            return;
        }
        let clock = 1.0 / self.params.adc_hz as f64;
        let u_ref = match self.reference {
            Reference::Vcc => self.params.vcc,
            Reference::Bandgap => self.params.bandgap,
        };
        self.conversion = Some(Conversion {
            channel: self.channel,
            u_ref,
            sample_at: self.time + SAMPLE_CLOCKS * clock,
            done_at: self.time + CONVERSION_CLOCKS * clock,
            sample: None,
        });
    }

    fn conversion_done(&mut self) -> bool {
        let Some(conversion) = self.conversion else {
            return true;
        };
        self.advance_to(conversion.done_at, None);
        if let Some(conversion) = self.conversion.take() {
            let volt = conversion.sample.unwrap_or(0.0);
            self.result = self.quantize(volt, conversion.u_ref);
        }
        true
    }

    fn result(&mut self) -> u16 {
        self.result
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.adc_enabled = enabled;
    }
}

impl AnalogComparator for BenchBoard {
    fn connect_comparator(&mut self, channel: u8) {
        self.comparator = Some(channel);
    }

    fn disconnect_comparator(&mut self) {
        self.comparator = None;
    }
}

impl CaptureTimer for BenchBoard {
    fn reset_timer(&mut self) {
        self.timer = Timer::default();
    }

    fn start_timer(&mut self) {
        if !self.timer.running {
            self.timer.started_at = self.time;
            self.timer.running = true;
        }
    }

    fn stop_timer(&mut self) {
        self.timer.base = self.ticks();
        self.timer.running = false;
    }

    fn timer_flags(&mut self) -> TimerFlags {
        if !self.timer.running {
            self.advance(IDLE_POLL);
            return self.timer.flags;
        }
        if self.timer.flags.capture || self.timer.flags.overflow {
            return self.timer.flags;
        }

        let period_end = (self.timer.overflows + 1) as f64 * TIMER_PERIOD;
        let overflow_at =
            self.timer.started_at + (period_end - self.timer.base) / self.params.cpu_hz as f64;
        if self.advance_to(overflow_at, self.comparator_trip()) {
            self.timer.flags.capture = true;
            self.timer.captured = (self.ticks() as u64 & 0xFFFF) as u16;
            trace!("Comparator tripped after {:.1}us", self.ticks() * 1e6 / self.params.cpu_hz as f64);
        } else {
            self.timer.flags.overflow = true;
            self.timer.overflows += 1;
        }
        self.timer.flags
    }

    fn clear_timer_flags(&mut self, flags: TimerFlags) {
        self.timer.flags.capture &= !flags.capture;
        self.timer.flags.overflow &= !flags.overflow;
    }

    fn captured_ticks(&self) -> u16 {
        self.timer.captured
    }

    fn timer_ticks(&self) -> u16 {
        (self.ticks() as u64 & 0xFFFF) as u16
    }
}

impl CycleTimer for BenchBoard {
    fn set_cycles(&mut self, cycles: u8) {
        self.cycles = cycles;
    }

    fn run_cycles(&mut self) {
        let cycles = self.cycles as u32 + DELAY_TIMER_OVERHEAD;
        self.advance(cycles as f64 / self.params.cpu_hz as f64);
    }

    fn stop_cycles(&mut self) {}
}

impl DelayUs<u16> for BenchBoard {
    fn delay_us(&mut self, us: u16) {
        self.advance(us as f64 * 1e-6);
    }
}

impl DelayMs<u16> for BenchBoard {
    fn delay_ms(&mut self, ms: u16) {
        self.advance(ms as f64 * 1e-3);
    }
}

impl Watchdog for BenchBoard {
    fn feed(&mut self) {
        self.longest_gap = self.longest_gap.max(self.time - self.last_feed);
        self.last_feed = self.time;
        self.feeds += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(board: &mut BenchBoard, channel: u8, reference: Reference) -> u16 {
        board.select(channel, reference);
        board.start_conversion();
        while !board.conversion_done() {}
        board.result()
    }

    #[test]
    fn test_adc_reads_driven_probes() {
        let mut board = BenchBoard::new(&Dut::Resistor(680.0), 0, 1, BenchParams::default()).unwrap();
        board.set_level(Port::Probe, 0b01);
        board.set_direction(Port::Probe, 0b11);

        // 5V * 700 / 722 against Vcc, 5V * 20 / 722 against the bandgap
        let raw = convert(&mut board, 0, Reference::Vcc);
        assert!((992..=993).contains(&raw), "{}", raw);
        let raw = convert(&mut board, 1, Reference::Bandgap);
        assert!((128..=129).contains(&raw), "{}", raw);
        assert!((board.elapsed() - 208e-6).abs() < 1e-9);
    }

    #[test]
    fn test_timer_overflows_without_comparator() {
        let mut board = BenchBoard::new(&Dut::Open, 0, 1, BenchParams::default()).unwrap();
        board.reset_timer();
        board.start_timer();

        let flags = board.timer_flags();
        assert!(flags.overflow && !flags.capture);
        assert!((board.elapsed() - 8.192e-3).abs() < 1e-9);
        assert_eq!(board.timer_flags(), flags);

        board.clear_timer_flags(flags);
        assert!(board.timer_flags().overflow);
        assert!((board.elapsed() - 16.384e-3).abs() < 1e-9);
    }

    #[test]
    fn test_comparator_captures_charging_capacitor() {
        let dut = Dut::Capacitor {
            farad: 1e-9,
            esr: 0.01,
            leakage: f64::INFINITY,
        };
        let mut board = BenchBoard::new(&dut, 0, 1, BenchParams::default()).unwrap();
        board.set_direction(Port::Probe, PROBE_PINS[1].pin);
        board.set_level(Port::Resistor, PROBE_PINS[0].rh);
        board.set_direction(Port::Resistor, PROBE_PINS[0].rh);
        board.connect_comparator(0);
        board.reset_timer();
        board.start_timer();

        let flags = board.timer_flags();
        assert!(flags.capture);
        // 1.115V after about 123us via 470kOhm
        let ticks = board.captured_ticks();
        assert!((980..=992).contains(&ticks), "{}", ticks);
        assert!((board.voltage(0) - 1.115).abs() < 1e-6);
    }

    #[test]
    fn test_delay_timer_includes_overhead() {
        let mut board = BenchBoard::new(&Dut::Open, 0, 1, BenchParams::default()).unwrap();
        board.set_cycles(50);
        board.run_cycles();
        assert!((board.elapsed() - 67.0 / 8e6).abs() < 1e-12);
    }

    #[test]
    fn test_longest_feed_gap() {
        let mut board = BenchBoard::new(&Dut::Open, 0, 1, BenchParams::default()).unwrap();
        board.delay_ms(100);
        board.feed();
        board.delay_ms(300);
        board.feed();
        board.delay_ms(50);

        assert_eq!(board.feeds(), 2);
        assert!((board.longest_feed_gap() - 0.3).abs() < 1e-9);
    }
}
