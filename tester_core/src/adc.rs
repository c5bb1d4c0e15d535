use crate::{
    config::AUTOSCALE_LIMIT,
    context::AdcSettings,
    hardware::{Board, Reference},
    Tester,
};

/// Settling time after switching the reference, in us.
const REFERENCE_SETTLE_US: u16 = 100;
/// Samples against Vcc before deciding on the bandgap reference.
const AUTOSCALE_SAMPLES: u8 = 4;

/// How a voltage gets read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMode {
    pub samples: u8,
    pub auto_scale: bool,
}

impl ReadMode {
    /// The regular reading configured in `settings`.
    pub fn from_settings(settings: &AdcSettings) -> Self {
        Self {
            samples: settings.samples,
            auto_scale: settings.auto_scale,
        }
    }
}

impl<B: Board> Tester<B> {
    /// Averaged voltage on `channel` in mV.
    pub fn read_voltage(&mut self, adc: &mut AdcSettings, channel: u8) -> u16 {
        self.read_voltage_with(adc, channel, ReadMode::from_settings(adc))
    }

    /// Averaged voltage on `channel` in mV.
    ///
    /// With auto scaling a reading which averages below 1V over its first
    /// samples restarts against the bandgap reference for a better
    /// resolution.
    pub fn read_voltage_with(&mut self, adc: &mut AdcSettings, channel: u8, mode: ReadMode) -> u16 {
        let samples = mode.samples.max(1);
        let autoscale_raw = AUTOSCALE_LIMIT as u32 * 1024 / adc.vcc_mv.max(1) as u32;
        let mut reference = Reference::Vcc;

        'read: loop {
            self.board.select(channel, reference);
            if adc.reference != Some(reference) {
                self.board.delay_us(REFERENCE_SETTLE_US);
                self.convert();
                adc.reference = Some(reference);
            }

            let mut sum: u32 = 0;
            for n in 0..samples {
                if mode.auto_scale
                    && reference == Reference::Vcc
                    && n == AUTOSCALE_SAMPLES
                    && sum < AUTOSCALE_SAMPLES as u32 * autoscale_raw
                {
                    reference = Reference::Bandgap;
                    continue 'read;
                }
                sum += self.convert() as u32;
            }

            let u_ref = match reference {
                Reference::Vcc => adc.vcc_mv,
                Reference::Bandgap => adc.bandgap_mv,
            };
            return (sum as u64 * u_ref as u64 / (1024 * samples as u64)) as u16;
        }
    }

    /// Run a single conversion on the selected channel.
    pub(crate) fn convert(&mut self) -> u16 {
        self.board.start_conversion();
        while !self.board.conversion_done() {}
        self.board.result()
    }
}
