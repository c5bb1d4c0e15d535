pub mod externals;
pub mod models;
pub mod system;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use externals::{
    bench::{
        adapters::{BenchParams, REF_CHANNEL, REF_RH_MASK},
        BenchModule,
    },
    calibration_store::{services::CalibrationStore, CalibrationStoreModule},
};
use models::{dut::Dut, probe_pair::ProbePair};
use system::Session;
use tester_core::{config::RefCapWiring, Calibration, Check, Config, EsrMethod};
use tracing::{info, level_filters::LevelFilter};

#[derive(Parser)]
#[command(name = "component-tester-bench")]
#[command(about = "Capacitance and ESR measurement on a simulated component tester", long_about = None)]
#[command(version)]
struct Cli {
    /// Device under test: open, r=<ohm> or c=<farad>[,esr=<ohm>][,leak=<ohm>]
    #[arg(short, long, default_value = "c=100u")]
    dut: Dut,

    /// Probes the DUT is connected to, its positive side first
    #[arg(short, long, default_value = "1-2")]
    probes: ProbePair,

    /// ESR measurement method
    #[arg(long, value_enum, default_value = "synchronized")]
    esr: EsrArg,

    /// Calibration file, read before and written after the measurement
    #[arg(short, long, value_name = "FILE")]
    calibration: Option<PathBuf>,

    /// Fit the board with a fixed reference capacitor for the self-adjustment
    #[arg(long)]
    ref_cap: bool,

    /// Measure the voltage loss of capacitors
    #[arg(long)]
    voltage_loss: bool,

    /// Actual bandgap voltage of the simulated MCU in mV
    #[arg(long, default_value_t = 1100)]
    bandgap: u16,

    /// Actual offset of the simulated analog comparator in mV
    #[arg(long, default_value_t = 15, allow_hyphen_values = true)]
    comparator_offset: i16,

    /// Seed of the ADC noise
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// More log output, -v for debug and -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum EsrArg {
    /// Short pulses synchronized with the ADC, from 10nF
    Synchronized,
    /// Older method, from 180nF
    Legacy,
    Off,
}

impl From<EsrArg> for EsrMethod {
    fn from(value: EsrArg) -> Self {
        match value {
            EsrArg::Synchronized => EsrMethod::Synchronized,
            EsrArg::Legacy => EsrMethod::Legacy,
            EsrArg::Off => EsrMethod::Disabled,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = cli.calibration.as_ref().map(CalibrationStoreModule::initialize);
    let calibration = match &store {
        Some(module) => module.calibration_store.load()?.unwrap_or_default(),
        None => Calibration::default(),
    };

    let mut config = Config::default();
    config.esr = cli.esr.into();
    config.features.voltage_loss = cli.voltage_loss;
    if cli.ref_cap {
        config.features.fixed_ref_cap = true;
        config.ref_cap = Some(RefCapWiring {
            channel: REF_CHANNEL,
            rh_mask: REF_RH_MASK,
        });
    }

    let params = BenchParams {
        bandgap: cli.bandgap as f64 / 1000.0,
        comparator_offset: cli.comparator_offset as f64 / 1000.0,
        seed: cli.seed,
        ..BenchParams::default()
    };
    let BenchModule { board } = BenchModule::initialize(&cli.dut, cli.probes, params)?;
    info!("Measuring {} on probes {}", cli.dut, cli.probes);

    let mut session = Session::new(board, config, calibration);
    if cli.ref_cap {
        session.adjust();
    }
    let report = session.measure(cli.probes, Check::default());
    println!("{}", report);

    let adjusted = session.calibration();
    if adjusted != calibration {
        println!(
            "Calibration: reference offset {}mV, comparator offset {}mV",
            adjusted.ref_offset, adjusted.comp_offset
        );
    }
    info!(
        "Took {:.3}s, longest watchdog gap {:.3}s",
        session.board().elapsed(),
        session.board().longest_feed_gap()
    );

    if let Some(module) = store {
        module.calibration_store.save(&adjusted)?;
    }
    Ok(())
}
