use crate::models::{dut::Dut, probe_pair::ProbePair};

use self::{
    adapters::{BenchBoard, BenchParams},
    circuit::CircuitError,
};

pub mod adapters;
pub mod circuit;

pub struct BenchModule {
    pub board: BenchBoard,
}

impl BenchModule {
    /// Wire `dut` to the probes of `pair`, the first probe taking its
    /// positive side.
    pub fn initialize(dut: &Dut, pair: ProbePair, params: BenchParams) -> Result<Self, CircuitError> {
        let (a, b) = pair.probes();
        Ok(Self {
            board: BenchBoard::new(dut, a as usize, b as usize, params)?,
        })
    }
}
