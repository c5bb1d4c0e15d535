pub mod dut;
pub mod probe_pair;
pub mod report;
