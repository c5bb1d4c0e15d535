pub mod bench;
pub mod calibration_store;
