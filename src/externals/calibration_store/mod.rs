use std::path::Path;

use self::services::CalibrationFile;

pub mod services;

pub struct CalibrationStoreModule {
    pub calibration_store: CalibrationFile,
}

impl CalibrationStoreModule {
    pub fn initialize(path: impl AsRef<Path>) -> Self {
        Self {
            calibration_store: CalibrationFile::new(path),
        }
    }
}
