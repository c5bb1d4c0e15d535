use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tester_core::Calibration;
use thiserror::Error;

/// Layout version of the stored calibration.
const VERSION: u8 = 1;

/// Persistent store of the calibration values, loaded before a measurement
/// and written back afterwards so self-adjustments carry over.
pub trait CalibrationStore {
    /// Stored calibration, `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<Calibration>, CalibrationStoreError>;
    fn save(&self, calibration: &Calibration) -> Result<(), CalibrationStoreError>;
}

#[derive(Error, Debug)]
pub enum CalibrationStoreError {
    #[error("Failed to access the calibration file")]
    Io(#[from] io::Error),

    #[error("Failed to decode the calibration file")]
    Codec(#[from] postcard::Error),

    /// The file was written by an incompatible version.
    #[error("Unsupported calibration version {0}")]
    Version(u8),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCalibration {
    version: u8,
    calibration: Calibration,
}

/// Calibration stored as postcard in a file.
pub struct CalibrationFile {
    path: PathBuf,
}

impl CalibrationFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for CalibrationFile {
    fn load(&self) -> Result<Option<Calibration>, CalibrationStoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredCalibration = postcard::from_bytes(&bytes)?;
        if stored.version != VERSION {
            return Err(CalibrationStoreError::Version(stored.version));
        }
        Ok(Some(stored.calibration))
    }

    fn save(&self, calibration: &Calibration) -> Result<(), CalibrationStoreError> {
        let stored = StoredCalibration {
            version: VERSION,
            calibration: *calibration,
        };
        fs::write(&self.path, postcard::to_stdvec(&stored)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> CalibrationFile {
        let path = std::env::temp_dir().join(format!("{}-{}.cal", name, std::process::id()));
        let _ = fs::remove_file(&path);
        CalibrationFile::new(path)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let store = temp_file("missing");
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let store = temp_file("stored");
        let calibration = Calibration {
            ref_offset: -19,
            comp_offset: 12,
            cap_zero: [41, 43, 44],
            ..Calibration::default()
        };

        store.save(&calibration).unwrap();
        assert_eq!(store.load().unwrap(), Some(calibration));
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn test_rejects_other_version() {
        let store = temp_file("version");
        let stored = StoredCalibration {
            version: 7,
            calibration: Calibration::default(),
        };
        fs::write(store.path(), postcard::to_stdvec(&stored).unwrap()).unwrap();

        assert!(matches!(store.load(), Err(CalibrationStoreError::Version(7))));
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn test_rejects_garbage() {
        let store = temp_file("garbage");
        fs::write(store.path(), [1u8]).unwrap();

        assert!(matches!(store.load(), Err(CalibrationStoreError::Codec(_))));
        let _ = fs::remove_file(store.path());
    }
}
