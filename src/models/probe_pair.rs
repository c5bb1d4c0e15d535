use std::{fmt::Display, str::FromStr};

use thiserror::Error;

/// Two distinct probes, numbered 1 to 3 on the outside and 0 to 2 inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePair {
    first: u8,
    second: u8,
}

#[derive(Error, Debug, PartialEq)]
pub enum ProbePairError {
    #[error("Expected two probes like '1-2'")]
    Format,
    #[error("Probe {0} doesn't exist, probes are numbered 1 to 3")]
    InvalidProbe(u8),
    #[error("Both probes are the same")]
    SameProbe,
}

impl ProbePair {
    /// Pair of the probe ids 0 to 2.
    pub fn new(first: u8, second: u8) -> Result<Self, ProbePairError> {
        for id in [first, second] {
            if id > 2 {
                return Err(ProbePairError::InvalidProbe(id + 1));
            }
        }
        if first == second {
            return Err(ProbePairError::SameProbe);
        }
        Ok(Self { first, second })
    }

    /// Probe ids, 0 to 2.
    pub fn probes(&self) -> (u8, u8) {
        (self.first, self.second)
    }
}

impl Default for ProbePair {
    fn default() -> Self {
        Self {
            first: 0,
            second: 1,
        }
    }
}

impl FromStr for ProbePair {
    type Err = ProbePairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (first, second) = s.split_once('-').ok_or(ProbePairError::Format)?;
        let number = |text: &str| match text.trim().parse::<u8>() {
            Ok(0) => Err(ProbePairError::InvalidProbe(0)),
            Ok(n) => Ok(n - 1),
            Err(_) => Err(ProbePairError::Format),
        };
        Self::new(number(first)?, number(second)?)
    }
}

impl Display for ProbePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.first + 1, self.second + 1)
    }
}
