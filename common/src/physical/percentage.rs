use core::fmt::Display;

use serde::{Deserialize, Serialize};

/// A ratio stored in tenths of a percent, e.g. a voltage loss of 1.5%
/// is stored as 15.
///
/// ```
/// use common::physical::Permille;
/// let loss = Permille::ratio(12, 800).expect("whole is not zero");
/// assert_eq!(loss.value(), 15);
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permille {
    value: u16,
}

impl Permille {
    pub const ZERO: Self = Self { value: 0 };

    /// Relation of `part` to `whole`. Returns `None` for an empty whole,
    /// results beyond the `u16` range saturate.
    pub fn ratio(part: u32, whole: u32) -> Option<Self> {
        if whole == 0 {
            return None;
        }
        let value = (part as u64 * 1000) / whole as u64;
        Some(Self {
            value: value.min(u16::MAX as u64) as u16,
        })
    }

    /// Get the underlying value in 0.1%.
    pub fn value(&self) -> u16 {
        self.value
    }
}

impl Display for Permille {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}%", self.value / 10, self.value % 10)
    }
}
