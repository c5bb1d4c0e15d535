use core::{cmp::Ordering, fmt::Display};

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Powers of ten which still fit into a `u64`.
const POW10: [u64; 20] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
];

/// Store a physical magnitude as an integer and a decimal exponent.
/// The represented quantity is `value * 10^scale` in the base unit,
/// e.g. 470 with scale -9 is 470nF when the unit is Farad.
///
/// ```
/// use common::physical::ScaledValue;
/// let cap = ScaledValue::new(470, -9);
/// let in_pf = cap.rescale(-12).expect("470nF fits into 32 bits as pF");
/// assert_eq!(in_pf.value(), 470_000);
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaledValue {
    value: u32,
    scale: i8,
}

/// Represents errors in converting a `ScaledValue`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScaleError {
    /// The value would need more than 32 bits at the requested scale.
    #[error("Value does not fit into the requested scale!")]
    Overflow,
}

impl ScaledValue {
    pub const fn new(value: u32, scale: i8) -> Self {
        Self { value, scale }
    }

    /// Reduce a wide intermediate result until it fits below `limit`.
    /// Every division by ten increments the exponent, so the represented
    /// magnitude is kept apart from integer truncation.
    pub fn fit(value: u64, scale: i8, limit: u32) -> Self {
        let (value, scale) = reduce(value, scale, limit as u64, 1);
        Self {
            value: value as u32,
            scale,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn scale(&self) -> i8 {
        self.scale
    }

    /// Express the same magnitude with another exponent. Going to a larger
    /// exponent truncates, going to a smaller one fails on overflow.
    pub fn rescale(&self, scale: i8) -> Result<Self, ScaleError> {
        let shift = scale as i16 - self.scale as i16;
        let value = if shift >= 0 {
            match POW10.get(shift as usize) {
                Some(div) => self.value as u64 / div,
                None => 0,
            }
        } else {
            let mul = POW10
                .get(shift.unsigned_abs() as usize)
                .ok_or(ScaleError::Overflow)?;
            (self.value as u64)
                .checked_mul(*mul)
                .ok_or(ScaleError::Overflow)?
        };

        let value = u32::try_from(value).map_err(|_| ScaleError::Overflow)?;
        Ok(Self { value, scale })
    }

    /// Compare two magnitudes regardless of their exponents.
    ///
    /// ```
    /// use common::physical::ScaledValue;
    /// use core::cmp::Ordering;
    /// let a = ScaledValue::new(10, -9);
    /// let b = ScaledValue::new(9_999, -12);
    /// assert_eq!(a.cmp_magnitude(&b), Ordering::Greater);
    /// ```
    pub fn cmp_magnitude(&self, other: &Self) -> Ordering {
        match (self.value, other.value) {
            (0, 0) => return Ordering::Equal,
            (0, _) => return Ordering::Less,
            (_, 0) => return Ordering::Greater,
            _ => {}
        }

        let own = digits(self.value as u64) + self.scale as i16;
        let theirs = digits(other.value as u64) + other.scale as i16;
        if own != theirs {
            return own.cmp(&theirs);
        }

        // Same number of significant places. The exponents can only differ
        // by up to nine, so aligning both in 64 bits is safe.
        let base = self.scale.min(other.scale);
        let a = self.value as u64 * POW10[(self.scale as i16 - base as i16) as usize];
        let b = other.value as u64 * POW10[(other.scale as i16 - base as i16) as usize];
        a.cmp(&b)
    }

    /// Shorthand for `cmp_magnitude` against a literal magnitude.
    pub fn cmp_to(&self, value: u32, scale: i8) -> Ordering {
        self.cmp_magnitude(&Self::new(value, scale))
    }
}

impl Display for ScaledValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}e{}", self.value, self.scale)
    }
}

/// Number of decimal digits of a value, zero has one.
fn digits(mut value: u64) -> i16 {
    let mut count = 1;
    while value >= 10 {
        value /= 10;
        count += 1;
    }
    count
}

/// Divide `value` by `10^step` until it is no larger than `limit` and
/// return the reduced value together with the advanced exponent.
/// A `step` of zero or beyond the `u64` range leaves the value untouched.
pub fn reduce(mut value: u64, mut scale: i8, limit: u64, step: u8) -> (u64, i8) {
    let divisor = match POW10.get(step as usize) {
        Some(&divisor) if step > 0 => divisor,
        _ => return (value, scale),
    };
    while value > limit {
        value /= divisor;
        scale = scale.saturating_add(step as i8);
    }
    (value, scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale() {
        let cap = ScaledValue::new(4_700, -9);
        assert_eq!(cap.rescale(-12), Ok(ScaledValue::new(4_700_000, -12)));
        assert_eq!(cap.rescale(-6), Ok(ScaledValue::new(4, -6)));
        assert_eq!(cap.rescale(-8), Ok(ScaledValue::new(470, -8)));
        assert_eq!(cap.rescale(12), Ok(ScaledValue::new(0, 12)));

        let cap = ScaledValue::new(5_000_000, -9);
        assert_eq!(cap.rescale(-12), Err(ScaleError::Overflow));
    }

    #[test]
    fn test_cmp_magnitude() {
        let ten_nf = ScaledValue::new(10, -9);
        assert_eq!(ten_nf.cmp_to(10_000, -12), Ordering::Equal);
        assert_eq!(ten_nf.cmp_to(9_999, -12), Ordering::Greater);
        assert_eq!(ten_nf.cmp_to(10_001, -12), Ordering::Less);
        assert_eq!(ten_nf.cmp_to(1, -6), Ordering::Less);
        assert_eq!(ten_nf.cmp_to(0, 0), Ordering::Greater);
        assert_eq!(ScaledValue::new(0, -12).cmp_to(0, -6), Ordering::Equal);
        assert_eq!(ScaledValue::new(0, -12).cmp_to(1, -15), Ordering::Less);

        // 4.7 Ohms against the 10 Ohms threshold.
        assert_eq!(ScaledValue::new(47, -1).cmp_to(10, 0), Ordering::Less);
        // 1001uF against 1000uF in different units.
        assert_eq!(
            ScaledValue::new(1_001_000, -9).cmp_to(1_000, -6),
            Ordering::Greater
        );
    }

    #[test]
    fn test_fit_keeps_magnitude() {
        let samples: [(u64, i8); 5] = [
            (123_456_789_012, -12),
            (4_294_967_296, -9),
            (800_001, -9),
            (65_535, -6),
            (99, -12),
        ];

        for (raw, scale) in samples {
            let fitted = ScaledValue::fit(raw, scale, u16::MAX as u32);
            assert!(fitted.value() <= u16::MAX as u32);

            let shift = (fitted.scale() - scale) as u32;
            let rebuilt = fitted.value() as u64 * 10u64.pow(shift);
            assert!(rebuilt <= raw);
            assert!(raw - rebuilt < 10u64.pow(shift));
        }
    }

    #[test]
    fn test_reduce_by_thousands() {
        assert_eq!(reduce(5_000_000, -9, 4_294_967, 3), (5_000, -6));
        assert_eq!(reduce(4_294_967, -9, 4_294_967, 3), (4_294_967, -9));
    }

    #[test]
    fn test_reduce_without_step() {
        assert_eq!(reduce(5_000_000, -9, 1_000, 0), (5_000_000, -9));
        assert_eq!(reduce(5_000_000, -9, 1_000, 20), (5_000_000, -9));
    }

    #[test]
    fn test_scaled_value_serialization() {
        let cap = ScaledValue::new(100_000, -9);
        let bytes =
            postcard::to_vec::<ScaledValue, 16>(&cap).expect("Failed to serialize ScaledValue");
        assert!(bytes.len() <= 6);
    }
}
