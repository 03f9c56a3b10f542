//! Time base arithmetic

use std::fmt;

/// A rational time base: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// MPEG-TS system clock base, `1/90000`.
    pub const MPEG_TS: Rational = Rational::new(1, 90_000);

    /// `1/clock_rate`, the natural time base of an RTP stream.
    pub fn from_clock_rate(clock_rate: u32) -> Option<Self> {
        let den = i32::try_from(clock_rate).ok()?;
        (den > 0).then_some(Rational::new(1, den))
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den > 0
    }

    /// Rescale `ts` from `self` into `to`.
    ///
    /// Computes `ts * self.num * to.den / (self.den * to.num)` in 128-bit
    /// integer arithmetic and rounds half away from zero, the same rule as
    /// libavutil's `av_rescale_q`. Results outside the `i64` range saturate.
    pub fn rescale(&self, ts: i64, to: Rational) -> i64 {
        if *self == to {
            return ts;
        }

        let mut num = ts as i128 * self.num as i128 * to.den as i128;
        let mut den = self.den as i128 * to.num as i128;
        if den == 0 {
            return ts;
        }
        if den < 0 {
            num = -num;
            den = -den;
        }

        let quot = num / den;
        let rem = num % den;
        let rounded = if rem.abs() * 2 >= den {
            quot + num.signum()
        } else {
            quot
        };

        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn rescale_opt(&self, ts: Option<i64>, to: Rational) -> Option<i64> {
        ts.map(|ts| self.rescale(ts, to))
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rescale_has_no_drift() {
        let tb = Rational::MPEG_TS;
        let mut ts = 0i64;
        for _ in 0..10_000 {
            assert_eq!(tb.rescale(ts, Rational::new(1, 90_000)), ts);
            ts += 3_003;
        }
        assert_eq!(ts, 30_030_000);
    }

    #[test]
    fn test_audio_clock_into_mpeg_ts() {
        let from = Rational::new(1, 48_000);
        for i in 0..10_000i64 {
            assert_eq!(from.rescale(i * 960, Rational::MPEG_TS), i * 1_800);
        }
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        // 1 tick of 1/3 -> 1/2: 1.5 -> 2
        assert_eq!(Rational::new(1, 3).rescale(1, Rational::new(1, 2)), 1);
        assert_eq!(Rational::new(1, 2).rescale(1, Rational::new(1, 1)), 1);
        assert_eq!(Rational::new(1, 2).rescale(-1, Rational::new(1, 1)), -1);
        assert_eq!(Rational::new(1, 4).rescale(1, Rational::new(1, 1)), 0);
        assert_eq!(Rational::new(3, 4).rescale(1, Rational::new(1, 1)), 1);
    }

    #[test]
    fn test_large_values_do_not_overflow() {
        let from = Rational::new(1, 90_000);
        let to = Rational::new(1, 1_000_000_000);
        let ts = 1i64 << 40;
        assert_eq!(from.rescale(ts, to), (ts as i128 * 1_000_000_000 / 90_000 + 1) as i64);
    }

    #[test]
    fn test_from_clock_rate() {
        assert_eq!(Rational::from_clock_rate(90_000), Some(Rational::MPEG_TS));
        assert_eq!(Rational::from_clock_rate(0), None);
        assert_eq!(Rational::new(1, 48_000).to_string(), "1/48000");
    }
}
