use std::{fmt, str::FromStr, time};

/// A Gateway API duration, e.g. `1h30m` or `250ms`.
///
/// Values are one to four `<number><unit>` pairs where the number has at
/// most five digits and the unit is one of `h`, `m`, `s`, or `ms`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(time::Duration);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseDurationError {
    #[error("empty duration")]
    Empty,

    #[error("expected a number at {0:?}")]
    NoNumber(String),

    #[error("number {0:?} has more than 5 digits")]
    TooManyDigits(String),

    #[error("invalid unit {0:?}; expected one of 'h', 'm', 's', or 'ms'")]
    InvalidUnit(String),

    #[error("more than 4 components")]
    TooManyComponents,
}

const MAX_COMPONENTS: usize = 4;
const MAX_DIGITS: usize = 5;

// === impl Duration ===

impl Duration {
    pub fn as_std(&self) -> time::Duration {
        self.0
    }
}

impl From<Duration> for time::Duration {
    fn from(Duration(d): Duration) -> Self {
        d
    }
}

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseDurationError::Empty);
        }

        let mut total = time::Duration::ZERO;
        let mut rest = s;
        let mut components = 0;
        while !rest.is_empty() {
            components += 1;
            if components > MAX_COMPONENTS {
                return Err(ParseDurationError::TooManyComponents);
            }

            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(ParseDurationError::NoNumber(rest.to_string()));
            }
            if digits > MAX_DIGITS {
                return Err(ParseDurationError::TooManyDigits(rest[..digits].to_string()));
            }
            // At most five ASCII digits always fit.
            let value = rest[..digits].parse::<u64>().unwrap_or_default();
            rest = &rest[digits..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let unit = &rest[..unit_len];
            total += match unit {
                "h" => time::Duration::from_secs(value * 60 * 60),
                "m" => time::Duration::from_secs(value * 60),
                "s" => time::Duration::from_secs(value),
                "ms" => time::Duration::from_millis(value),
                _ => return Err(ParseDurationError::InvalidUnit(unit.to_string())),
            };
            rest = &rest[unit_len..];
        }

        Ok(Self(total))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis == 0 {
            return f.write_str("0s");
        }
        let (h, rem) = (millis / 3_600_000, millis % 3_600_000);
        let (m, rem) = (rem / 60_000, rem % 60_000);
        let (s, ms) = (rem / 1000, rem % 1000);
        for (v, unit) in [(h, "h"), (m, "m"), (s, "s"), (ms, "ms")] {
            if v > 0 {
                write!(f, "{v}{unit}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<time::Duration, ParseDurationError> {
        s.parse::<Duration>().map(Into::into)
    }

    #[test]
    fn parses_gateway_durations() {
        assert_eq!(parse("10s"), Ok(time::Duration::from_secs(10)));
        assert_eq!(parse("250ms"), Ok(time::Duration::from_millis(250)));
        assert_eq!(parse("1h30m"), Ok(time::Duration::from_secs(90 * 60)));
        assert_eq!(
            parse("1h2m3s4ms"),
            Ok(time::Duration::from_millis(3_723_004))
        );
        assert_eq!(parse("0s"), Ok(time::Duration::ZERO));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse(""), Err(ParseDurationError::Empty));
        assert_eq!(
            parse("s"),
            Err(ParseDurationError::NoNumber("s".to_string()))
        );
        assert_eq!(
            parse("10"),
            Err(ParseDurationError::InvalidUnit("".to_string()))
        );
        assert_eq!(
            parse("1.5s"),
            Err(ParseDurationError::InvalidUnit(".".to_string()))
        );
        assert_eq!(
            parse("100000s"),
            Err(ParseDurationError::TooManyDigits("100000".to_string()))
        );
        assert_eq!(
            parse("1d"),
            Err(ParseDurationError::InvalidUnit("d".to_string()))
        );
        assert_eq!(
            parse("1h1m1s1ms1s"),
            Err(ParseDurationError::TooManyComponents)
        );
    }

    #[test]
    fn displays_canonically() {
        let d = "90m".parse::<Duration>().unwrap();
        assert_eq!(d.to_string(), "1h30m");
        assert_eq!("1500ms".parse::<Duration>().unwrap().to_string(), "1s500ms");
    }
}
