//! Shared configuration types.

use core::fmt;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// A regular expression.
///
/// xDS regex matchers always match the entire input, so matching uses a copy
/// of the pattern anchored at both ends. The unanchored pattern is kept for
/// rewrites.
#[derive(Clone)]
pub struct Regex {
    full: regex::Regex,
    raw: regex::Regex,
}

impl Regex {
    /// Returns true if the regex matches the entire input.
    pub fn is_full_match(&self, s: &str) -> bool {
        self.full.is_match(s)
    }

    /// Replace every match of this regex in `s`.
    pub fn replace_all<'a>(&self, s: &'a str, substitution: &str) -> std::borrow::Cow<'a, str> {
        self.raw.replace_all(s, substitution)
    }

    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = regex::Regex::new(s).map_err(|e| e.to_string())?;
        let full = regex::Regex::new(&format!("^(?:{s})$")).map_err(|e| e.to_string())?;
        Ok(Self { full, raw })
    }
}

impl PartialEq for Regex {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Regex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D>(deserializer: D) -> Result<Regex, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RegexVisitor;

        impl<'de> Visitor<'de> for RegexVisitor {
            type Value = Regex;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a regular expression")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Regex::from_str(value)
                    .map_err(|e| E::custom(format!("could not parse {value}: {e}")))
            }
        }

        deserializer.deserialize_str(RegexVisitor)
    }
}

/// A wrapper around [std::time::Duration] that serializes to and from a f64
/// number of seconds.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(StdDuration);

impl Duration {
    pub const ZERO: Duration = Duration(StdDuration::ZERO);

    pub const fn new(secs: u64, nanos: u32) -> Duration {
        Duration(StdDuration::new(secs, nanos))
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration(StdDuration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration(StdDuration::from_millis(millis))
    }

    pub fn from_secs_f64(secs: f64) -> Duration {
        Duration(StdDuration::from_secs_f64(secs))
    }
}

impl std::ops::Deref for Duration {
    type Target = StdDuration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.as_secs_f64())
    }
}

impl From<Duration> for StdDuration {
    fn from(val: Duration) -> Self {
        val.0
    }
}

impl From<StdDuration> for Duration {
    fn from(duration: StdDuration) -> Self {
        Duration(duration)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration expressed as a number of seconds")
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a positive number"));
                }
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let v: u64 = v
                    .try_into()
                    .map_err(|_| E::custom("duration cannot be negative"))?;
                Ok(Duration::from_secs(v))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// The denominator of a [FractionalPercent].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Denominator {
    #[default]
    Hundred,
    TenThousand,
    Million,
}

impl Denominator {
    pub fn value(&self) -> u32 {
        match self {
            Denominator::Hundred => 100,
            Denominator::TenThousand => 10_000,
            Denominator::Million => 1_000_000,
        }
    }
}

/// A fraction of requests, expressed as a numerator over a fixed
/// denominator. Numerators larger than the denominator are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FractionalPercent {
    pub numerator: u32,

    #[serde(default)]
    pub denominator: Denominator,
}

impl FractionalPercent {
    pub const fn per_hundred(numerator: u32) -> Self {
        Self {
            numerator,
            denominator: Denominator::Hundred,
        }
    }

    pub const fn per_million(numerator: u32) -> Self {
        Self {
            numerator,
            denominator: Denominator::Million,
        }
    }

    /// This fraction, normalized to parts per million.
    pub fn parts_per_million(&self) -> u32 {
        let scale = 1_000_000 / self.denominator.value();
        self.numerator.min(self.denominator.value()) * scale
    }

    /// Returns `true` for the given random value in `[0, denominator)` if it
    /// falls inside this fraction.
    pub fn contains(&self, random: u32) -> bool {
        random < self.numerator.min(self.denominator.value())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_regex_full_match() {
        let re = Regex::from_str("foo|bar").unwrap();
        assert!(re.is_full_match("foo"));
        assert!(re.is_full_match("bar"));
        assert!(!re.is_full_match("foobar"));
        assert!(!re.is_full_match("xfoo"));
        assert_eq!(re.as_str(), "foo|bar");

        let re = Regex::from_str("a|ab").unwrap();
        assert!(re.is_full_match("ab"));
        assert_eq!(re.replace_all("cabbage", "_"), "c_bb_ge");

        assert!(Regex::from_str("(unclosed").is_err());
    }

    #[test]
    fn test_duration_deserialize() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Timeouts {
            float: Duration,
            int: Duration,
        }

        assert_eq!(
            serde_json::from_value::<Timeouts>(serde_json::json!({
                "float": 1.5,
                "int": 15,
            }))
            .unwrap(),
            Timeouts {
                float: Duration::from_millis(1500),
                int: Duration::from_secs(15),
            }
        );

        assert!(serde_json::from_value::<Duration>(serde_json::json!(-1)).is_err());
    }

    #[test]
    fn test_fractional_percent() {
        let ten = FractionalPercent::per_hundred(10);
        assert_eq!(ten.parts_per_million(), 100_000);
        assert!(ten.contains(9));
        assert!(!ten.contains(10));

        let over = FractionalPercent::per_hundred(250);
        assert_eq!(over.parts_per_million(), 1_000_000);

        let tiny = FractionalPercent::per_million(5);
        assert_eq!(tiny.parts_per_million(), 5);
    }
}
