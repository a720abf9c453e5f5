//! Human-readable duration wrapper used by manifests and queue descriptors.
//!
//! Serialized as a string like `"10s"`, `"1m30s"` or `"250ms"`. A zero
//! duration means "unbounded" everywhere it is used.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub const ZERO: HumanDuration = HumanDuration(Duration::ZERO);

    pub fn from_secs(secs: u64) -> Self {
        HumanDuration(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        HumanDuration(Duration::from_millis(millis))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        HumanDuration(d)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_ms = self.0.as_millis();
        if total_ms == 0 {
            return write!(f, "0s");
        }
        let hours = total_ms / 3_600_000;
        let minutes = (total_ms % 3_600_000) / 60_000;
        let seconds = (total_ms % 60_000) / 1_000;
        let millis = total_ms % 1_000;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        if seconds > 0 {
            write!(f, "{seconds}s")?;
        }
        if millis > 0 {
            write!(f, "{millis}ms")?;
        }
        Ok(())
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".into());
        }
        let mut total = Duration::ZERO;
        let mut digits = String::new();
        let mut chars = s.chars().peekable();
        let mut seen_unit = false;
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() || c == '.' {
                digits.push(c);
                continue;
            }
            let mut unit = String::from(c);
            // two-letter units: ms, us, ns
            if c == 'm' && chars.peek() == Some(&'s') {
                unit.push(chars.next().unwrap());
            } else if (c == 'u' || c == 'n') && chars.peek() == Some(&'s') {
                unit.push(chars.next().unwrap());
            }
            let value: f64 = digits
                .parse()
                .map_err(|_| format!("invalid number in duration {s:?}"))?;
            digits.clear();
            seen_unit = true;
            let step = match unit.as_str() {
                "h" => Duration::from_secs_f64(value * 3600.0),
                "m" => Duration::from_secs_f64(value * 60.0),
                "s" => Duration::from_secs_f64(value),
                "ms" => Duration::from_secs_f64(value / 1_000.0),
                "us" => Duration::from_secs_f64(value / 1_000_000.0),
                "ns" => Duration::from_secs_f64(value / 1_000_000_000.0),
                other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
            };
            total += step;
        }
        if !digits.is_empty() {
            // trailing bare number: "0" parses as zero, anything else is an error
            if digits == "0" && !seen_unit {
                return Ok(HumanDuration::ZERO);
            }
            return Err(format!("missing unit in duration {s:?}"));
        }
        if !seen_unit {
            return Err(format!("missing unit in duration {s:?}"));
        }
        Ok(HumanDuration(total))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
