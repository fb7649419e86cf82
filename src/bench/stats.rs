//! Latency statistics and human-readable metric formatting.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Latency distribution over one measured run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    #[serde(with = "duration_string")]
    pub min: Duration,
    #[serde(with = "duration_string")]
    pub max: Duration,
    #[serde(with = "duration_string")]
    pub mean: Duration,
    #[serde(with = "duration_string")]
    pub p50: Duration,
    #[serde(with = "duration_string")]
    pub p95: Duration,
    #[serde(with = "duration_string")]
    pub p99: Duration,
}

impl LatencyStats {
    /// Compute the distribution from raw samples. The sample order is
    /// irrelevant; percentiles are order-independent.
    pub fn compute(samples: &mut [Duration]) -> Self {
        samples.sort_unstable();
        let mean = if samples.is_empty() {
            Duration::ZERO
        } else {
            samples.iter().sum::<Duration>() / samples.len() as u32
        };
        Self {
            min: samples.first().copied().unwrap_or(Duration::ZERO),
            max: samples.last().copied().unwrap_or(Duration::ZERO),
            mean,
            p50: percentile(samples, 50.0),
            p95: percentile(samples, 95.0),
            p99: percentile(samples, 99.0),
        }
    }

    /// (label, value) pairs in reporting order.
    pub fn metrics(&self) -> [(&'static str, Duration); 4] {
        [
            ("P50", self.p50),
            ("P95", self.p95),
            ("P99", self.p99),
            ("mean", self.mean),
        ]
    }
}

/// Linear-interpolation nearest-rank percentile over a sorted sample.
///
/// `rank = p/100 × (len-1)`; the result interpolates between the two
/// samples straddling the rank. A singleton sample is returned for any p;
/// an empty sample yields zero.
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    match sorted.len() {
        0 => return Duration::ZERO,
        1 => return sorted[0],
        _ => {}
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    if lo + 1 >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    let frac = rank - lo as f64;
    let a = sorted[lo].as_nanos() as f64;
    let b = sorted[lo + 1].as_nanos() as f64;
    Duration::from_nanos((a * (1.0 - frac) + b * frac).round() as u64)
}

/// Reviews per second over the measured wall time.
pub fn throughput(reviews: usize, wall: Duration) -> f64 {
    let secs = wall.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        reviews as f64 / secs
    }
}

/// Relative change in percent. A zero baseline with a non-zero current
/// reads as 100%; two zeros read as 0%.
pub fn delta_percent(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        if current == 0.0 { 0.0 } else { 100.0 }
    } else {
        (current - baseline) / baseline * 100.0
    }
}

/// Format a duration the way `Duration`'s Debug does ("1.25ms"), which
/// keeps full nanosecond precision and stays diff-friendly.
pub fn format_duration(d: Duration) -> String {
    format!("{d:?}")
}

/// Parse a duration written by [`format_duration`].
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, scale_ns) = if let Some(v) = s.strip_suffix("ns") {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix("µs").or_else(|| s.strip_suffix("us")) {
        (v, 1e3)
    } else if let Some(v) = s.strip_suffix("ms") {
        (v, 1e6)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1e9)
    } else {
        return Err(format!("'{s}' has no duration unit"));
    };
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("'{s}' is not a duration: {e}"))?;
    if value < 0.0 {
        return Err(format!("'{s}' is negative"));
    }
    Ok(Duration::from_nanos((value * scale_ns).round() as u64))
}

/// Humanize a byte count ("10.00 KB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Parse a humanized byte count back into a count. Two-decimal rounding
/// makes this approximate above the KB scale.
pub fn parse_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (value, unit) = s
        .split_once(' ')
        .ok_or_else(|| format!("'{s}' is not a byte count"))?;
    let value: f64 = value
        .parse()
        .map_err(|e| format!("'{s}' is not a byte count: {e}"))?;
    let scale: f64 = match unit {
        "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0_f64.powi(4),
        other => return Err(format!("unknown byte unit '{other}'")),
    };
    Ok((value * scale).round() as u64)
}

/// Serde adapter writing durations as human-readable strings.
pub mod duration_string {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter writing byte counts as human-readable strings.
pub mod bytes_string {
    use super::{format_bytes, parse_bytes};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_bytes(*bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        parse_bytes(&raw).map_err(serde::de::Error::custom)
    }
}
