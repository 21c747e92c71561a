use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};
use serde_json::{Number, Value};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Timestamp exactly as the telemetry source emitted it
///
/// The source mixes formats: epoch milliseconds, `YYYY-MM-DD HH:MM:SS`,
/// bare `HH:MM:SS`, or nothing at all. The raw form is kept around because
/// the sync watermark is echoed back to the source verbatim.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RawTimestamp {
    #[default]
    Missing,
    Number(Number),
    Date(DateTime<Utc>),
    Text(String),
}

impl RawTimestamp {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => RawTimestamp::Missing,
            Value::Number(n) => RawTimestamp::Number(n.clone()),
            Value::String(s) => RawTimestamp::Text(s.clone()),
            // bools, arrays, objects: keep the text so normalize() logs it
            other => RawTimestamp::Text(other.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RawTimestamp::Missing)
    }
}

impl Display for RawTimestamp {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            RawTimestamp::Missing => Ok(()),
            RawTimestamp::Number(n) => write!(f, "{}", n),
            RawTimestamp::Date(d) => write!(f, "{}", d.to_rfc3339()),
            RawTimestamp::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RawTimestamp {
    fn from(ms: i64) -> Self {
        RawTimestamp::Number(Number::from(ms))
    }
}

impl From<&str> for RawTimestamp {
    fn from(s: &str) -> Self {
        RawTimestamp::Text(s.to_string())
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(d: DateTime<Utc>) -> Self {
        RawTimestamp::Date(d)
    }
}

/// Source of "now" in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock pinned to a single instant (replay and tests)
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// Zone used to interpret wall-clock strings that carry no offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Zone {
    Local,
    Fixed(FixedOffset),
}

impl Zone {
    pub fn utc() -> Self {
        Zone::Fixed(Utc.fix())
    }
}

/// Converts heterogeneous timestamps to epoch milliseconds
///
/// # Rules (first match wins)
/// 1. missing → now
/// 2. number → unchanged (assumed epoch ms)
/// 3. date → its epoch ms
/// 4. `YYYY-MM-DD HH:MM:SS` → wall time in `zone`
/// 5. `HH:MM:SS` → wall time today in `zone`
/// 6. anything else → warn, now
///
/// Never fails: unreadable input degrades to the clock's current time.
#[derive(Clone)]
pub struct TimestampNormalizer {
    zone: Zone,
    clock: Arc<dyn Clock>,
}

impl TimestampNormalizer {
    pub fn new(zone: Zone, clock: Arc<dyn Clock>) -> Self {
        TimestampNormalizer { zone, clock }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn normalize(&self, ts: &RawTimestamp) -> i64 {
        match ts {
            RawTimestamp::Missing => self.now_ms(),
            RawTimestamp::Number(n) => self.normalize_number(n),
            RawTimestamp::Date(d) => d.timestamp_millis(),
            RawTimestamp::Text(s) => self.normalize_text(s),
        }
    }

    fn normalize_number(&self, n: &Number) -> i64 {
        if let Some(ms) = n.as_i64() {
            return ms;
        }
        match n.as_f64() {
            Some(ms) if ms.is_finite() && ms.abs() < i64::MAX as f64 => ms as i64,
            _ => {
                log::warn!("[TIME] Unusable numeric timestamp: {}", n);
                self.now_ms()
            }
        }
    }

    fn normalize_text(&self, s: &str) -> i64 {
        if has_shape(s, "dddd-dd-dd dd:dd:dd") {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                if let Some(ms) = self.resolve(&naive) {
                    return ms;
                }
            }
        } else if has_shape(s, "dd:dd:dd") {
            if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S") {
                let naive = self.today().and_time(time);
                if let Some(ms) = self.resolve(&naive) {
                    return ms;
                }
            }
        }

        log::warn!("[TIME] Unrecognized timestamp format: {:?}", s);
        self.now_ms()
    }

    fn resolve(&self, naive: &NaiveDateTime) -> Option<i64> {
        match self.zone {
            Zone::Local => resolve_in(&Local, naive),
            Zone::Fixed(offset) => resolve_in(&offset, naive),
        }
    }

    fn today(&self) -> NaiveDate {
        let now = DateTime::<Utc>::from_timestamp_millis(self.now_ms()).unwrap_or_else(Utc::now);
        match self.zone {
            Zone::Local => now.with_timezone(&Local).date_naive(),
            Zone::Fixed(offset) => now.with_timezone(&offset).date_naive(),
        }
    }
}

impl Default for TimestampNormalizer {
    fn default() -> Self {
        TimestampNormalizer::new(Zone::Local, Arc::new(SystemClock))
    }
}

// Ambiguous wall times (DST fold) take the earlier instant; skipped ones yield None.
fn resolve_in<Tz: TimeZone>(tz: &Tz, naive: &NaiveDateTime) -> Option<i64> {
    tz.from_local_datetime(naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// `d` matches an ASCII digit, any other byte must match literally.
fn has_shape(s: &str, pattern: &str) -> bool {
    s.len() == pattern.len()
        && s.bytes().zip(pattern.bytes()).all(|(c, p)| match p {
            b'd' => c.is_ascii_digit(),
            _ => c == p,
        })
}
