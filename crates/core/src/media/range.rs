//! Playback time ranges (RFC 2326 §3.5–3.7, §12.29).
//!
//! ```text
//! npt=0-10.5        play from the start up to 10.5 s
//! npt=now-          live, from the current position, open end
//! npt=00:01:02.5-   hh:mm:ss form
//! ```
//!
//! Only NPT ranges can be turned into clock times; the other units are
//! parsed and rendered but rejected by [`TimeRange::get_times`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MediaError, Result};
use crate::pipeline::ClockTime;

/// Unit of a [`TimeRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    /// Normal play time.
    Npt,
    /// SMPTE relative timestamps, 30 fps.
    Smpte,
    Smpte30Drop,
    Smpte25,
    /// Absolute UTC time.
    Clock,
}

impl RangeUnit {
    fn as_str(self) -> &'static str {
        match self {
            Self::Npt => "npt",
            Self::Smpte => "smpte",
            Self::Smpte30Drop => "smpte-30-drop",
            Self::Smpte25 => "smpte-25",
            Self::Clock => "clock",
        }
    }
}

impl fmt::Display for RangeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RangeUnit {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "npt" => Ok(Self::Npt),
            "smpte" => Ok(Self::Smpte),
            "smpte-30-drop" => Ok(Self::Smpte30Drop),
            "smpte-25" => Ok(Self::Smpte25),
            "clock" => Ok(Self::Clock),
            other => Err(MediaError::InvalidRange(format!("unknown unit '{other}'"))),
        }
    }
}

/// One bound of a [`TimeRange`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeTime {
    Seconds(f64),
    /// The current position of a live media.
    Now,
    /// Open end.
    End,
}

impl RangeTime {
    /// Seconds bound for a clock time, `End` when there is none.
    pub fn from_clock(time: Option<ClockTime>) -> Self {
        time.map_or(Self::End, |t| Self::Seconds(t.as_secs_f64()))
    }

    fn to_clock(self) -> Option<ClockTime> {
        match self {
            Self::Seconds(s) => Duration::try_from_secs_f64(s).ok(),
            _ => None,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let invalid = || MediaError::InvalidRange(format!("invalid time '{s}'"));
        let seconds = match s {
            "" => return Ok(Self::End),
            "now" => return Ok(Self::Now),
            _ if s.contains(':') => {
                let mut seconds = 0.0;
                for part in s.split(':') {
                    let value: f64 = part.parse().map_err(|_| invalid())?;
                    seconds = seconds * 60.0 + value;
                }
                seconds
            }
            _ => s.parse::<f64>().map_err(|_| invalid())?,
        };
        // Bounds must be representable as a clock time.
        Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
        Ok(Self::Seconds(seconds))
    }
}

impl fmt::Display for RangeTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds(s) => write!(f, "{s}"),
            Self::Now => write!(f, "now"),
            Self::End => Ok(()),
        }
    }
}

/// A playback range such as `npt=0-10.5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub unit: RangeUnit,
    pub min: RangeTime,
    pub max: RangeTime,
}

impl TimeRange {
    pub fn new(unit: RangeUnit, min: RangeTime, max: RangeTime) -> Self {
        Self { unit, min, max }
    }

    /// NPT range from clock times; a missing bound is open.
    pub fn npt(start: Option<ClockTime>, stop: Option<ClockTime>) -> Self {
        Self::new(
            RangeUnit::Npt,
            start.map_or(RangeTime::Now, |t| RangeTime::Seconds(t.as_secs_f64())),
            RangeTime::from_clock(stop),
        )
    }

    /// Start and stop as clock times. `now` and open bounds map to `None`.
    pub fn get_times(&self) -> Result<(Option<ClockTime>, Option<ClockTime>)> {
        if self.unit != RangeUnit::Npt {
            return Err(MediaError::UnsupportedRangeUnit(self.unit));
        }
        Ok((self.min.to_clock(), self.max.to_clock()))
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::new(RangeUnit::Npt, RangeTime::Now, RangeTime::End)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}-{}", self.unit, self.min, self.max)
    }
}

impl FromStr for TimeRange {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self> {
        let (unit, times) = s
            .trim()
            .split_once('=')
            .ok_or_else(|| MediaError::InvalidRange(s.to_string()))?;
        let unit: RangeUnit = unit.trim().parse()?;
        let (min, max) = times
            .split_once('-')
            .ok_or_else(|| MediaError::InvalidRange(s.to_string()))?;

        let min = match RangeTime::parse(min.trim())? {
            RangeTime::End => return Err(MediaError::InvalidRange(s.to_string())),
            min => min,
        };
        let max = match RangeTime::parse(max.trim())? {
            RangeTime::Now => return Err(MediaError::InvalidRange(s.to_string())),
            max => max,
        };
        Ok(Self { unit, min, max })
    }
}
