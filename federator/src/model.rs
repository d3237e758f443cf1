//! Stream identifiers, stream epochs, and routes.
//!
//! A stream is an FDSN SNCL selector (network, station, location,
//! channel pattern codes); a stream epoch binds a stream to a time
//! interval. Epochs are value objects: splitting produces new epochs,
//! nothing is mutated in place.

use std::fmt;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};
use url::Url;

use crate::errors::FederatorError;

const DATETIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    version = 2,
    "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
);
const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const OUTPUT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Parse an FDSN timestamp: date-time with optional fractional seconds
/// and optional trailing `Z`, or a bare date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, FederatorError> {
    let value = value.trim().trim_end_matches(['Z', 'z']);

    if let Ok(dt) = PrimitiveDateTime::parse(value, DATETIME_FORMAT) {
        return Ok(dt.assume_utc());
    }
    if let Ok(date) = Date::parse(value, DATE_FORMAT) {
        return Ok(date.midnight().assume_utc());
    }

    Err(FederatorError::InvalidQuery(format!(
        "invalid timestamp: {value:?}"
    )))
}

/// Render a timestamp in the second-resolution format used on selector
/// lines and in error bodies.
pub fn format_timestamp(value: OffsetDateTime) -> String {
    value.format(OUTPUT_FORMAT).expect("datetime format")
}

/// An FDSN stream selector: network, station, location, and channel
/// pattern codes (`*`/`?` wildcards and comma lists pass through
/// verbatim).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Stream {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl Stream {
    /// The `--` placeholder used on selector lines denotes a blank
    /// location code and is normalized away here.
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        let location = if location == "--" { "" } else { location };
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Location code as written on selector lines (`--` when blank).
    pub fn location_code(&self) -> &str {
        if self.location.is_empty() {
            "--"
        } else {
            &self.location
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network,
            self.station,
            self.location_code(),
            self.channel
        )
    }
}

/// A stream selector bound to a time interval. `end == None` means the
/// interval is open-ended and resolves against a default endtime (the
/// request arrival time) where a concrete bound is needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEpoch {
    pub stream: Stream,
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
}

impl StreamEpoch {
    pub fn new(
        stream: Stream,
        start: OffsetDateTime,
        end: Option<OffsetDateTime>,
    ) -> Result<Self, FederatorError> {
        if let Some(end) = end
            && start >= end
        {
            return Err(FederatorError::InvalidQuery(format!(
                "start {} is not before end {}",
                format_timestamp(start),
                format_timestamp(end)
            )));
        }

        Ok(Self { stream, start, end })
    }

    /// Parse a `NET STA LOC CHA START END` selector line.
    pub fn from_selector_line(line: &str) -> Result<Self, FederatorError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(FederatorError::InvalidQuery(format!(
                "expected `NET STA LOC CHA START END`, got {line:?}"
            )));
        }

        let stream = Stream::new(fields[0], fields[1], fields[2], fields[3]);
        let start = parse_timestamp(fields[4])?;
        let end = parse_timestamp(fields[5])?;
        Self::new(stream, start, Some(end))
    }

    /// Render as a selector line, substituting `default_end` for an open
    /// interval.
    pub fn selector_line(&self, default_end: OffsetDateTime) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.stream.network,
            self.stream.station,
            self.stream.location_code(),
            self.stream.channel,
            format_timestamp(self.start),
            format_timestamp(self.end.unwrap_or(default_end)),
        )
    }

    pub fn duration(&self, default_end: OffsetDateTime) -> Duration {
        self.end.unwrap_or(default_end) - self.start
    }

    /// Divide into `num` contiguous, non-overlapping sub-epochs covering
    /// the same interval. Sub-epochs get the floor duration; the final
    /// one absorbs the rounding remainder, so the union is exact.
    pub fn slice(&self, num: usize, default_end: OffsetDateTime) -> Vec<StreamEpoch> {
        if num < 2 {
            return vec![self.clone()];
        }

        let end = self.end.unwrap_or(default_end);
        let step = (end - self.start) / num as u32;

        let mut parts = Vec::with_capacity(num);
        let mut cursor = self.start;
        for i in 0..num {
            let next = if i == num - 1 { end } else { cursor + step };
            parts.push(StreamEpoch {
                stream: self.stream.clone(),
                start: cursor,
                end: Some(next),
            });
            cursor = next;
        }

        parts
    }

    /// Demand-driven splitting for payload-too-large handling: returns
    /// `[self]` when `factor < 2` or the resulting sub-epochs would be
    /// shorter than `min_duration`, which is the caller's signal to stop
    /// recursing and fail the epoch.
    pub fn split(
        &self,
        factor: usize,
        min_duration: Duration,
        default_end: OffsetDateTime,
    ) -> Vec<StreamEpoch> {
        if factor < 2 {
            return vec![self.clone()];
        }
        if self.duration(default_end) / (factor as u32) < min_duration {
            return vec![self.clone()];
        }

        self.slice(factor, default_end)
    }
}

impl fmt::Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.stream, format_timestamp(self.start))?;
        match self.end {
            Some(end) => write!(f, " {}", format_timestamp(end)),
            None => write!(f, " open"),
        }
    }
}

/// An archive endpoint URL paired with the stream epochs it serves.
/// Produced once per request by the routing client and never mutated;
/// re-splitting creates new epochs, not new routes.
#[derive(Clone, Debug)]
pub struct Route {
    pub url: Url,
    pub stream_epochs: Vec<StreamEpoch>,
}
